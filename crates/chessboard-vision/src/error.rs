use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing required {0} attribute.")]
    MissingAttribute(&'static str),
    #[error("invalid attribute {name}: {reason}")]
    InvalidAttribute { name: &'static str, reason: String },
    #[error("missing dependency: {0}")]
    MissingDependency(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("image decode error: {0}")]
    Decode(String),
    #[error("{0}")]
    PatternNotFound(String),
    #[error("{0}")]
    InsufficientViews(String),
    #[error("numerical error: {0}")]
    Numerical(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("camera error: {0}")]
    Camera(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Decode(e.to_string())
    }
}
