use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::traits::SharedCamera;
use crate::{Error, Result};

/// Resource model triplet, written `namespace:family:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Model {
    pub namespace: String,
    pub family: String,
    pub name: String,
}

impl Model {
    pub fn new(namespace: &str, family: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            family: family.to_string(),
            name: name.to_string(),
        }
    }

    pub fn chessboard() -> Self {
        Self::new("viam", "opencv", "chessboard")
    }

    pub fn camera_calibration() -> Self {
        Self::new("viam", "opencv", "camera-calibration")
    }

    pub fn image_file_camera() -> Self {
        Self::new("viam", "camera", "image-file")
    }

    pub fn fake_chessboard_camera() -> Self {
        Self::new("viam", "camera", "fake-chessboard")
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.family, self.name)
    }
}

impl FromStr for Model {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [ns, family, name] if !ns.is_empty() && !family.is_empty() && !name.is_empty() => {
                Ok(Self::new(ns, family, name))
            }
            _ => Err(Error::InvalidAttribute {
                name: "model",
                reason: format!("expected namespace:family:name, got {s:?}"),
            }),
        }
    }
}

impl TryFrom<String> for Model {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Model> for String {
    fn from(m: Model) -> Self {
        m.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    pub model: Model,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ComponentConfig {
    pub fn new(name: impl Into<String>, model: Model, attributes: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            model,
            attributes,
        }
    }
}

/// Resolved dependencies, by resource name.
#[derive(Clone, Default)]
pub struct Dependencies {
    cameras: HashMap<String, SharedCamera>,
}

impl Dependencies {
    pub fn insert_camera(&mut self, name: impl Into<String>, camera: SharedCamera) {
        self.cameras.insert(name.into(), camera);
    }

    pub fn camera(&self, name: &str) -> Result<SharedCamera> {
        self.cameras
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingDependency(format!("camera {name:?}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cameras.contains_key(name)
    }
}
