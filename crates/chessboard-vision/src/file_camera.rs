use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::debug;

use crate::{CameraIntrinsics, CameraProperties, CameraSource, Error, MimeType, NamedImage, Result};

/// Attributes of the `image-file` camera model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCameraConfig {
    /// An image file, or a directory whose images are served in name order.
    pub path: PathBuf,
    #[serde(default)]
    pub intrinsics: Option<CameraIntrinsics>,
    #[serde(default)]
    pub distortion: Vec<f64>,
}

fn mime_of(path: &Path) -> MimeType {
    path.extension()
        .and_then(|e| e.to_str())
        .map(MimeType::from_extension)
        .unwrap_or(MimeType::Unknown)
}

/// Camera backed by image files on disk.
pub struct FileCamera {
    name: String,
    files: Vec<PathBuf>,
    next: usize,
    intrinsics: Option<CameraIntrinsics>,
    distortion: Vec<f64>,
}

impl FileCamera {
    pub fn open(name: impl Into<String>, config: FileCameraConfig) -> Result<Self> {
        let files = if config.path.is_dir() {
            let mut files = Vec::new();
            for entry in fs::read_dir(&config.path)? {
                let path = entry?.path();
                if path.is_file() && mime_of(&path) != MimeType::Unknown {
                    files.push(path);
                }
            }
            files.sort();
            files
        } else if config.path.is_file() {
            vec![config.path.clone()]
        } else {
            Vec::new()
        };
        if files.is_empty() {
            return Err(Error::NotFound(format!(
                "no images at {}",
                config.path.display()
            )));
        }
        debug!(count = files.len(), path = %config.path.display(), "file camera opened");
        Ok(Self {
            name: name.into(),
            files,
            next: 0,
            intrinsics: config.intrinsics,
            distortion: config.distortion,
        })
    }

    pub fn from_attributes(name: impl Into<String>, attributes: &Map<String, Value>) -> Result<Self> {
        if !attributes.contains_key("path") {
            return Err(Error::MissingAttribute("path"));
        }
        let config: FileCameraConfig = serde_json::from_value(Value::Object(attributes.clone()))?;
        Self::open(name, config)
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl CameraSource for FileCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn images(&mut self) -> Result<Vec<NamedImage>> {
        let path = &self.files[self.next % self.files.len()];
        self.next += 1;
        let data = fs::read(path)?;
        Ok(vec![NamedImage {
            source_name: self.name.clone(),
            mime_type: mime_of(path),
            data,
            ts: Some(OffsetDateTime::now_utc()),
        }])
    }

    fn properties(&self) -> Result<CameraProperties> {
        Ok(CameraProperties {
            intrinsics: self.intrinsics,
            distortion: (!self.distortion.is_empty()).then(|| self.distortion.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_directory_images_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.png"), b"second").unwrap();
        fs::write(dir.path().join("a.jpg"), b"first").unwrap();
        fs::write(dir.path().join("notes.txt"), b"skip").unwrap();
        let config = FileCameraConfig {
            path: dir.path().to_path_buf(),
            intrinsics: None,
            distortion: vec![],
        };
        let mut cam = FileCamera::open("files", config).unwrap();
        assert_eq!(cam.files().len(), 2);
        let first = cam.images().unwrap();
        assert_eq!(first[0].data, b"first");
        assert_eq!(first[0].mime_type, MimeType::Jpeg);
        assert_eq!(cam.images().unwrap()[0].mime_type, MimeType::Png);
        assert_eq!(cam.images().unwrap()[0].data, b"first");
    }

    #[test]
    fn missing_path_attribute() {
        let attrs = Map::new();
        assert!(matches!(
            FileCamera::from_attributes("files", &attrs),
            Err(Error::MissingAttribute("path"))
        ));
    }

    #[test]
    fn empty_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileCameraConfig {
            path: dir.path().to_path_buf(),
            intrinsics: None,
            distortion: vec![],
        };
        assert!(matches!(FileCamera::open("files", config), Err(Error::NotFound(_))));
    }
}
