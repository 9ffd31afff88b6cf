//! `viam:opencv:chessboard`: pose of a chessboard in a camera's frame.

use std::collections::HashMap;

use image::DynamicImage;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::chessboard::{generate_object_points, ChessboardDetector, ChessboardPattern};
use crate::config::{distortion_attr, pattern_attr, positive_number, require, string_attr, Attributes};
use crate::geometry::{rodrigues, Distortion, Pinhole};
use crate::image_io::{decode_image, to_gray};
use crate::orientation::matrix_to_ov;
use crate::pnp::solve_pnp;
use crate::resource::{ComponentConfig, Dependencies};
use crate::traits::{PoseTracker, SharedCamera};
use crate::{Error, Geometry, Pose, PoseInFrame, Result};

pub const CAMERA_ATTR: &str = "camera_name";
pub const PATTERN_ATTR: &str = "pattern_size";
pub const SQUARE_ATTR: &str = "square_size_mm";
pub const DISTORTION_ATTR: &str = "distortion";

/// The only body this tracker reports.
pub const POSE_KEY: &str = "pose";

#[derive(Debug, Clone, PartialEq)]
pub struct ChessboardConfig {
    pub camera_name: String,
    pub pattern: ChessboardPattern,
    pub square_size_mm: f64,
    /// Used when the camera does not report distortion.
    pub distortion: Option<Distortion>,
}

impl ChessboardConfig {
    pub fn from_attributes(attrs: &Attributes) -> Result<Self> {
        Ok(Self {
            camera_name: string_attr(attrs, CAMERA_ATTR)?,
            pattern: pattern_attr(attrs, PATTERN_ATTR)?,
            square_size_mm: positive_number(attrs, SQUARE_ATTR)?,
            distortion: distortion_attr(attrs, DISTORTION_ATTR)?,
        })
    }
}

pub struct ChessboardTracker {
    name: String,
    config: ChessboardConfig,
    camera: SharedCamera,
    detector: ChessboardDetector,
}

impl ChessboardTracker {
    /// Required and optional dependencies of `config`.
    pub fn validate_config(config: &ComponentConfig) -> Result<(Vec<String>, Vec<String>)> {
        let attrs = &config.attributes;
        let camera = require(attrs, CAMERA_ATTR)?;
        require(attrs, PATTERN_ATTR)?;
        require(attrs, SQUARE_ATTR)?;
        let camera = match camera {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok((vec![camera], vec![]))
    }

    pub fn new(config: &ComponentConfig, deps: &Dependencies) -> Result<Self> {
        let parsed = ChessboardConfig::from_attributes(&config.attributes)?;
        let camera = deps.camera(&parsed.camera_name)?;
        Ok(Self {
            name: config.name.clone(),
            config: parsed,
            camera,
            detector: ChessboardDetector::default(),
        })
    }

    pub fn reconfigure(&mut self, config: &ComponentConfig, deps: &Dependencies) -> Result<()> {
        let parsed = ChessboardConfig::from_attributes(&config.attributes)?;
        self.camera = deps.camera(&parsed.camera_name)?;
        self.name = config.name.clone();
        self.config = parsed;
        debug!(name = %self.name, camera = %self.config.camera_name, "chessboard tracker reconfigured");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChessboardConfig {
        &self.config
    }

    /// Camera model: intrinsics from the camera; distortion from the camera,
    /// else the `distortion` attribute, else none.
    pub fn camera_intrinsics(&self) -> Result<Pinhole> {
        let props = self
            .camera
            .lock()
            .map_err(|e| Error::Camera(e.to_string()))?
            .properties()?;
        let intrinsics = props.intrinsics.ok_or_else(|| {
            Error::Camera(format!(
                "camera {} does not report intrinsic parameters",
                self.config.camera_name
            ))
        })?;
        let distortion = match (&props.distortion, self.config.distortion) {
            (Some(coeffs), _) => Distortion::from_slice(coeffs)?,
            (None, Some(configured)) => configured,
            (None, None) => Distortion::zero(),
        };
        debug!(?intrinsics, ?distortion.coeffs, "camera intrinsics");
        Ok(Pinhole::new(&intrinsics, distortion))
    }

    fn latest_image(&self) -> Result<DynamicImage> {
        let images = self
            .camera
            .lock()
            .map_err(|e| Error::Camera(e.to_string()))?
            .images()?;
        for img in &images {
            match decode_image(&img.data) {
                Ok(decoded) => {
                    debug!(source = %img.source_name, mime = img.mime_type.as_str(), "found image from camera");
                    return Ok(decoded);
                }
                Err(e) => warn!(source = %img.source_name, error = %e, "skipping undecodable image"),
            }
        }
        let err = "Could not get latest image from camera";
        error!(camera = %self.config.camera_name, "{err}");
        Err(Error::Camera(err.to_string()))
    }

    /// Board pose in the camera frame, translation in millimetres.
    pub fn estimate_pose(&self) -> Result<Pose> {
        let gray = to_gray(&self.latest_image()?);
        let camera = self.camera_intrinsics()?;
        let corners = self.detector.detect(&gray, self.config.pattern).ok_or_else(|| {
            let err = "Could not find chessboard pattern in image";
            error!("{err}");
            Error::PatternNotFound(err.to_string())
        })?;
        debug!(corners = corners.len(), "found chessboard");

        let object = generate_object_points(self.config.pattern, self.config.square_size_mm);
        let (rvec, tvec) = solve_pnp(&object, &corners, &camera)?;
        debug!(?rvec, ?tvec, "solved pnp");

        let r = rodrigues(&rvec);
        let ov = matrix_to_ov(&r.transpose());
        debug!(o_x = ov.o_x, o_y = ov.o_y, o_z = ov.o_z, theta = ov.theta, "orientation vector");
        Ok(Pose {
            x: tvec.x,
            y: tvec.y,
            z: tvec.z,
            o_x: ov.o_x,
            o_y: ov.o_y,
            o_z: ov.o_z,
            theta: ov.theta,
        })
    }
}

impl PoseTracker for ChessboardTracker {
    fn get_poses(&self, body_names: &[String]) -> Result<HashMap<String, PoseInFrame>> {
        let mut poses = HashMap::new();
        if !body_names.is_empty() && !body_names.iter().any(|b| b == POSE_KEY) {
            debug!(?body_names, "no requested body is tracked");
            return Ok(poses);
        }
        let pose = self.estimate_pose()?;
        poses.insert(
            POSE_KEY.to_string(),
            PoseInFrame {
                reference_frame: self.config.camera_name.clone(),
                pose,
            },
        );
        Ok(poses)
    }

    fn do_command(&self, _command: &Map<String, Value>) -> Result<Map<String, Value>> {
        error!("`do_command` is not implemented");
        Err(Error::Unsupported("do_command is not implemented".to_string()))
    }

    fn get_geometries(&self) -> Result<Vec<Geometry>> {
        error!("`get_geometries` is not implemented");
        Err(Error::Unsupported("get_geometries is not implemented".to_string()))
    }
}
