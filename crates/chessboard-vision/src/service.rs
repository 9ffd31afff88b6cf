//! `viam:opencv:camera-calibration`: intrinsic calibration driven through
//! `do_command`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::calib::{calibrate_camera, mean_reprojection_error, DistortionModel, MIN_VIEWS};
use crate::chessboard::{generate_object_points, ChessboardDetector, ChessboardPattern};
use crate::config::{pattern_attr, positive_number, require, Attributes};
use crate::image_io::{decode_base64_image, to_gray};
use crate::resource::ComponentConfig;
use crate::traits::GenericService;
use crate::{Error, Result};

pub const PATTERN_ATTR: &str = "pattern_size";
pub const SQUARE_ATTR: &str = "square_size_mm";
pub const CALIBRATE_COMMAND: &str = "calibrate_camera";

const MISSING_IMAGES: &str =
    "Missing required 'images' parameter. Must be a list of base64 encoded image strings.";
const NO_IMAGES: &str = "At least one image is required for calibration.";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraMatrix {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistortionCoefficients {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

/// Successful `calibrate_camera` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub success: bool,
    pub rms_error: f64,
    pub reprojection_error: f64,
    pub num_images: usize,
    pub image_size: ImageSize,
    pub camera_matrix: CameraMatrix,
    pub distortion_coefficients: DistortionCoefficients,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationServiceConfig {
    pub pattern: ChessboardPattern,
    pub square_size_mm: f64,
}

impl CalibrationServiceConfig {
    pub fn from_attributes(attrs: &Attributes) -> Result<Self> {
        Ok(Self {
            pattern: pattern_attr(attrs, PATTERN_ATTR)?,
            square_size_mm: positive_number(attrs, SQUARE_ATTR)?,
        })
    }
}

pub struct CameraCalibrationService {
    name: String,
    config: CalibrationServiceConfig,
    detector: ChessboardDetector,
    model: DistortionModel,
}

impl CameraCalibrationService {
    pub fn validate_config(config: &ComponentConfig) -> Result<(Vec<String>, Vec<String>)> {
        require(&config.attributes, PATTERN_ATTR)?;
        require(&config.attributes, SQUARE_ATTR)?;
        Ok((vec![], vec![]))
    }

    pub fn new(config: &ComponentConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            config: CalibrationServiceConfig::from_attributes(&config.attributes)?,
            detector: ChessboardDetector::default(),
            model: DistortionModel::default(),
        })
    }

    pub fn reconfigure(&mut self, config: &ComponentConfig) -> Result<()> {
        self.config = CalibrationServiceConfig::from_attributes(&config.attributes)?;
        self.name = config.name.clone();
        Ok(())
    }

    pub fn with_model(mut self, model: DistortionModel) -> Self {
        self.model = model;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Detect the board in every image and calibrate from the views where
    /// it was found. Undecodable images and misses are skipped.
    pub fn calibrate_from_images(&self, images: &[Value]) -> Result<CalibrationSummary> {
        let total = images.len();
        info!(total, "starting camera calibration");
        let pattern = self.config.pattern;
        let mut object_points = Vec::new();
        let mut image_points = Vec::new();
        let mut image_size = None;

        for (idx, encoded) in images.iter().enumerate() {
            let n = idx + 1;
            let Some(encoded) = encoded.as_str() else {
                warn!("Image {n}: expected a base64 string");
                continue;
            };
            let rgb = match decode_base64_image(encoded) {
                Ok(img) => img,
                Err(e) => {
                    warn!("Image {n}: Failed to decode base64 image: {e}");
                    continue;
                }
            };
            let size = *image_size.get_or_insert(ImageSize {
                width: rgb.width(),
                height: rgb.height(),
            });
            if (rgb.width(), rgb.height()) != (size.width, size.height) {
                warn!(
                    "Image {n}: size {}x{} differs from {}x{}",
                    rgb.width(),
                    rgb.height(),
                    size.width,
                    size.height
                );
                continue;
            }
            let gray = to_gray(&image::DynamicImage::ImageRgb8(rgb));
            let Some(corners) = self.detector.detect(&gray, pattern) else {
                warn!("Image {n}: Could not find chessboard pattern");
                continue;
            };
            object_points.push(generate_object_points(pattern, self.config.square_size_mm));
            image_points.push(corners);
            info!(
                "Successfully processed image {}/{total} (image {n})",
                image_points.len()
            );
        }

        let found = image_points.len();
        let size = match image_size {
            Some(size) if found >= MIN_VIEWS => size,
            _ => {
                return Err(Error::InsufficientViews(format!(
                    "Only found chessboard pattern in {found}/{total} images. Need at least {MIN_VIEWS} valid images for calibration."
                )))
            }
        };

        info!("Running camera calibration...");
        let result = calibrate_camera(&object_points, &image_points, (size.width, size.height), self.model)?;
        let reprojection_error = mean_reprojection_error(&object_points, &image_points, &result);
        info!("Calibration complete with RMS error: {:.6}", result.rms_error);
        info!("Mean re-projection error: {reprojection_error:.6}");

        let cam = result.camera();
        let d = cam.distortion;
        Ok(CalibrationSummary {
            success: true,
            rms_error: result.rms_error,
            reprojection_error,
            num_images: found,
            image_size: size,
            camera_matrix: CameraMatrix {
                fx: cam.fx,
                fy: cam.fy,
                cx: cam.cx,
                cy: cam.cy,
            },
            distortion_coefficients: DistortionCoefficients {
                k1: d.k1(),
                k2: d.k2(),
                p1: d.p1(),
                p2: d.p2(),
                k3: d.k3(),
            },
        })
    }

    fn handle_calibrate(&self, params: &Value) -> Map<String, Value> {
        let images = match params {
            Value::Null => None,
            other => other.get("images").and_then(Value::as_array),
        };
        let reply = match images {
            None => failure(MISSING_IMAGES),
            Some(images) if images.is_empty() => failure(NO_IMAGES),
            Some(images) => match self
                .calibrate_from_images(images)
                .and_then(|summary| Ok(serde_json::to_value(summary)?))
            {
                Ok(v) => v,
                Err(e) => {
                    error!("camera calibration failed: {e}");
                    failure(&e.to_string())
                }
            },
        };
        match reply {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

fn failure(message: &str) -> Value {
    json!({"success": false, "error": message})
}

impl GenericService for CameraCalibrationService {
    fn do_command(&self, command: &Map<String, Value>) -> Result<Map<String, Value>> {
        if let Some(params) = command.get(CALIBRATE_COMMAND) {
            return Ok(self.handle_calibrate(params));
        }
        let keys: Vec<&String> = command.keys().collect();
        error!("unknown command: {keys:?}");
        Err(Error::Unsupported(format!("command not supported: {keys:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Model;

    fn service() -> CameraCalibrationService {
        let attrs = json!({"pattern_size": [9, 6], "square_size_mm": 30});
        let cfg = ComponentConfig::new(
            "calib",
            Model::camera_calibration(),
            attrs.as_object().cloned().unwrap(),
        );
        CameraCalibrationService::new(&cfg).unwrap()
    }

    fn command(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn validate_checks_pattern_then_square_size() {
        let cfg = ComponentConfig::new("c", Model::camera_calibration(), Map::new());
        let err = CameraCalibrationService::validate_config(&cfg).unwrap_err();
        assert_eq!(err.to_string(), "Missing required pattern_size attribute.");
        let cfg = ComponentConfig::new("c", Model::camera_calibration(), command(json!({"pattern_size": [9, 6]})));
        let err = CameraCalibrationService::validate_config(&cfg).unwrap_err();
        assert_eq!(err.to_string(), "Missing required square_size_mm attribute.");
    }

    #[test]
    fn missing_images_parameter() {
        let svc = service();
        for params in [json!(null), json!({}), json!({"images": "abc"})] {
            let reply = svc.do_command(&command(json!({"calibrate_camera": params}))).unwrap();
            assert_eq!(reply["success"], json!(false));
            assert_eq!(reply["error"], json!(MISSING_IMAGES));
        }
    }

    #[test]
    fn empty_image_list() {
        let reply = service()
            .do_command(&command(json!({"calibrate_camera": {"images": []}})))
            .unwrap();
        assert_eq!(reply["error"], json!(NO_IMAGES));
    }

    #[test]
    fn undecodable_images_count_as_misses() {
        let reply = service()
            .do_command(&command(json!({"calibrate_camera": {"images": ["not-an-image", "data:image/png;base64,AAAA", 7]}})))
            .unwrap();
        assert_eq!(reply["success"], json!(false));
        assert_eq!(
            reply["error"],
            json!("Only found chessboard pattern in 0/3 images. Need at least 3 valid images for calibration.")
        );
    }

    #[test]
    fn unknown_command_is_unsupported() {
        let err = service().do_command(&command(json!({"bogus": 1}))).unwrap_err();
        assert_eq!(err.to_string(), "command not supported: [\"bogus\"]");
    }
}
