use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    Gray8,
}

/// Raw decoded frame, row-major.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
    pub ts: Option<OffsetDateTime>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MimeType {
    Jpeg,
    Png,
    Bmp,
    Unknown,
}

impl MimeType {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => MimeType::Jpeg,
            "png" => MimeType::Png,
            "bmp" => MimeType::Bmp,
            _ => MimeType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::Jpeg => "image/jpeg",
            MimeType::Png => "image/png",
            MimeType::Bmp => "image/bmp",
            MimeType::Unknown => "application/octet-stream",
        }
    }
}

/// Encoded image as returned by a camera.
#[derive(Clone, Debug)]
pub struct NamedImage {
    pub source_name: String,
    pub mime_type: MimeType,
    pub data: Vec<u8>,
    pub ts: Option<OffsetDateTime>,
}

/// Pinhole intrinsics in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    #[serde(default)]
    pub width_px: u32,
    #[serde(default)]
    pub height_px: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraProperties {
    pub intrinsics: Option<CameraIntrinsics>,
    /// OpenCV order: k1 k2 p1 p2 k3 [k4 k5 k6].
    pub distortion: Option<Vec<f64>>,
}

/// Position in millimetres plus an orientation vector with theta in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub o_x: f64,
    pub o_y: f64,
    pub o_z: f64,
    pub theta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseInFrame {
    pub reference_frame: String,
    pub pose: Pose,
}

/// A labelled shape attached to a resource, located by `center`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub label: String,
    pub center: Pose,
}
