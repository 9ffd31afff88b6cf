//! chessboard-vision: chessboard detection, camera calibration and board
//! pose tracking on top of a small camera abstraction

mod types;
pub use types::{
    CameraIntrinsics, CameraProperties, Frame, Geometry, MimeType, NamedImage, PixelFormat, Pose,
    PoseInFrame,
};

mod error;
pub use error::{Error, Result};

mod traits;
pub use traits::{share, CameraSource, GenericService, PoseTracker, SharedCamera};

#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "mock")]
pub use mock::{render_chessboard, render_chessboard_png, BoardScene, MockCamera};

mod file_camera;
pub use file_camera::{FileCamera, FileCameraConfig};

pub mod image_io;

pub mod chessboard;
mod grid;
pub use chessboard::{
    detect_chessboard_corners, generate_object_points, ChessboardDetector, ChessboardPattern,
    DetectorParams,
};

pub mod geometry;
pub mod optim;

pub mod calib;
pub use calib::{calibrate_camera, mean_reprojection_error, CalibrationResult, DistortionModel};

mod pnp;
pub use pnp::solve_pnp;

pub mod orientation;
pub use orientation::{matrix_to_ov, ov_to_matrix, OrientationVector};

pub mod config;
pub use config::ModuleConfig;

pub mod resource;
pub use resource::{ComponentConfig, Dependencies, Model};

pub mod tracker;
pub use tracker::ChessboardTracker;

pub mod service;
pub use service::{CalibrationSummary, CameraCalibrationService};

mod module;
pub use module::{validate, Module};

/// Calibration pass storage
pub mod passes;
pub use passes::{capture_dir, extract_timestamp, PassStore};

#[cfg(feature = "watcher")]
pub mod watcher;
#[cfg(feature = "watcher")]
pub use watcher::{PassWatcher, WatcherHandle};
