use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::{CameraProperties, Geometry, NamedImage, PoseInFrame, Result};

pub trait CameraSource: Send {
    /// Resource name, used as the reference frame of reported poses.
    fn name(&self) -> &str;

    /// Latest set of images, one per sensor.
    fn images(&mut self) -> Result<Vec<NamedImage>>;

    /// Intrinsic and distortion parameters, if known.
    fn properties(&self) -> Result<CameraProperties>;
}

pub type SharedCamera = Arc<Mutex<dyn CameraSource>>;

pub fn share<C: CameraSource + 'static>(camera: C) -> SharedCamera {
    Arc::new(Mutex::new(camera))
}

pub trait PoseTracker: Send + Sync {
    /// Poses keyed by body name. An empty `body_names` asks for every body.
    fn get_poses(&self, body_names: &[String]) -> Result<HashMap<String, PoseInFrame>>;

    fn do_command(&self, command: &Map<String, Value>) -> Result<Map<String, Value>>;

    fn get_geometries(&self) -> Result<Vec<Geometry>>;
}

pub trait GenericService: Send + Sync {
    fn do_command(&self, command: &Map<String, Value>) -> Result<Map<String, Value>>;
}
