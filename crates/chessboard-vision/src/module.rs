//! In-process resource graph built from a [`ModuleConfig`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::config::ModuleConfig;
use crate::file_camera::FileCamera;
use crate::resource::{ComponentConfig, Dependencies, Model};
use crate::service::CameraCalibrationService;
use crate::tracker::ChessboardTracker;
use crate::traits::{share, GenericService, PoseTracker, SharedCamera};
use crate::{Error, Result};

fn is_camera(model: &Model) -> bool {
    *model == Model::image_file_camera() || *model == Model::fake_chessboard_camera()
}

/// Validate one resource, returning its required and optional dependencies.
pub fn validate(config: &ComponentConfig) -> Result<(Vec<String>, Vec<String>)> {
    let model = &config.model;
    if *model == Model::chessboard() {
        ChessboardTracker::validate_config(config)
    } else if *model == Model::camera_calibration() {
        CameraCalibrationService::validate_config(config)
    } else if is_camera(model) {
        Ok((vec![], vec![]))
    } else {
        Err(Error::UnknownModel(model.to_string()))
    }
}

fn build_camera(config: &ComponentConfig) -> Result<SharedCamera> {
    if config.model == Model::image_file_camera() {
        return Ok(share(FileCamera::from_attributes(&config.name, &config.attributes)?));
    }
    #[cfg(feature = "mock")]
    {
        if config.model == Model::fake_chessboard_camera() {
            return Ok(share(crate::mock::MockCamera::from_attributes(
                &config.name,
                &config.attributes,
            )?));
        }
    }
    Err(Error::UnknownModel(config.model.to_string()))
}

#[derive(Default)]
pub struct Module {
    deps: Dependencies,
    trackers: HashMap<String, Arc<dyn PoseTracker>>,
    services: HashMap<String, Arc<dyn GenericService>>,
}

impl Module {
    /// Validates every resource, then builds cameras before the resources
    /// that depend on them.
    pub fn build(config: &ModuleConfig) -> Result<Self> {
        let all = config.components.iter().chain(&config.services);
        for resource in all.clone() {
            validate(resource)?;
        }

        let mut module = Self::default();
        for cfg in all.clone().filter(|c| is_camera(&c.model)) {
            module.deps.insert_camera(cfg.name.clone(), build_camera(cfg)?);
        }
        for cfg in all.filter(|c| !is_camera(&c.model)) {
            if cfg.model == Model::chessboard() {
                let tracker = ChessboardTracker::new(cfg, &module.deps)?;
                module.trackers.insert(cfg.name.clone(), Arc::new(tracker));
            } else if cfg.model == Model::camera_calibration() {
                let service = CameraCalibrationService::new(cfg)?;
                module.services.insert(cfg.name.clone(), Arc::new(service));
            }
        }
        info!(
            trackers = module.trackers.len(),
            services = module.services.len(),
            "module resources built"
        );
        Ok(module)
    }

    pub fn insert_camera(&mut self, name: impl Into<String>, camera: SharedCamera) {
        self.deps.insert_camera(name, camera);
    }

    pub fn insert_service(&mut self, name: impl Into<String>, service: Arc<dyn GenericService>) {
        self.services.insert(name.into(), service);
    }

    pub fn camera(&self, name: &str) -> Result<SharedCamera> {
        self.deps.camera(name)
    }

    pub fn pose_tracker(&self, name: &str) -> Result<Arc<dyn PoseTracker>> {
        self.trackers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pose tracker {name:?}")))
    }

    pub fn service(&self, name: &str) -> Result<Arc<dyn GenericService>> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("service {name:?}")))
    }

    /// The only service, when exactly one is configured.
    pub fn sole_service(&self) -> Option<Arc<dyn GenericService>> {
        match self.services.len() {
            1 => self.services.values().next().cloned(),
            _ => None,
        }
    }

    pub fn tracker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.trackers.keys().cloned().collect();
        names.sort();
        names
    }
}
