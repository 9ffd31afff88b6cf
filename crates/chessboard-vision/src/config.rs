//! Attribute parsing and the module configuration file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::chessboard::ChessboardPattern;
use crate::geometry::Distortion;
use crate::resource::ComponentConfig;
use crate::{Error, Result};

pub type Attributes = Map<String, Value>;

/// Present and not null.
pub(crate) fn require<'a>(attrs: &'a Attributes, name: &'static str) -> Result<&'a Value> {
    match attrs.get(name) {
        None | Some(Value::Null) => Err(Error::MissingAttribute(name)),
        Some(v) => Ok(v),
    }
}

pub(crate) fn string_attr(attrs: &Attributes, name: &'static str) -> Result<String> {
    match require(attrs, name)? {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        other => Err(Error::InvalidAttribute {
            name,
            reason: format!("expected a non-empty string, got {other}"),
        }),
    }
}

pub(crate) fn positive_number(attrs: &Attributes, name: &'static str) -> Result<f64> {
    match require(attrs, name)?.as_f64() {
        Some(v) if v > 0.0 && v.is_finite() => Ok(v),
        _ => Err(Error::InvalidAttribute {
            name,
            reason: "expected a positive number".to_string(),
        }),
    }
}

/// `[cols, rows]`. Whole-valued floats are accepted, as struct-typed
/// attributes carry every number as a double.
pub(crate) fn pattern_attr(attrs: &Attributes, name: &'static str) -> Result<ChessboardPattern> {
    let invalid = |reason: String| Error::InvalidAttribute { name, reason };
    let list = require(attrs, name)?
        .as_array()
        .ok_or_else(|| invalid("expected a list of two integers".to_string()))?;
    let dims = list
        .iter()
        .map(|v| match v.as_f64() {
            Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as usize),
            _ => Err(invalid(format!("{v} is not a whole number"))),
        })
        .collect::<Result<Vec<_>>>()?;
    match dims.as_slice() {
        [cols, rows] => ChessboardPattern::new(*cols, *rows),
        _ => Err(invalid(format!("expected 2 values, got {}", dims.len()))),
    }
}

pub(crate) fn distortion_attr(attrs: &Attributes, name: &'static str) -> Result<Option<Distortion>> {
    match attrs.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let coeffs: Vec<f64> = serde_json::from_value(v.clone()).map_err(|e| {
                Error::InvalidAttribute {
                    name,
                    reason: e.to_string(),
                }
            })?;
            Distortion::from_slice(&coeffs).map(Some)
        }
    }
}

/// Resources to run in-process, as read from `--config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
    #[serde(default)]
    pub services: Vec<ComponentConfig>,
}

impl ModuleConfig {
    /// JSON when the extension is `.json`, YAML otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let cfg = if is_json {
            Self::from_json_str(&raw)?
        } else {
            Self::from_yaml_str(&raw)?
        };
        debug!(
            path = %path.display(),
            components = cfg.components.len(),
            services = cfg.services.len(),
            "loaded module config"
        );
        Ok(cfg)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
