//! Bridge configuration file.
//!
//! ```yaml
//! retry_interval_secs: 10
//! join_grace_secs: 5
//! template_dir: /etc/avcontrol
//! devices:
//!   "Denon DN-500BD": { host: 192.168.178.30, port: 9030 }
//!   "Behringer X32": { host: 192.168.178.22, port: 10023 }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::conn::Endpoint;
use crate::dispatch::DispatchConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_retry")]
    pub retry_interval_secs: f64,
    #[serde(default = "default_grace")]
    pub join_grace_secs: f64,
    /// Directory holding `<template_key>.yaml` overrides.
    #[serde(default)]
    pub template_dir: Option<PathBuf>,
    /// Device name → endpoint. Only these devices get a worker.
    #[serde(default)]
    pub devices: IndexMap<String, Endpoint>,
}

fn default_retry() -> f64 {
    10.0
}

fn default_grace() -> f64 {
    5.0
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: default_retry(),
            join_grace_secs: default_grace(),
            template_dir: None,
            devices: IndexMap::new(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::read(path, e))?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::yaml(origin, e))
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            devices: self.devices.clone(),
            retry_interval: secs(self.retry_interval_secs),
            join_grace: secs(self.join_grace_secs),
            template_dir: self.template_dir.clone(),
        }
    }
}

/// Negative or non-finite values count as zero.
fn secs(v: f64) -> Duration {
    Duration::try_from_secs_f64(v).unwrap_or(Duration::ZERO)
}
