//! Runtime-level configuration file.
//!
//! An embedding runtime may drive the engine entirely from code, or load
//! a TOML file like:
//!
//! ```toml
//! socket_path = "/var/run/nri/nri.sock"
//! disable_connections = false
//! locking = "per-pod"
//!
//! [validator]
//! reject_oci_hook_adjustment = true
//! required_plugins = ["device-injector"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adaptation::Options;
use crate::error::{Error, Result};
use crate::locking::LockingStrategy;
use crate::validator::ValidatorConfig;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: Option<PathBuf>,
    pub plugin_path: Option<PathBuf>,
    pub plugin_config_path: Option<PathBuf>,
    /// Refuse external plugin connections; only launched plugins run.
    pub disable_connections: bool,
    pub locking: LockingStrategy,
    pub registration_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    /// Enables the built-in validator with the given policies.
    pub validator: Option<ValidatorConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("configuration {}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> Result<Config> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Turn the file-level settings into engine options, filling in
    /// defaults for everything left unset.
    pub fn into_options(self) -> Options {
        let mut options = Options::default();
        if let Some(path) = self.socket_path {
            options.socket_path = path;
        }
        if let Some(path) = self.plugin_path {
            options.plugin_path = path;
        }
        if let Some(path) = self.plugin_config_path {
            options.plugin_config_path = path;
        }
        options.disable_connections = self.disable_connections;
        options.locking = self.locking;
        if let Some(ms) = self.registration_timeout_ms {
            options.registration_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.request_timeout_ms {
            options.request_timeout = Duration::from_millis(ms);
        }
        options.validator = self.validator;
        options
    }
}
