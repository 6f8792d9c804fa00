//! Daemon configuration.
//!
//! One TOML file supplies every knob; each key can also be set through an
//! environment variable of the same name uppercased with a
//! `FLUID_SETTINGS_` prefix, and the command line overrides both.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("cannot parse config file {path}: {reason}")]
    Unparseable { path: String, reason: String },
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bus endpoint the daemon registers with.
    pub bus: String,
    /// Endpoint other fluid-settings daemons connect to.
    pub listen: String,
    /// Where the settings live on disk.
    pub settings: PathBuf,
    /// Colon-separated search path for `*.ini` definition files.
    pub definitions: String,
    /// Seconds of quiet time before a mutation is flushed to disk.
    pub save_timeout: u64,
    /// Seconds between gossip broadcasts.
    pub gossip_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: "127.0.0.1:4050".to_string(),
            listen: "127.0.0.1:4051".to_string(),
            settings: PathBuf::from("/var/lib/fluid-settings/settings/settings.conf"),
            definitions: concat!(
                "/usr/share/fluid-settings/definitions",
                ":/var/lib/fluid-settings/definitions"
            )
            .to_string(),
            save_timeout: 5,
            gossip_timeout: 60,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config: Config =
            toml::from_str(&contents).map_err(|e| ConfigError::Unparseable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bus) = std::env::var("FLUID_SETTINGS_BUS") {
            self.bus = bus;
        }
        if let Ok(listen) = std::env::var("FLUID_SETTINGS_LISTEN") {
            self.listen = listen;
        }
        if let Ok(settings) = std::env::var("FLUID_SETTINGS_SETTINGS") {
            self.settings = PathBuf::from(settings);
        }
        if let Ok(definitions) = std::env::var("FLUID_SETTINGS_DEFINITIONS") {
            self.definitions = definitions;
        }
        if let Ok(save) = std::env::var("FLUID_SETTINGS_SAVE_TIMEOUT") {
            match save.parse() {
                Ok(save) => self.save_timeout = save,
                Err(_) => tracing::warn!("ignoring bad FLUID_SETTINGS_SAVE_TIMEOUT {save:?}"),
            }
        }
        if let Ok(gossip) = std::env::var("FLUID_SETTINGS_GOSSIP_TIMEOUT") {
            match gossip.parse() {
                Ok(gossip) => self.gossip_timeout = gossip,
                Err(_) => tracing::warn!("ignoring bad FLUID_SETTINGS_GOSSIP_TIMEOUT {gossip:?}"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.save_timeout == 0 {
            return Err(ConfigError::Invalid {
                reason: "save_timeout must be a positive number of seconds".into(),
            });
        }
        if self.gossip_timeout == 0 {
            return Err(ConfigError::Invalid {
                reason: "gossip_timeout must be a positive number of seconds".into(),
            });
        }
        if self.listen.is_empty() || self.bus.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "bus and listen endpoints must not be empty".into(),
            });
        }
        Ok(())
    }
}
