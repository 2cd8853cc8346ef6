//! Agent configuration.
//!
//! Configs merge by layering: defaults, then the persisted file, then
//! command-line flags, each applied with [`AgentConfig::apply`]. A key is
//! "set" when non-empty; empty strings and empty collections never
//! overwrite an earlier layer.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default control-plane host.
pub const DEFAULT_API_HOSTNAME: &str = "https://cloud-api.example.com";
/// Default log verbosity.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O: {0}")]
    Io(#[from] io::Error),
    #[error("config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid log level: {0}")]
    LogLevel(String),
}

/// Top-level agent options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AgentConfig {
    pub api_hostname: String,
    pub api_key: String,
    pub agent_uuid: String,
    pub pid_file: String,
    pub log_dir: String,
    pub log_level: String,
    pub data_dir: String,
    pub links: HashMap<String, String>,
    pub enable: Vec<String>,
    pub disable: Vec<String>,
}

impl AgentConfig {
    /// Built-in defaults, the bottom layer of every merge.
    pub fn defaults() -> Self {
        Self {
            api_hostname: DEFAULT_API_HOSTNAME.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            ..Self::default()
        }
    }

    /// Loads a config file; missing files yield an empty config.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = match fs::read(path.as_ref()) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    /// Overlays `other` onto `self`: only keys set in `other` overwrite.
    pub fn apply(&mut self, other: &AgentConfig) {
        fn set(dst: &mut String, src: &str) {
            if !src.is_empty() {
                *dst = src.to_string();
            }
        }
        set(&mut self.api_hostname, &other.api_hostname);
        set(&mut self.api_key, &other.api_key);
        set(&mut self.agent_uuid, &other.agent_uuid);
        set(&mut self.pid_file, &other.pid_file);
        set(&mut self.log_dir, &other.log_dir);
        set(&mut self.log_level, &other.log_level);
        set(&mut self.data_dir, &other.data_dir);
        if !other.links.is_empty() {
            self.links = other.links.clone();
        }
        if !other.enable.is_empty() {
            self.enable = other.enable.clone();
        }
        if !other.disable.is_empty() {
            self.disable = other.disable.clone();
        }
    }

    /// True when `feature` appears in the enable list.
    pub fn enabled(&self, feature: &str) -> bool {
        self.enable.iter().any(|f| f == feature)
    }

    /// True when `feature` appears in the disable list.
    pub fn disabled(&self, feature: &str) -> bool {
        self.disable.iter().any(|f| f == feature)
    }

    /// Maps the configured log level to a tracing filter directive.
    pub fn tracing_level(&self) -> Result<&'static str, ConfigError> {
        match self.log_level.as_str() {
            "" | "info" => Ok("info"),
            "debug" => Ok("debug"),
            "warning" => Ok("warn"),
            "error" => Ok("error"),
            other => Err(ConfigError::LogLevel(other.to_string())),
        }
    }
}
