//! Agent directory layout.
//!
//! One `Paths` value is created at startup and threaded through every
//! constructor that touches disk. Layout under the base directory:
//!
//! ```text
//! <base>/config/<service>.conf    persisted per-service JSON config
//! <base>/data/                    spool directory
//! <base>/log/                     log files
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

const CONFIG_DIR: &str = "config";
const DATA_DIR: &str = "data";
const LOG_DIR: &str = "log";
const CONFIG_SUFFIX: &str = ".conf";

/// Errors from reading or writing persisted configs.
#[derive(Debug, Error)]
pub enum PathsError {
    #[error("config I/O: {0}")]
    Io(#[from] io::Error),
    #[error("config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Resolved agent directories.
#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    /// Resolves the base directory and creates the standard subdirectories.
    pub fn new(base: impl Into<PathBuf>) -> io::Result<Self> {
        let base = base.into();
        let paths = Self { base };
        fs::create_dir_all(paths.config_dir())?;
        fs::create_dir_all(paths.data_dir())?;
        fs::create_dir_all(paths.log_dir())?;
        Ok(paths)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base.join(CONFIG_DIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base.join(DATA_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base.join(LOG_DIR)
    }

    /// Path of the persisted config for `service`.
    pub fn service_config_file(&self, service: &str) -> PathBuf {
        self.config_dir().join(format!("{}{}", service, CONFIG_SUFFIX))
    }

    /// Reads a service config, or `None` if never persisted.
    pub fn read_service_config<T: DeserializeOwned>(
        &self,
        service: &str,
    ) -> Result<Option<T>, PathsError> {
        let file = self.service_config_file(service);
        let data = match fs::read(&file) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Persists a service config as pretty-printed JSON.
    pub fn write_service_config<T: Serialize>(
        &self,
        service: &str,
        config: &T,
    ) -> Result<(), PathsError> {
        let data = serde_json::to_vec_pretty(config)?;
        fs::write(self.service_config_file(service), data)?;
        Ok(())
    }

    /// Removes a persisted service config. Removing a config that does not
    /// exist is not an error.
    pub fn remove_service_config(&self, service: &str) -> Result<(), PathsError> {
        match fs::remove_file(self.service_config_file(service)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct FakeConfig {
        interval: u64,
    }

    #[test]
    fn new_creates_layout() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path().join("agent")).unwrap();
        assert!(paths.config_dir().is_dir());
        assert!(paths.data_dir().is_dir());
        assert!(paths.log_dir().is_dir());
    }

    #[test]
    fn service_config_round_trip() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path()).unwrap();

        assert!(paths
            .read_service_config::<FakeConfig>("qan")
            .unwrap()
            .is_none());

        paths
            .write_service_config("qan", &FakeConfig { interval: 60 })
            .unwrap();
        assert!(paths.service_config_file("qan").ends_with("config/qan.conf"));

        let got: FakeConfig = paths.read_service_config("qan").unwrap().unwrap();
        assert_eq!(got, FakeConfig { interval: 60 });
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path()).unwrap();
        paths
            .write_service_config("mm", &FakeConfig { interval: 1 })
            .unwrap();
        paths.remove_service_config("mm").unwrap();
        paths.remove_service_config("mm").unwrap();
        assert!(!paths.service_config_file("mm").exists());
    }
}
