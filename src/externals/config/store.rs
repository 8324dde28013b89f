use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::AppConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config root must be a JSON object.")]
    NotAnObject,

    #[error("Config store lock poisoned.")]
    Poisoned,

    #[error("Invalid config: {0}.")]
    Invalid(&'static str),
}

/// Where the configuration lives. Only the scheduler writes to it, and only
/// from its own task.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<AppConfig, ConfigError>;

    /// Persist the laser offset so it survives a restart.
    fn write_laser_offset(&self, offset: f64) -> Result<(), ConfigError>;
}

/// Configuration kept in a JSON file.
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_text(&self) -> Result<String, ConfigError> {
        fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl ConfigStore for JsonConfigStore {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn load(&self) -> Result<AppConfig, ConfigError> {
        let config: AppConfig = serde_json::from_str(&self.read_text()?)?;
        config.validate()?;
        info!("Loaded config '{}'.", config.name);
        Ok(config)
    }

    /// Only touches the `laser_offset` key; keys this build doesn't know
    /// about are written back unchanged.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn write_laser_offset(&self, offset: f64) -> Result<(), ConfigError> {
        let mut document: Value = serde_json::from_str(&self.read_text()?)?;
        let Some(root) = document.as_object_mut() else {
            return Err(ConfigError::NotAnObject);
        };
        root.insert("laser_offset".into(), Value::from(offset));
        let text = serde_json::to_string_pretty(&document)?;
        fs::write(&self.path, text).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!("Wrote laser offset {}.", offset);
        Ok(())
    }
}

/// Configuration that lives only as long as the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    config: Arc<Mutex<AppConfig>>,
}

impl MemoryConfigStore {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<AppConfig, ConfigError> {
        let config = self.config.lock().map_err(|_| ConfigError::Poisoned)?;
        Ok(config.clone())
    }

    fn write_laser_offset(&self, offset: f64) -> Result<(), ConfigError> {
        let mut config = self.config.lock().map_err(|_| ConfigError::Poisoned)?;
        config.laser_offset = offset;
        Ok(())
    }
}
