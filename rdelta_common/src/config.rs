use crate::{Configuration, RDeltaError};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "rdelta.toml";

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Configuration,
    pub path: PathBuf,
    pub exists: bool,
}

/// Load the configuration from `path`, or from the per-user config directory
/// when no path is given. A missing default file yields the defaults; a
/// missing explicit file is an error.
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig, RDeltaError> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (default_config_path()?, false),
    };
    let exists = path.exists();

    if explicit && !exists {
        return Err(RDeltaError::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let config = if exists {
        let data = fs::read_to_string(&path)?;
        parse_config(&data)?
    } else {
        Configuration::default()
    };

    Ok(LoadedConfig {
        config,
        path,
        exists,
    })
}

pub fn parse_config(data: &str) -> Result<Configuration, RDeltaError> {
    toml::from_str(data).map_err(|e| RDeltaError::Serialization(e.to_string()))
}

pub fn save_config(path: &Path, config: &Configuration) -> Result<(), RDeltaError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let data = toml::to_string_pretty(config)
        .map_err(|e| RDeltaError::Serialization(e.to_string()))?;
    fs::write(path, data)?;
    Ok(())
}

pub fn default_config_path() -> Result<PathBuf, RDeltaError> {
    let dirs = ProjectDirs::from("", "aecs4u", "rdelta")
        .ok_or_else(|| RDeltaError::Config("Unable to determine config directory".to_string()))?;
    Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
}

impl Configuration {
    /// Reject policies that cannot drive a comparison
    pub fn validate(&self) -> Result<(), RDeltaError> {
        if !(1..=9).contains(&self.compression_level) {
            return Err(RDeltaError::Config(format!(
                "compression_level must be between 1 and 9, got {}",
                self.compression_level
            )));
        }

        if self.concurrency == 0 {
            return Err(RDeltaError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }

        if self.chunk_size == 0 {
            return Err(RDeltaError::Config("chunk_size must be positive".to_string()));
        }

        if let Some(ref dir) = self.backup_dir {
            if !dir.is_dir() {
                return Err(RDeltaError::Config(format!(
                    "backup_dir does not exist: {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }
}
