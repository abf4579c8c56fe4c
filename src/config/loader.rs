use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use super::{BridgeConfig, CONFIG_FILE_NAME};
use crate::error::{Error, Result};

/// Resolves configuration: defaults, then a TOML file, then the environment.
/// Command-line overrides are applied by the caller on the returned value.
pub struct ConfigLoader {
    explicit: Option<PathBuf>,
    search_dirs: Vec<PathBuf>,
}

impl ConfigLoader {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        let mut search_dirs = vec![PathBuf::from(".")];
        if let Some(dir) = global_config_dir() {
            search_dirs.push(dir);
        }
        Self {
            explicit,
            search_dirs,
        }
    }

    /// Only look for the config file in `dirs` (in order)
    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = dirs;
        self
    }

    /// The file that will be read, if any
    pub fn locate(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.explicit {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        Ok(self
            .search_dirs
            .iter()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|path| path.is_file()))
    }

    pub fn load(&self) -> Result<BridgeConfig> {
        let mut config = match self.locate()? {
            Some(path) => {
                tracing::debug!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => {
                tracing::debug!("No {} found, using defaults", CONFIG_FILE_NAME);
                BridgeConfig::new()
            }
        };

        config.merge_env_vars()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<BridgeConfig> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<BridgeConfig> {
        Ok(toml::from_str(content)?)
    }
}

/// Platform config directory, e.g. `~/.config/whisper-bridge`
pub fn global_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "whisper-bridge").map(|dirs| dirs.config_dir().to_path_buf())
}
