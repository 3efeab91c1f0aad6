//! Runtime configuration I/O operations.
//!
//! System directory detection and config loading. Kept apart from config.rs so
//! the config types stay free of `dirs` lookups.

use crate::config::{Config, ConfigError};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "injectlog";

/// Directories the tool uses outside of any project.
///
/// Only the top-level `main` function should use `dirs::*` to construct this;
/// tests use [`DirectoryContext::for_testing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryContext {
    /// Config directory, e.g. `~/.config/injectlog`
    pub config_dir: PathBuf,

    /// Holds the persistent instance id, instance artifacts and project locks,
    /// e.g. `~/.local/share/injectlog`
    pub app_root: PathBuf,

    /// Default home of the external backup streams
    pub secondary_dir: PathBuf,
}

impl DirectoryContext {
    /// Create a DirectoryContext from the system directories
    pub fn from_system() -> std::io::Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine data directory",
                )
            })?
            .join(APP_DIR);

        #[allow(unused_mut)] // mut needed on macOS only
        let mut config_dir = dirs::config_dir()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine config directory",
                )
            })?
            .join(APP_DIR);

        // macOS: Prioritize ~/.config/injectlog if it exists
        #[cfg(target_os = "macos")]
        if let Some(home) = dirs::home_dir() {
            let xdg_config = home.join(".config").join(APP_DIR);
            if xdg_config.exists() {
                config_dir = xdg_config;
            }
        }

        Ok(Self {
            config_dir,
            secondary_dir: data_dir.join("secondary"),
            app_root: data_dir,
        })
    }

    /// All paths point to subdirectories of `temp_dir`
    pub fn for_testing(temp_dir: &Path) -> Self {
        Self {
            config_dir: temp_dir.join("config"),
            app_root: temp_dir.join("app"),
            secondary_dir: temp_dir.join("secondary"),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Override the app root; the secondary directory moves along unless the
    /// config names one explicitly
    pub fn with_app_root(mut self, app_root: PathBuf) -> Self {
        self.secondary_dir = app_root.join("secondary");
        self.app_root = app_root;
        self
    }

    /// External stream directory for `config`
    pub fn secondary_dir_for(&self, config: &Config) -> PathBuf {
        config
            .protection
            .secondary_dir
            .clone()
            .unwrap_or_else(|| self.secondary_dir.clone())
    }

    /// Load the config from `explicit`, else from the user config file, else
    /// use the defaults.
    ///
    /// An explicit path must exist; a broken user config file is an error
    /// rather than silently replaced by defaults.
    pub fn load_config(&self, explicit: Option<&Path>) -> Result<Config, ConfigError> {
        if let Some(path) = explicit {
            tracing::debug!("Loading config from {:?}", path);
            return Config::load_from_file(path);
        }

        let user_path = self.config_path();
        if user_path.exists() {
            tracing::debug!("Loading user config from {:?}", user_path);
            return Config::load_from_file(&user_path);
        }

        tracing::debug!("No config file at {:?}, using defaults", user_path);
        Ok(Config::default())
    }
}
