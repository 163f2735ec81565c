//! Configuration management for the nine CLI

use std::path::{Path, PathBuf};

use nine_codegen::{BackendKind, BuildMode, BuildOptions};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

/// Global CLI configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Root of all build trees
    pub base_dir: Option<PathBuf>,

    /// Back-end used when `--backend` is not given
    pub default_backend: Option<BackendKind>,

    /// Parallel compile jobs
    pub build_cores: Option<usize>,

    /// Build mode used when `--mode` is not given
    pub default_mode: Option<BuildMode>,

    /// User preferences
    pub preferences: UserPreferences,

    /// Build options applied to every build
    pub options: BuildOptions,
}

/// Terminal behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    /// Show progress bars
    pub show_progress: bool,

    /// Use colors in output
    pub use_colors: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            show_progress: true,
            use_colors: true,
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            default_backend: None,
            build_cores: None,
            default_mode: None,
            preferences: UserPreferences::default(),
            options: BuildOptions::default(),
        }
    }
}

impl CliConfig {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> CliResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| CliError::config(format!("Invalid config file {}: {}", path.display(), e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> CliResult<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => match Self::default_config_path() {
                Ok(path) => Self::load_from_file(&path),
                Err(_) => Ok(Self::default()),
            },
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> CliResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CliError::config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> CliResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| CliError::config("Could not determine config directory"))?;
        Ok(config_dir.join("nine").join("config.toml"))
    }

    /// Build options with the top-level overrides folded in
    pub fn build_options(&self) -> BuildOptions {
        let mut options = self.options.clone();
        if let Some(dir) = &self.base_dir {
            options.base_dir = Some(dir.clone());
        }
        if let Some(cores) = self.build_cores {
            options.build_cores = cores;
        }
        options
    }
}
