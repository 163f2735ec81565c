//! Workspace management utilities

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nine_codegen::{BackendKind, BuildMode, BuildOptions};
use serde::{Deserialize, Serialize};

use crate::config::CliConfig;
use crate::error::{CliError, CliResult};

/// Name of the per-project settings file
pub const WORKSPACE_FILE: &str = "nine.toml";

/// Per-project settings, overriding the user configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Project metadata
    pub workspace: WorkspaceInfo,
    /// Build defaults
    pub build: BuildDefaults,
    /// Dotted option overrides, as given to `--option`
    pub options: BTreeMap<String, String>,
}

/// Project metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceInfo {
    /// Project name
    pub name: String,
}

/// Build defaults of a project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildDefaults {
    /// Back-end
    pub backend: Option<BackendKind>,
    /// Build mode
    pub mode: Option<BuildMode>,
    /// Build base directory, relative to the workspace root
    pub base_dir: Option<PathBuf>,
    /// Parallel compile jobs
    pub cores: Option<usize>,
}

/// Workspace management utilities
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Root directory
    pub root: PathBuf,
    /// Settings from `nine.toml`, when present
    pub config: Option<WorkspaceConfig>,
}

impl Workspace {
    /// Create a new workspace instance
    pub fn new(root: PathBuf) -> Self {
        Self { root, config: None }
    }

    /// Open the workspace at `root`, or the one enclosing the current
    /// directory, and load its settings
    pub fn open(root: Option<PathBuf>) -> CliResult<Self> {
        let root = match root {
            Some(root) => root,
            None => {
                let cwd = std::env::current_dir()?;
                Self::find_workspace_root(&cwd).unwrap_or(cwd)
            }
        };
        let mut workspace = Self::new(root);
        workspace.load_config()?;
        Ok(workspace)
    }

    /// Load workspace configuration
    pub fn load_config(&mut self) -> CliResult<()> {
        let config_path = self.config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            self.config = Some(
                toml::from_str(&content)
                    .map_err(|e| CliError::workspace(format!("Invalid {}: {}", config_path.display(), e)))?,
            );
        }
        Ok(())
    }

    /// Path of `nine.toml`
    pub fn config_path(&self) -> PathBuf {
        self.root.join(WORKSPACE_FILE)
    }

    /// Check if this is a valid nine workspace
    pub fn is_valid(&self) -> bool {
        self.config_path().exists()
    }

    /// Find workspace root by walking up the directory tree
    pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .find(|dir| dir.join(WORKSPACE_FILE).exists())
            .map(Path::to_path_buf)
    }

    /// Build options: user configuration, then workspace settings, then
    /// the command-line `key=value` overrides
    pub fn build_options(&self, user: &CliConfig, overrides: &[String]) -> CliResult<BuildOptions> {
        let mut options = user.build_options();
        if let Some(config) = &self.config {
            if let Some(dir) = &config.build.base_dir {
                options.base_dir = Some(self.root.join(dir));
            }
            if let Some(cores) = config.build.cores {
                options.build_cores = cores;
            }
            for (key, value) in &config.options {
                options.set(key, value)?;
            }
        }
        for item in overrides {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| CliError::invalid_args(format!("expected key=value, got '{}'", item)))?;
            options.set(key.trim(), value.trim())?;
        }
        Ok(options)
    }

    /// Back-end: explicit, then workspace, then user default
    pub fn backend(&self, user: &CliConfig, explicit: Option<BackendKind>) -> CliResult<BackendKind> {
        explicit
            .or_else(|| self.config.as_ref().and_then(|c| c.build.backend))
            .or(user.default_backend)
            .ok_or_else(|| CliError::invalid_args("no back-end given; pass --backend neuron|nest"))
    }

    /// Build mode: explicit, then workspace, then user default, then lazy
    pub fn mode(&self, user: &CliConfig, explicit: Option<BuildMode>) -> BuildMode {
        explicit
            .or_else(|| self.config.as_ref().and_then(|c| c.build.mode))
            .or(user.default_mode)
            .unwrap_or_default()
    }
}
