//! Build-mode gate: decides what to regenerate and recompile from the mode and
//! the sentinel of a previous build.

use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use log::{debug, info};
use nine_dynamics::{Dynamics, BUILD_NS};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::paths::BuildLayout;

/// How much of a previous build may be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Regenerate only when the sentinel differs
    #[default]
    Lazy,
    /// Always regenerate and recompile
    Force,
    /// Wipe every build directory first
    Purge,
    /// Load an existing build, never build
    Require,
    /// Build but do not load
    BuildOnly,
    /// Generate sources only
    GenerateOnly,
}

impl BuildMode {
    /// Every mode, in documentation order
    pub const ALL: [BuildMode; 6] = [
        BuildMode::Lazy,
        BuildMode::Force,
        BuildMode::Purge,
        BuildMode::Require,
        BuildMode::BuildOnly,
        BuildMode::GenerateOnly,
    ];

    /// Name as accepted on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Lazy => "lazy",
            BuildMode::Force => "force",
            BuildMode::Purge => "purge",
            BuildMode::Require => "require",
            BuildMode::BuildOnly => "build_only",
            BuildMode::GenerateOnly => "generate_only",
        }
    }
}

impl Display for BuildMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| {
                PipelineError::option(
                    "mode",
                    format!(
                        "unknown build mode '{}' (expected one of {})",
                        s,
                        Self::ALL.map(|m| m.as_str()).join(", ")
                    ),
                )
            })
    }
}

/// State of the sentinel relative to a candidate class
#[derive(Debug, Clone, PartialEq)]
pub enum CacheStatus {
    /// No sentinel
    Missing,
    /// Sentinel holds an equal class
    Hit,
    /// Sentinel holds no class of that name, or a different one
    Mismatch,
    /// Sentinel could not be read or parsed
    Unreadable(String),
}

/// What the driver should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildPlan {
    /// Wipe `src/`, `cmpl/` and `install/` first
    pub purge: bool,
    /// Render sources and write the sentinel
    pub generate: bool,
    /// Run the toolchain
    pub compile: bool,
    /// Register the installed artifact
    pub load: bool,
}

/// Sentinel document: classes keyed by name
pub type Sentinel = IndexMap<String, Dynamics>;

/// Serialise `class` as a sentinel document
pub fn sentinel_json(class: &Dynamics) -> Result<String> {
    let mut doc = Sentinel::new();
    doc.insert(class.name.clone(), class.clone());
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Compare the sentinel at `path` against `candidate` under the build namespace
pub fn cache_status(path: &Path, candidate: &Dynamics) -> CacheStatus {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheStatus::Missing,
        Err(e) => return CacheStatus::Unreadable(e.to_string()),
    };
    let doc: Sentinel = match serde_json::from_str(&text) {
        Ok(doc) => doc,
        Err(e) => return CacheStatus::Unreadable(e.to_string()),
    };
    match doc.get(&candidate.name) {
        Some(prior) if prior.equals_under(candidate, &[BUILD_NS]) => CacheStatus::Hit,
        _ => CacheStatus::Mismatch,
    }
}

/// Decide the plan for `mode` given the layout and the (transformed) class
pub fn plan(mode: BuildMode, layout: &BuildLayout, candidate: &Dynamics) -> Result<BuildPlan> {
    let plan = match mode {
        BuildMode::Lazy => {
            let status = cache_status(&layout.sentinel(), candidate);
            let generate = status != CacheStatus::Hit;
            match &status {
                CacheStatus::Hit => debug!("sentinel of '{}' matches, reusing sources", candidate.name),
                CacheStatus::Unreadable(reason) => info!(
                    "ignoring unreadable sentinel {}: {}",
                    layout.sentinel().display(),
                    reason
                ),
                _ => debug!("sentinel of '{}' is {:?}", candidate.name, status),
            }
            BuildPlan {
                purge: false,
                generate,
                compile: generate || !layout.install_dir.exists(),
                load: true,
            }
        }
        BuildMode::Force => BuildPlan {
            purge: false,
            generate: true,
            compile: true,
            load: true,
        },
        BuildMode::Purge => BuildPlan {
            purge: true,
            generate: true,
            compile: true,
            load: true,
        },
        BuildMode::Require => {
            if !layout.install_dir.exists() {
                return Err(PipelineError::BuildCacheMiss {
                    install_dir: layout.install_dir.clone(),
                });
            }
            BuildPlan {
                purge: false,
                generate: false,
                compile: false,
                load: true,
            }
        }
        BuildMode::BuildOnly => BuildPlan {
            purge: false,
            generate: true,
            compile: true,
            load: false,
        },
        BuildMode::GenerateOnly => BuildPlan {
            purge: false,
            generate: true,
            compile: false,
            load: false,
        },
    };
    Ok(plan)
}
