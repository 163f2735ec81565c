//! JSON model documents exchanged between `import`, `inspect` and `build`

use std::path::Path;

use nine_dynamics::{validate, Dynamics, Properties};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

/// A dynamics class with the values an importer found for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    /// The class
    pub dynamics: Dynamics,
    /// Parameter values and initial state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    /// File the class was imported from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Stored {
    Document(ModelDocument),
    Bare(Dynamics),
}

impl ModelDocument {
    /// Wrap a bare class
    pub fn new(dynamics: Dynamics) -> Self {
        Self {
            dynamics,
            properties: None,
            source: None,
        }
    }

    /// Read a document, or a bare serialized class, and validate it
    pub fn read(path: &Path) -> CliResult<Self> {
        if !path.exists() {
            return Err(CliError::missing_resource(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let document = match serde_json::from_str::<Stored>(&content) {
            Ok(Stored::Document(document)) => document,
            Ok(Stored::Bare(dynamics)) => Self::new(dynamics),
            // report the error against the full document shape
            Err(_) => serde_json::from_str::<ModelDocument>(&content)?,
        };
        validate(&document.dynamics)?;
        Ok(document)
    }

    /// Write pretty-printed JSON, creating parent directories
    pub fn write(&self, path: &Path) -> CliResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
