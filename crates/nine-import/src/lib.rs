#![doc = "NMODL importer: lifts imperative mechanism source into abstract dynamics\n\nThe importer reads the block structure of a mechanism file, resolves its\nunits to dimensions, inlines functions and procedures at their call sites,\nunwraps conditionals into piecewise expressions and expands kinetic schemes\ninto time derivatives by mass action. The result is a validated `Dynamics`\nplus the parameter values found in the file.\n"]
#![deny(missing_docs)]

use std::path::{Path, PathBuf};

use nine_codegen::PipelineError;
use nine_dynamics::DynamicsError;

pub mod blocks;
pub mod kinetic;
pub mod lift;
pub mod mechanism;
pub mod stmt;
pub mod units;

pub use mechanism::{ImportedMechanism, Importer};

/// Importer result type
pub type Result<T> = std::result::Result<T, ImportError>;

/// Errors raised while importing a mechanism
#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    /// Text that does not follow the block or statement grammar
    #[error("Syntax error in {context}: {reason}")]
    Syntax {
        /// Block or statement being read
        context: String,
        /// Reason
        reason: String,
    },

    /// Block keyword the importer does not know
    #[error("Unknown block '{name}'")]
    UnknownBlock {
        /// Block keyword
        name: String,
    },

    /// Construct with no abstract-dynamics equivalent
    #[error("Unsupported construct '{construct}' in: {context}")]
    UnsupportedConstruct {
        /// Construct name
        construct: String,
        /// Offending source
        context: String,
    },

    /// Conditional assignment that cannot be turned into a piecewise value
    #[error("Cannot unwrap conditional assignment to '{lhs}': {reason}")]
    Unwrapping {
        /// Assigned variable
        lhs: String,
        /// Reason
        reason: String,
    },

    /// Unit that maps to no known dimension
    #[error("Unknown dimension for units '{unit}': {reason}")]
    UnknownDimension {
        /// Unit text
        unit: String,
        /// Reason
        reason: String,
    },

    /// Function or procedure that calls itself
    #[error("Recursive call of '{name}' cannot be inlined")]
    Recursion {
        /// Function name
        name: String,
    },

    /// The lifted dynamics failed to build or validate
    #[error("Dynamics error: {0}")]
    Dynamics(#[from] DynamicsError),

    /// Reading the source failed
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        /// File being read
        path: PathBuf,
        /// Source error
        source: std::io::Error,
    },
}

impl ImportError {
    /// Create a syntax error
    pub fn syntax(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Syntax {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported-construct error
    pub fn unsupported(construct: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnsupportedConstruct {
            construct: construct.into(),
            context: context.into(),
        }
    }

    /// Create an unwrapping error
    pub fn unwrapping(lhs: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unwrapping {
            lhs: lhs.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown-dimension error
    pub fn unknown_dimension(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnknownDimension {
            unit: unit.into(),
            reason: reason.into(),
        }
    }
}

impl From<ImportError> for PipelineError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::UnsupportedConstruct { construct, context } => PipelineError::UnsupportedConstruct {
                construct,
                reason: format!("no abstract equivalent for: {}", context),
            },
            ImportError::Unwrapping { lhs, reason } => PipelineError::Unwrapping { lhs, reason },
            ImportError::UnknownDimension { unit, reason } => PipelineError::UnknownDimension { unit, reason },
            ImportError::Dynamics(e) => PipelineError::Dynamics(e),
            ImportError::Io { source, .. } => PipelineError::Io(source),
            ImportError::UnknownBlock { name } => PipelineError::UnsupportedConstruct {
                construct: name,
                reason: "unknown block".to_string(),
            },
            ImportError::Recursion { name } => PipelineError::UnsupportedConstruct {
                construct: name,
                reason: "recursive call".to_string(),
            },
            ImportError::Syntax { context, reason } => PipelineError::UnsupportedConstruct {
                construct: context,
                reason,
            },
        }
    }
}

/// Import mechanism source text
pub fn import_str(source: &str) -> Result<ImportedMechanism> {
    Importer::new(source)?.import()
}

/// Import a mechanism file
pub fn import_file(path: impl AsRef<Path>) -> Result<ImportedMechanism> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("importing {}", path.display());
    import_str(&source)
}
