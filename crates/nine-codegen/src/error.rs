//! Error types for the build pipeline

use std::path::PathBuf;

use nine_dynamics::DynamicsError;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised anywhere between a dynamics value and a loaded cell class
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// A dimension has no representation in a back-end's unit table
    #[error("Cannot express {dimension} in {backend} units: {reason}")]
    UnitConversion {
        /// Dimension that failed
        dimension: String,
        /// Back-end name
        backend: String,
        /// Reason
        reason: String,
    },

    /// A unit expression reduced to a dimension with no known name
    #[error("Unknown dimension for '{unit}': {reason}")]
    UnknownDimension {
        /// Unit text
        unit: String,
        /// Reason
        reason: String,
    },

    /// A build transform could not be applied
    #[error("Cannot transform '{component}' for build: {reason}")]
    BuildTransform {
        /// Component name
        component: String,
        /// Reason
        reason: String,
    },

    /// Configure step failed
    #[error("Configure step '{step}' failed in {}:\n{stdout}\n{stderr}", dir.display())]
    BuildConfigure {
        /// Command that ran
        step: String,
        /// Working directory
        dir: PathBuf,
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
    },

    /// Compile step failed
    #[error("Compile step '{step}' failed in {}:\n{stdout}\n{stderr}", dir.display())]
    BuildCompile {
        /// Command that ran
        step: String,
        /// Working directory
        dir: PathBuf,
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
    },

    /// `require` mode found no prior build
    #[error("No installed build at {} (required by build mode)", install_dir.display())]
    BuildCacheMiss {
        /// Missing install directory
        install_dir: PathBuf,
    },

    /// The importer met a construct it cannot lift
    #[error("Unsupported construct '{construct}': {reason}")]
    UnsupportedConstruct {
        /// Construct as written
        construct: String,
        /// Reason
        reason: String,
    },

    /// A conditional could not be turned into piecewise expressions
    #[error("Cannot unwrap conditional assignment to '{lhs}': {reason}")]
    Unwrapping {
        /// Assigned name
        lhs: String,
        /// Reason
        reason: String,
    },

    /// Unknown or read-only cell attribute
    #[error("Cell '{cell}' has no attribute '{name}'")]
    AttributeAccess {
        /// Cell class name
        cell: String,
        /// Requested attribute
        name: String,
    },

    /// Simulation context misuse
    #[error("Simulation lifecycle error: {reason}")]
    SimulationLifecycle {
        /// Reason
        reason: String,
    },

    /// A template failed to load or render
    #[error("Template '{template}' failed: {reason}")]
    Render {
        /// Template name
        template: String,
        /// Reason
        reason: String,
    },

    /// A toolchain program could not be started
    #[error("Cannot run '{program}': {reason}")]
    Toolchain {
        /// Program name
        program: String,
        /// Reason
        reason: String,
    },

    /// Loading or registering a built library failed
    #[error("Cannot register '{library}': {reason}")]
    Registration {
        /// Library path
        library: String,
        /// Reason
        reason: String,
    },

    /// Invalid build option
    #[error("Invalid option '{key}': {reason}")]
    Option {
        /// Option key
        key: String,
        /// Reason
        reason: String,
    },

    /// Dynamics model error
    #[error(transparent)]
    Dynamics(#[from] DynamicsError),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    /// Create a transform error
    pub fn transform(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BuildTransform {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Create a unit conversion error
    pub fn unit_conversion(
        dimension: impl Into<String>,
        backend: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnitConversion {
            dimension: dimension.into(),
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a render error
    pub fn render(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Render {
            template: template.into(),
            reason: reason.into(),
        }
    }

    /// Create an attribute access error
    pub fn attribute(cell: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AttributeAccess {
            cell: cell.into(),
            name: name.into(),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(reason: impl Into<String>) -> Self {
        Self::SimulationLifecycle {
            reason: reason.into(),
        }
    }

    /// Create an option error
    pub fn option(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Option {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Short kind label, used by the CLI exit report
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnitConversion { .. } => "unit-conversion",
            Self::UnknownDimension { .. } => "unknown-dimension",
            Self::BuildTransform { .. } => "build-transform",
            Self::BuildConfigure { .. } => "build-configure",
            Self::BuildCompile { .. } => "build-compile",
            Self::BuildCacheMiss { .. } => "build-cache-miss",
            Self::UnsupportedConstruct { .. } => "unsupported-construct",
            Self::Unwrapping { .. } => "unwrapping",
            Self::AttributeAccess { .. } => "attribute-access",
            Self::SimulationLifecycle { .. } => "simulation-lifecycle",
            Self::Render { .. } => "render",
            Self::Toolchain { .. } => "toolchain",
            Self::Registration { .. } => "registration",
            Self::Option { .. } => "option",
            Self::Dynamics(_) => "dynamics",
            Self::Io(_) => "io",
            Self::Serde(_) => "serialization",
        }
    }
}
