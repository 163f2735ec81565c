//! Error types for the cell binding layer

use nine_codegen::PipelineError;
use nine_dynamics::DynamicsError;
use thiserror::Error;

/// Result type for cell operations
pub type Result<T> = std::result::Result<T, CellError>;

/// Errors raised by cells, simulations and kernels
#[derive(Error, Debug)]
pub enum CellError {
    /// Build pipeline error
    #[error(transparent)]
    Pipeline {
        #[from]
        /// Source pipeline error
        source: PipelineError,
    },

    /// Dynamics model error
    #[error(transparent)]
    Dynamics {
        #[from]
        /// Source dynamics error
        source: DynamicsError,
    },

    /// Unknown attribute, port or recording
    #[error("Cell '{cell}' has no {what} '{name}'")]
    AttributeAccess {
        /// Cell class name
        cell: String,
        /// Kind of thing looked up
        what: String,
        /// Requested name
        name: String,
    },

    /// A value of the wrong dimension
    #[error("Cannot set '{name}' of dimension {expected} to a value of dimension {found}")]
    Dimension {
        /// Attribute name
        name: String,
        /// Declared dimension
        expected: String,
        /// Dimension supplied
        found: String,
    },

    /// Simulation context misuse
    #[error("Simulation lifecycle error: {reason}")]
    SimulationLifecycle {
        /// Reason
        reason: String,
    },

    /// `regime_epochs` without `record_regime`
    #[error("Regime transitions of '{cell}' were not recorded; call record_regime before running")]
    RegimeTransitionsNotRecorded {
        /// Cell class name
        cell: String,
    },

    /// Invalid argument to a cell or simulation call
    #[error("Invalid usage: {reason}")]
    Usage {
        /// Reason
        reason: String,
    },

    /// Simulation step failed
    #[error("Simulation step failed at t = {time_ms} ms: {reason}")]
    SimulationStep {
        /// Time when the step failed (ms)
        time_ms: f64,
        /// Reason for failure
        reason: String,
    },
}

impl CellError {
    /// Create an attribute access error
    pub fn attribute(cell: impl Into<String>, what: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AttributeAccess {
            cell: cell.into(),
            what: what.into(),
            name: name.into(),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(reason: impl Into<String>) -> Self {
        Self::SimulationLifecycle {
            reason: reason.into(),
        }
    }

    /// Create a usage error
    pub fn usage(reason: impl Into<String>) -> Self {
        Self::Usage {
            reason: reason.into(),
        }
    }

    /// Create a simulation step error
    pub fn simulation_step(time_ms: f64, reason: impl Into<String>) -> Self {
        Self::SimulationStep {
            time_ms,
            reason: reason.into(),
        }
    }
}

impl From<CellError> for PipelineError {
    fn from(err: CellError) -> Self {
        match err {
            CellError::Pipeline { source } => source,
            CellError::Dynamics { source } => PipelineError::Dynamics(source),
            CellError::AttributeAccess { cell, name, .. } => PipelineError::attribute(cell, name),
            other => PipelineError::lifecycle(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CellError::attribute("Izhikevich9ML", "attribute", "foo");
        assert!(matches!(err, CellError::AttributeAccess { .. }));

        let err = CellError::lifecycle("already active");
        assert!(matches!(err, CellError::SimulationLifecycle { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = CellError::attribute("Izhikevich9ML", "attribute", "foo");
        assert_eq!(format!("{}", err), "Cell 'Izhikevich9ML' has no attribute 'foo'");
    }

    #[test]
    fn converts_into_pipeline_errors() {
        let err: PipelineError = CellError::attribute("Leak9ML", "port", "x").into();
        assert!(matches!(err, PipelineError::AttributeAccess { ref name, .. } if name == "x"), "unexpected error: {}", err);
        let err: PipelineError = CellError::lifecycle("re-entry").into();
        assert!(matches!(err, PipelineError::SimulationLifecycle { .. }), "unexpected error: {}", err);
    }
}
