#![doc = "Abstract spiking dynamics: the object model consumed by the code generators\n\nProvides:\n- Symbolic expressions with a logos lexer, precedence parser, printer and simplifier\n- Dimensions, units and quantities\n- Namespaced annotations (the build namespace carries transform decisions)\n- Insertion-ordered dynamics model with JSON serialisation\n- A validator and a textual printer\n"]
#![warn(missing_docs)]

pub mod annotations;
pub mod expr;
pub mod model;
pub mod text;
pub mod units;
pub mod validate;

pub use annotations::{keys, AnnotationValue, Annotations, BUILD_NS, NMODL_NS};
pub use expr::{BinOp, Expr, Piece, UnOp};
pub use model::{
    Alias, AnalogReceivePort, AnalogReducePort, AnalogSendPort, Constant, Dynamics, ElementKind,
    EventReceivePort, EventSendPort, OnCondition, OnEvent, Parameter, Properties, Regime,
    StateVariable,
};
pub use units::{Dimension, Quantity, Unit};
pub use validate::{is_identifier, validate};

/// Dynamics-wide result type
pub type Result<T> = std::result::Result<T, DynamicsError>;

/// Errors raised while building, parsing or checking dynamics
#[derive(thiserror::Error, Debug)]
pub enum DynamicsError {
    /// Expression text could not be parsed
    #[error("Cannot parse expression '{expr}': {reason}")]
    Parse {
        /// Offending source text
        expr: String,
        /// Reason
        reason: String,
    },

    /// Validation failed
    #[error("Dynamics '{component}' is invalid: {}", reasons.join("; "))]
    Invalid {
        /// Component name
        component: String,
        /// Every violation found
        reasons: Vec<String>,
    },

    /// A unit or dimension could not be resolved
    #[error("Unknown unit '{unit}': {reason}")]
    UnknownUnit {
        /// Unit text
        unit: String,
        /// Reason
        reason: String,
    },

    /// Numerical evaluation failed
    #[error("Evaluation failed: {reason}")]
    Eval {
        /// Reason
        reason: String,
    },

    /// Named element is missing
    #[error("No {kind} named '{name}'")]
    NotFound {
        /// Element kind
        kind: String,
        /// Requested name
        name: String,
    },

    /// JSON (de)serialisation failed
    #[error("Serialization error: {source}")]
    Serde {
        #[from]
        /// Source error
        source: serde_json::Error,
    },
}

impl DynamicsError {
    /// Create a parse error
    pub fn parse(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            expr: expr.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown unit error
    pub fn unknown_unit(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnknownUnit {
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    /// Create an evaluation error
    pub fn eval(reason: impl Into<String>) -> Self {
        Self::Eval {
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DynamicsError::not_found("regime", "refractory");
        assert!(matches!(err, DynamicsError::NotFound { .. }));

        let err = DynamicsError::parse("a +", "unexpected end of input");
        assert!(matches!(err, DynamicsError::Parse { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = DynamicsError::unknown_unit("furlong", "unknown unit symbol");
        assert_eq!(err.to_string(), "Unknown unit 'furlong': unknown unit symbol");

        let err = DynamicsError::Invalid {
            component: "Cell".into(),
            reasons: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Dynamics 'Cell' is invalid: a; b");
    }
}
