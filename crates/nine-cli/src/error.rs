//! Errors surfaced by `nine` commands

use thiserror::Error;

/// Result of a command
pub type CliResult<T> = Result<T, CliError>;

/// Everything a command can fail with
#[derive(Error, Debug)]
pub enum CliError {
    /// Transform, generation or toolchain failure
    #[error("Build error: {0}")]
    Pipeline(#[from] nine_codegen::PipelineError),

    /// Mechanism that could not be lifted
    #[error("Import error: {0}")]
    Import(#[from] nine_import::ImportError),

    /// Document whose class fails validation
    #[error("Dynamics error: {0}")]
    Dynamics(#[from] nine_dynamics::DynamicsError),

    /// Unreadable or inconsistent user configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unreadable `nine.toml`
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Malformed dynamics document
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Task, terminal or batch failure
    #[error("{0}")]
    Generic(#[from] anyhow::Error),

    /// Confirmation declined
    #[error("Cancelled")]
    Cancelled,

    /// Flags that contradict or are missing
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// Input path that does not exist
    #[error("Missing resource: {0}")]
    MissingResource(String),
}

impl CliError {
    /// Configuration error with `msg`
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Workspace error with `msg`
    pub fn workspace(msg: impl Into<String>) -> Self {
        Self::Workspace(msg.into())
    }

    /// Argument error with `msg`
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::InvalidArgs(msg.into())
    }

    /// Missing input `what`
    pub fn missing_resource(what: impl Into<String>) -> Self {
        Self::MissingResource(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_convert() {
        let err: CliError = nine_codegen::PipelineError::option("mode", "unknown").into();
        assert!(matches!(err, CliError::Pipeline(_)), "unexpected error: {}", err);
        assert!(err.to_string().starts_with("Build error:"));
    }

    #[test]
    fn helpers_pick_the_variant() {
        assert!(matches!(CliError::invalid_args("x"), CliError::InvalidArgs(_)));
        assert!(matches!(CliError::missing_resource("x"), CliError::MissingResource(_)));
        assert_eq!(CliError::config("bad").to_string(), "Configuration error: bad");
    }
}
