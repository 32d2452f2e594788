//! Errors raised while parsing or validating a deployment spec.

use thiserror::Error;

/// Result type alias for spec parsing and validation.
pub type SpecResult<T> = Result<T, SpecError>;

/// Configuration errors. These surface when a spec is submitted, never
/// during evaluation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("failed to read deployment spec: {0}")]
    Io(String),

    #[error("failed to parse deployment spec: {0}")]
    Parse(String),

    #[error("invalid step: {0}")]
    InvalidStep(String),

    #[error("duplicate instance '{0}'")]
    DuplicateInstance(String),

    #[error("instance '{instance}' deploys to region '{region}' more than once")]
    DuplicateRegion { instance: String, region: String },

    #[error("instance '{instance}' declares more than one test for region '{region}'")]
    DuplicateTest { instance: String, region: String },

    #[error("instance '{instance}' tests region '{region}' before deploying to it")]
    TestBeforeDeployment { instance: String, region: String },

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("invalid block window: {0}")]
    InvalidWindow(String),

    #[error("invalid policy '{0}'")]
    InvalidPolicy(String),

    #[error("unknown job type '{0}'")]
    UnknownJobType(String),
}
