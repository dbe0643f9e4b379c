//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A field element could not be parsed.
    #[error("Invalid field element: {0}")]
    InvalidField(String),

    /// An attester id could not be parsed.
    #[error("Invalid attester id: {0}")]
    InvalidAttesterId(String),

    /// An attester was registered with a zero epoch length.
    #[error("Epoch length must be non-zero")]
    ZeroEpochLength,

    /// The external prover failed.
    #[error("Prover error: {0}")]
    Prover(String),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
