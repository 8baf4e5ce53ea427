//! Error types for TestRunner

use thiserror::Error;

/// Result type alias using TestRunner Error
pub type Result<T> = std::result::Result<T, Error>;

/// TestRunner error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },
}
