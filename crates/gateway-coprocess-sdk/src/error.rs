//! Error types for coprocess extensions

use thiserror::Error;

/// Errors raised by extension code or by the envelope codec
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Shorthand for an internal error from any displayable value
    pub fn internal(message: impl std::fmt::Display) -> Self {
        HandlerError::Internal(message.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::Ipc(err.to_string())
    }
}
