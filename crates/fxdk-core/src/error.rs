//! Error types for the supervisor

use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, FxdkError>;

/// Supervisor error types
#[derive(Debug, Error)]
pub enum FxdkError {
    /// IPC communication error
    #[error("IPC error: {0}")]
    IpcError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Malformed IPC frame
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Server process could not be launched
    #[error("Launch error: {0}")]
    LaunchError(String),

    /// Resource directory reconciliation failed
    #[error("Filesystem error: {0}")]
    FilesystemError(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    ConfigError(String),
}

impl From<serde_json::Error> for FxdkError {
    fn from(err: serde_json::Error) -> Self {
        FxdkError::SerializationError(err.to_string())
    }
}
