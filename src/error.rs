//! # Error Types
//!
//! Custom error types for the field gateway using `thiserror`.

use thiserror::Error;

/// Main error type for the field gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors (cursor file, upload payload)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage layer errors (spool, CSV log, cursor)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Radio transport errors
    #[error("Radio error: {0}")]
    Radio(String),

    /// No radio bridge could be opened on any candidate path
    #[error("Radio bridge not found (tried: {0})")]
    RadioPortNotFound(String),
}

/// Result type alias for the field gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
