//! Unified error types for AGS

use thiserror::Error;

/// Unified error type for all AGS operations
#[derive(Error, Debug)]
pub enum AgsError {
    // Ledger errors
    #[error("Invalid ledger data: {0}")]
    InvalidLedger(String),

    // Run control
    #[error("Restart limit reached after {0} restarts")]
    RestartLimit(usize),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using AgsError
pub type Result<T> = std::result::Result<T, AgsError>;
