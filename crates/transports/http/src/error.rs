//! Error types for the HTTP transport

use thiserror::Error;

/// Result type alias for HTTP transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the HTTP transport
#[derive(Debug, Error)]
pub enum Error {
    /// Server startup or runtime error
    #[error("Server error: {0}")]
    Server(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
