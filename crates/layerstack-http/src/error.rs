//! Error types for the HTTP transport

use thiserror::Error;

/// Errors building or using an HTTP client for a remote layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid remote address: {0}")]
    InvalidAddress(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors starting the publication server
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}
