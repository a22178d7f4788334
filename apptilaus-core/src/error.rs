//! Error types for apptilaus-core

use thiserror::Error;

/// Main error type for the apptilaus-core library
///
/// None of these reach the host application through the public dispatch
/// operations; they are logged and folded into a [`crate::DispatchStatus`].
#[derive(Error, Debug)]
pub enum Error {
    /// Missing credentials, base URL, or otherwise unusable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Connectivity, timeout, or DNS failure; eligible for retry
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// The server rejected the request; never retried
    #[error("request rejected: {0}")]
    PermanentRequest(String),

    /// Store receipt could not be parsed
    #[error("payload parse error: {0}")]
    PayloadParse(String),

    /// Marker store failure
    #[error("marker store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for apptilaus-core
pub type Result<T> = std::result::Result<T, Error>;
