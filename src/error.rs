//! Error types for the LLM gateway

use std::io;

use thiserror::Error;

/// Result type alias for the LLM gateway
pub type Result<T> = std::result::Result<T, Error>;

/// LLM gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream LLM API unavailable
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
