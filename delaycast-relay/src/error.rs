//! Error types for the delay relay

use thiserror::Error;

/// Relay error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid delay: {requested}ms (allowed 0..={max}ms)")]
    InvalidDelay { requested: u64, max: u64 },

    #[error("Invalid participant: {0}")]
    InvalidParticipant(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Platform API error: {0}")]
    Platform(String),

    #[error("HTTP error {status} for {url}")]
    Http { status: reqwest::StatusCode, url: String },

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Capture error: {0}")]
    Capture(String),
}

impl Error {
    /// Whether the failure happened while bringing up a relay session
    #[must_use]
    pub const fn is_start_failure(&self) -> bool {
        matches!(self, Self::Credential(_) | Self::Session(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Platform(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Credential(err.to_string())
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;
