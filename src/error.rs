//! Error types for propylon

use std::io;

/// Main error type for the gateway
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid spec: {0}")]
    Spec(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("MQTT protocol error: {0}")]
    Mqtt(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn spec(msg: impl Into<String>) -> Self {
        Error::Spec(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn mqtt(msg: impl Into<String>) -> Self {
        Error::Mqtt(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Spec(e.to_string())
    }
}

/// Result type alias using the gateway error
pub type Result<T> = std::result::Result<T, Error>;
