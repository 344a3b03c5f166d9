//! Error types for the secure authentication engine

use thiserror::Error;

/// Result type for secure authentication operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-specific error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed object, sequence replay/mismatch, wrong MAC length
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// MAC verification failed
    #[error("Authentication failure: {0}")]
    Authentication(String),

    /// Key unwrap failure, interval/count expiry
    #[error("Key lifecycle failure: {0}")]
    KeyLifecycle(String),

    /// User-count limit, oversized fragment
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Repeated application-confirm timeouts
    #[error("Communication failure: {0}")]
    CommFailure(String),

    /// Cryptographic provider error
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Statistics persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<ring::error::Unspecified> for Error {
    fn from(_err: ring::error::Unspecified) -> Self {
        Error::Crypto("Ring cryptographic error".to_string())
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Error::Storage(format!("Serialization error: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("TOML parsing error: {}", err))
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::Config(format!("Hex decoding error: {}", err))
    }
}
