//! wgnet Error Types

use thiserror::Error;

/// Result type alias for wgnet operations
pub type Result<T> = std::result::Result<T, Error>;

/// wgnet error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid address {value:?}: {reason}")]
    InvalidAddress { value: String, reason: String },

    // Network errors
    #[error("Cannot resolve peer endpoint {endpoint}: {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("Cannot resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Network is closed")]
    Closed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
