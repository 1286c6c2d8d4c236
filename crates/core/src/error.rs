//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid entry name: {0:?}")]
    InvalidEntryName(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("fingerprint already digested")]
    AlreadyDigested,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
