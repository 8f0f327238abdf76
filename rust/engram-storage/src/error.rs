use thiserror::Error;

/// The common error type used by this crate
#[derive(Error, Debug, PartialEq)]
pub enum EngramStorageError {
    /// An error that occurs during value encoding
    #[error("Failed to encode a value: {0}")]
    EncodeFailed(String),

    /// An error that occurs during value decoding
    #[error("Failed to decode a value: {0}")]
    DecodeFailed(String),

    /// An error that occurs when working with a storage backend
    #[error("Storage backend error: {0}")]
    StorageBackend(String),
}
