use thiserror::Error;

/// The common error type used by this crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngramFactsError {
    /// A string could not be interpreted as a URI
    #[error("Could not parse URI: {0}")]
    InvalidUri(String),

    /// A string could not be interpreted as an entity identifier
    #[error("Could not parse entity: {0}")]
    InvalidEntity(String),

    /// A string could not be interpreted as a media type
    #[error("Invalid media type: {0}")]
    InvalidMediaType(String),

    /// A string could not be interpreted as a space DID
    #[error("Invalid space identifier: {0}")]
    InvalidSpace(String),

    /// Raw bytes could not be interpreted as a causal reference
    #[error("Could not convert bytes into reference: {0}")]
    InvalidReference(String),

    /// An inline `data:` address was malformed
    #[error("Could not decode data URI: {0}")]
    InvalidDataUri(String),

    /// An inline `data:` address named a media type this engine cannot decode
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// A value could not be serialized into its canonical form
    #[error("Could not canonicalize value: {0}")]
    Canonical(String),
}
