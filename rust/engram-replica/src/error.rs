use engram_facts::protocol::Conflict;
use engram_facts::{Address, EngramFactsError, Space};
use engram_remote::EngramRemoteError;
use thiserror::Error;

/// The common error type used by this crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngramReplicaError {
    /// A prior read no longer holds: either a later read in the same
    /// transaction resolved to an incompatible value, or the stored fact
    /// drifted before the transaction could commit
    #[error("Transaction is inconsistent: {0}")]
    Inconsistent(String),

    /// A read or write descended through a parent that does not exist
    #[error("No value found at {address}")]
    NotFound {
        /// The address whose parent was missing
        address: Address,
    },

    /// A read or write descended into a value that is not a container
    #[error("Value at {address} is not a container")]
    TypeMismatch {
        /// The address that hit a non-container
        address: Address,
    },

    /// A write addressed an inline `data:` entity
    #[error("Inline address {address} is read only")]
    ReadOnlyAddress {
        /// The inline address that was written to
        address: Address,
    },

    /// A second writer space was opened on a transaction that is already
    /// bound to another space
    #[error("Transaction already writes to {bound}, cannot also write to {requested}")]
    WriteIsolation {
        /// The space the transaction is bound to
        bound: Space,
        /// The space the second writer was requested for
        requested: Space,
    },

    /// The transaction was aborted and accepts no further operations
    #[error("Transaction was aborted: {0}")]
    TransactionAborted(String),

    /// The transaction has already committed and accepts no further
    /// operations
    #[error("Transaction is complete")]
    TransactionComplete,

    /// The transaction handle is no longer active
    #[error("Transaction is inactive")]
    InactiveTransaction,

    /// The remote rejected the commit; each conflict carries the record the
    /// server actually holds
    #[error("Commit rejected with {} conflict(s)", .0.len())]
    Conflict(Vec<Conflict>),

    /// The remote or its transport failed
    #[error("Remote operation failed: {0}")]
    Remote(String),

    /// A value could not be encoded, decoded or addressed
    #[error("Codec failure: {0}")]
    Codec(String),
}

impl From<EngramRemoteError> for EngramReplicaError {
    fn from(value: EngramRemoteError) -> Self {
        EngramReplicaError::Remote(format!("{value}"))
    }
}

impl From<EngramFactsError> for EngramReplicaError {
    fn from(value: EngramFactsError) -> Self {
        EngramReplicaError::Codec(format!("{value}"))
    }
}
