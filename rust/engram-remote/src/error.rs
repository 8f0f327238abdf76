use engram_facts::EngramFactsError;
use engram_facts::protocol::ReceiptError;
use thiserror::Error;

/// The common error type used by this crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngramRemoteError {
    /// The issuer is not authorized for the invoked ability
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// A transact command was rejected for a reason other than conflict
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// A query or subscribe command was rejected
    #[error("Query failed: {0}")]
    Query(String),

    /// The underlying connection failed or timed out
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The session has been shut down and accepts no further commands
    #[error("Session closed: {0}")]
    Closed(String),

    /// A value could not be encoded or decoded
    #[error("Codec failure: {0}")]
    Codec(String),
}

impl From<EngramFactsError> for EngramRemoteError {
    fn from(value: EngramFactsError) -> Self {
        EngramRemoteError::Codec(format!("{value}"))
    }
}

impl From<ReceiptError> for EngramRemoteError {
    fn from(value: ReceiptError) -> Self {
        match value {
            ReceiptError::Conflict { conflicts } => EngramRemoteError::Transaction(format!(
                "Commit rejected with {} conflict(s)",
                conflicts.len()
            )),
            ReceiptError::Authorization { message } => EngramRemoteError::Authorization(message),
            ReceiptError::Transaction { message } => EngramRemoteError::Transaction(message),
            ReceiptError::Query { message } => EngramRemoteError::Query(message),
        }
    }
}
