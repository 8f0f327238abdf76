use async_trait::async_trait;
use engram_common::ConditionalSync;
use engram_facts::protocol::{
    Conflict, Effect, FactSet, Query, Subscribe, SubscriptionId, Transact,
};
use engram_facts::{Commit, Space, StoredFact};
use tokio::sync::{mpsc, oneshot, watch};

use crate::EngramRemoteError;

/// The reasons a pushed transaction can come back unapplied
#[derive(Debug, Clone, PartialEq)]
pub enum PushRejection {
    /// The remote rejected the commit because a read invariant or causal
    /// chain no longer holds; each conflict carries the record the server
    /// actually has
    Conflict(Vec<Conflict>),
    /// The command failed outright (authorization, malformed command, or a
    /// terminal transport fault)
    Failed(EngramRemoteError),
}

/// The in-flight state of a submitted transaction: the optimistic local view
/// of the facts being committed, and a receiver that resolves once the
/// remote acknowledges or rejects them.
#[derive(Debug)]
pub struct PendingCommit {
    /// The facts this transact will commit, as the client sees them
    pub facts: Vec<StoredFact>,
    /// Resolves with the server's commit, or with the rejection
    pub confirmed: oneshot::Receiver<Result<Commit, PushRejection>>,
}

/// A live subscription: its server-assigned id, the initial snapshot, and
/// the channel on which later updates arrive. The update channel closes when
/// the subscription is retired or the underlying connection is lost;
/// subscribers watch the session [`ConnectionStatus`] to re-establish.
#[derive(Debug)]
pub struct SubscriptionHandle {
    /// The id under which updates arrive and unsubscription is addressed
    pub id: SubscriptionId,
    /// The snapshot the subscription started from
    pub facts: FactSet,
    /// Live updates, in commit order
    pub updates: mpsc::UnboundedReceiver<Effect>,
}

/// The lifecycle of a session's underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection has been established yet
    Connecting,
    /// A connection is open; `count` is 1 for the first connection and grows
    /// with every reconnect
    Open {
        /// How many connections this session has established so far
        count: u64,
    },
    /// The session has been shut down for good
    Closed,
}

impl ConnectionStatus {
    /// Whether this status represents a re-established connection
    pub fn is_reconnect(&self) -> bool {
        matches!(self, ConnectionStatus::Open { count } if *count > 1)
    }
}

/// The interface a replica consumes its remote through. Two implementations
/// exist: the framed websocket [`Session`](crate::Session) and the
/// in-process [`MemorySession`](crate::MemorySession); they are
/// interchangeable.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait Consumer: Clone + ConditionalSync + 'static {
    /// Submit a batch of operations. Resolves as soon as the command is
    /// accepted for delivery; the returned [`PendingCommit`] carries the
    /// optimistic view and the confirmation receiver.
    async fn transact(
        &self,
        space: &Space,
        transact: Transact,
    ) -> Result<PendingCommit, EngramRemoteError>;

    /// One-shot resolve of a selector against the store
    async fn query(&self, space: &Space, query: Query) -> Result<FactSet, EngramRemoteError>;

    /// Install a live subscription. Resolves once the remote has installed
    /// it and produced the initial snapshot.
    async fn subscribe(
        &self,
        space: &Space,
        subscribe: Subscribe,
    ) -> Result<SubscriptionHandle, EngramRemoteError>;

    /// Retire a live subscription
    async fn unsubscribe(
        &self,
        space: &Space,
        id: SubscriptionId,
    ) -> Result<(), EngramRemoteError>;

    /// Watch the lifecycle of the connection that serves the given space.
    /// Emulated sessions report a single open connection forever.
    fn status(&self, space: &Space) -> watch::Receiver<ConnectionStatus>;
}
