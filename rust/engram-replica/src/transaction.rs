//! The user-facing transaction handle.
//!
//! A [`StorageTransaction`] opens readers for any number of spaces but
//! enforces write isolation: the first writer binds the transaction to its
//! space, and a writer for any other space fails. Reads and writes are
//! journaled per space in a [`Chronicle`](crate::Chronicle); `commit`
//! compiles the writer-space journal into an edit and pushes it through the
//! replica, revalidating every read in every touched space first.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use engram_facts::{Address, Commit, Space};
use engram_remote::Consumer;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    Chronicle, EngramReplicaError, Notification, NotificationChange, Replica, Repository,
};

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

/// Identifies one transaction for the lifetime of the process. Notifications
/// carry the id of the transaction that caused them, so observers can match
/// a `revert` to the `commit` it undoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    fn next() -> Self {
        Self(NEXT_TRANSACTION.fetch_add(1, Ordering::SeqCst))
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

enum Status {
    Open,
    Aborted(String),
    Complete,
}

struct TransactionState<C>
where
    C: Consumer,
{
    status: Status,
    replicas: HashMap<Space, Arc<Replica<C>>>,
    chronicles: HashMap<Space, Chronicle>,
    writer: Option<Space>,
    outcome: Option<Result<Option<Commit>, EngramReplicaError>>,
}

struct TransactionInner<C>
where
    C: Consumer,
{
    id: TransactionId,
    repository: Repository<C>,
    state: Mutex<TransactionState<C>>,
}

/// An optimistically-concurrent read/write handle over a [`Repository`].
pub struct StorageTransaction<C>
where
    C: Consumer,
{
    inner: Arc<TransactionInner<C>>,
}

impl<C> Clone for StorageTransaction<C>
where
    C: Consumer,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> StorageTransaction<C>
where
    C: Consumer,
{
    pub(crate) fn open(repository: Repository<C>) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: TransactionId::next(),
                repository,
                state: Mutex::new(TransactionState {
                    status: Status::Open,
                    replicas: HashMap::new(),
                    chronicles: HashMap::new(),
                    writer: None,
                    outcome: None,
                }),
            }),
        }
    }

    /// The identifier notifications will carry for this transaction
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// A reader handle for the given space (memoized; readers may span any
    /// number of spaces)
    pub async fn reader(&self, space: &Space) -> Result<TransactionReader<C>, EngramReplicaError> {
        self.ensure_open().await?;
        self.replica(space).await;

        Ok(TransactionReader {
            transaction: self.clone(),
            space: space.clone(),
        })
    }

    /// A writer handle for the given space. The first call binds the
    /// transaction to that space; a writer for any other space fails with a
    /// write isolation error.
    pub async fn writer(&self, space: &Space) -> Result<TransactionWriter<C>, EngramReplicaError> {
        self.ensure_open().await?;
        self.bind_writer(space).await?;
        self.replica(space).await;

        Ok(TransactionWriter {
            transaction: self.clone(),
            space: space.clone(),
        })
    }

    /// Read the value at an address in the given space
    pub async fn read(
        &self,
        space: &Space,
        address: &Address,
    ) -> Result<Option<Value>, EngramReplicaError> {
        self.ensure_open().await?;

        let replica = self.replica(space).await;

        let mut state = self.inner.state.lock().await;
        let chronicle = state.chronicles.entry(space.clone()).or_default();

        chronicle.read(&replica, address).await
    }

    /// Write a value at an address in the given space (`None` deletes the
    /// key at a leaf, and at the root marks the fact for retraction). The
    /// first write binds the transaction to the space.
    pub async fn write(
        &self,
        space: &Space,
        address: &Address,
        value: Option<Value>,
    ) -> Result<(), EngramReplicaError> {
        self.ensure_open().await?;
        self.bind_writer(space).await?;

        let replica = self.replica(space).await;

        let mut state = self.inner.state.lock().await;
        let chronicle = state.chronicles.entry(space.clone()).or_default();

        chronicle.write(&replica, address, value).await
    }

    /// Close the transaction. Later operations fail with
    /// [`EngramReplicaError::InactiveTransaction`].
    pub async fn abort(&self, reason: Option<String>) -> Result<(), EngramReplicaError> {
        let mut state = self.inner.state.lock().await;

        match state.status {
            Status::Complete => Err(EngramReplicaError::TransactionComplete),
            _ => {
                state.status = Status::Aborted(reason.unwrap_or_else(|| "aborted".to_string()));
                Ok(())
            }
        }
    }

    /// Commit the transaction. Idempotent: the first call compiles and
    /// pushes the journal; later calls return the same outcome. A
    /// successful commit emits exactly one `commit` notification tagged with
    /// this transaction; a rejected one emits exactly one `revert`.
    pub async fn commit(&self) -> Result<Option<Commit>, EngramReplicaError> {
        let mut state = self.inner.state.lock().await;

        if let Some(outcome) = &state.outcome {
            return outcome.clone();
        }

        match &state.status {
            Status::Open => (),
            Status::Aborted(reason) => {
                return Err(EngramReplicaError::TransactionAborted(reason.clone()));
            }
            Status::Complete => return Err(EngramReplicaError::TransactionComplete),
        }

        state.status = Status::Complete;

        let writer = state.writer.clone();
        let chronicles = std::mem::take(&mut state.chronicles);
        let replicas = state.replicas.clone();

        // Revalidate the reads of every touched space; the writer space is
        // compiled last so its edit reflects a consistent view
        let mut edit = None;

        for (space, chronicle) in &chronicles {
            let replica = replicas
                .get(space)
                .cloned()
                .expect("a chronicle implies a memoized replica");

            match chronicle.commit(&replica).await {
                Ok(compiled) => {
                    if writer.as_ref() == Some(space) {
                        edit = Some((replica, compiled));
                    }
                }
                Err(error) => {
                    self.revert_unpushed(&replica, chronicle, &error).await;
                    let outcome = Err(error);
                    state.outcome = Some(outcome.clone());
                    return outcome;
                }
            }
        }

        let outcome = match edit {
            Some((replica, edit)) if !edit.is_empty() => {
                replica.push(edit, self.inner.id).await.map(Some)
            }
            _ => Ok(None),
        };

        state.outcome = Some(outcome.clone());
        outcome
    }

    /// Announce the rollback of a transaction whose journal failed local
    /// revalidation (nothing reached the nursery; the checkout is the
    /// current store state).
    async fn revert_unpushed(
        &self,
        replica: &Arc<Replica<C>>,
        chronicle: &Chronicle,
        error: &EngramReplicaError,
    ) {
        let mut changes = Vec::new();

        for (key, novelty) in chronicle.novelty_values() {
            let after = replica
                .get(key)
                .await
                .and_then(|revision| revision.is().cloned());

            changes.push(NotificationChange {
                address: key.address(),
                before: novelty.cloned(),
                after,
            });
        }

        self.inner.repository.relay().dispatch(Notification::Revert {
            space: replica.space().clone(),
            changes,
            reason: format!("{error}"),
            source: self.inner.id,
        });
    }

    async fn ensure_open(&self) -> Result<(), EngramReplicaError> {
        let state = self.inner.state.lock().await;

        match &state.status {
            Status::Open => Ok(()),
            Status::Aborted(_) => Err(EngramReplicaError::InactiveTransaction),
            Status::Complete => Err(EngramReplicaError::TransactionComplete),
        }
    }

    async fn bind_writer(&self, space: &Space) -> Result<(), EngramReplicaError> {
        let mut state = self.inner.state.lock().await;

        match &state.writer {
            None => {
                state.writer = Some(space.clone());
                Ok(())
            }
            Some(bound) if bound == space => Ok(()),
            Some(bound) => Err(EngramReplicaError::WriteIsolation {
                bound: bound.clone(),
                requested: space.clone(),
            }),
        }
    }

    async fn replica(&self, space: &Space) -> Arc<Replica<C>> {
        {
            let state = self.inner.state.lock().await;
            if let Some(replica) = state.replicas.get(space) {
                return replica.clone();
            }
        }

        let replica = self.inner.repository.replica(space).await;

        let mut state = self.inner.state.lock().await;
        state
            .replicas
            .entry(space.clone())
            .or_insert_with(|| replica.clone());

        replica
    }
}

/// A read handle bound to one space of a [`StorageTransaction`]
pub struct TransactionReader<C>
where
    C: Consumer,
{
    transaction: StorageTransaction<C>,
    space: Space,
}

impl<C> TransactionReader<C>
where
    C: Consumer,
{
    /// The space this reader is bound to
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Read the value at an address
    pub async fn read(&self, address: &Address) -> Result<Option<Value>, EngramReplicaError> {
        self.transaction.read(&self.space, address).await
    }
}

/// A write handle bound to the single writable space of a
/// [`StorageTransaction`]
pub struct TransactionWriter<C>
where
    C: Consumer,
{
    transaction: StorageTransaction<C>,
    space: Space,
}

impl<C> TransactionWriter<C>
where
    C: Consumer,
{
    /// The space this writer is bound to
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Read the value at an address
    pub async fn read(&self, address: &Address) -> Result<Option<Value>, EngramReplicaError> {
        self.transaction.read(&self.space, address).await
    }

    /// Write a value at an address
    pub async fn write(
        &self,
        address: &Address,
        value: Option<Value>,
    ) -> Result<(), EngramReplicaError> {
        self.transaction.write(&self.space, address, value).await
    }
}
