//! The notification relay.
//!
//! Replicas report every observable state change as a [`Notification`]
//! fanned out to in-process [`NotificationSink`]s. The set of notification
//! types is closed; a reactive scheduler drives itself entirely off this
//! stream plus the transaction API.

use std::sync::{Arc, Mutex};

use engram_common::ConditionalSync;
use engram_facts::{Address, Space};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::TransactionId;

/// One changed address inside a [`Notification`]: the fact value before and
/// after the change (`None` for absence)
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationChange {
    /// The changed address (path is empty for whole-fact changes)
    pub address: Address,
    /// The value before the change
    pub before: Option<Value>,
    /// The value after the change
    pub after: Option<Value>,
}

/// Everything a replica can tell its observers. Within one space,
/// notifications arrive in dispatch order; a local `Commit` always precedes
/// the `Integrate` of the same underlying commit (which is suppressed for
/// the local writer).
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Data arrived from a remote query
    Pull {
        /// The space the data belongs to
        space: Space,
        /// The merged differences
        changes: Vec<NotificationChange>,
    },
    /// Data was served from the persisted revision cache
    Load {
        /// The space the data belongs to
        space: Space,
        /// The merged differences
        changes: Vec<NotificationChange>,
    },
    /// A spontaneous server update arrived via a live subscription
    Integrate {
        /// The space the data belongs to
        space: Space,
        /// The merged differences
        changes: Vec<NotificationChange>,
    },
    /// A local transaction succeeded (optimistically; the server commit
    /// follows through the causal chain)
    Commit {
        /// The space the transaction wrote to
        space: Space,
        /// The written differences
        changes: Vec<NotificationChange>,
        /// The transaction that produced the commit
        source: TransactionId,
    },
    /// A local transaction was rolled back
    Revert {
        /// The space the transaction wrote to
        space: Space,
        /// One change per reverted address, before/after taken from the
        /// pre-push checkout
        changes: Vec<NotificationChange>,
        /// Why the transaction was rolled back
        reason: String,
        /// The transaction that was rolled back
        source: TransactionId,
    },
    /// The replica's state was cleared (reconnection)
    Reset {
        /// The space that was reset
        space: Space,
    },
}

impl Notification {
    /// The space this notification is about
    pub fn space(&self) -> &Space {
        match self {
            Notification::Pull { space, .. }
            | Notification::Load { space, .. }
            | Notification::Integrate { space, .. }
            | Notification::Commit { space, .. }
            | Notification::Revert { space, .. }
            | Notification::Reset { space } => space,
        }
    }

    /// The changed addresses, if this notification carries any
    pub fn changes(&self) -> &[NotificationChange] {
        match self {
            Notification::Pull { changes, .. }
            | Notification::Load { changes, .. }
            | Notification::Integrate { changes, .. }
            | Notification::Commit { changes, .. }
            | Notification::Revert { changes, .. } => changes,
            Notification::Reset { .. } => &[],
        }
    }
}

/// What a sink tells the relay after each notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkDisposition {
    /// Keep delivering
    Continue,
    /// Remove this sink from the relay
    Done,
}

/// An in-process observer of [`Notification`]s. A sink that reports
/// [`SinkDisposition::Done`] is pruned; a sink that fails is logged and
/// kept.
pub trait NotificationSink: ConditionalSync {
    /// Deliver one notification
    fn notify(&self, notification: &Notification) -> Result<SinkDisposition, String>;
}

/// Fan-out channel between replicas and their observers. Dispatch happens
/// only after the originating store mutation has fully completed, so sinks
/// observe finalized state and may freely re-enter the read API.
#[derive(Clone, Default)]
pub struct NotificationRelay {
    sinks: Arc<Mutex<Vec<Arc<dyn NotificationSink>>>>,
}

impl NotificationRelay {
    /// Create a new relay with no sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a sink. It receives every later notification until it reports
    /// [`SinkDisposition::Done`].
    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.lock().expect("lock poisoned").push(sink);
    }

    /// Deliver a notification to every installed sink, pruning the done ones
    pub fn dispatch(&self, notification: Notification) {
        let sinks: Vec<Arc<dyn NotificationSink>> = {
            let sinks = self.sinks.lock().expect("lock poisoned");
            sinks.clone()
        };

        let mut done = Vec::new();

        for sink in &sinks {
            match sink.notify(&notification) {
                Ok(SinkDisposition::Continue) => (),
                Ok(SinkDisposition::Done) => done.push(Arc::as_ptr(sink)),
                Err(error) => {
                    tracing::warn!("notification sink failed: {error}");
                }
            }
        }

        if !done.is_empty() {
            let mut sinks = self.sinks.lock().expect("lock poisoned");
            sinks.retain(|sink| !done.contains(&Arc::as_ptr(sink)));
        }
    }
}

/// A [`NotificationSink`] that forwards into an unbounded channel and
/// reports itself done once the receiving end is dropped.
pub struct ChannelSink(mpsc::UnboundedSender<Notification>);

impl ChannelSink {
    /// Create a sink/receiver pair
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self(sender)), receiver)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: &Notification) -> Result<SinkDisposition, String> {
        match self.0.send(notification.clone()) {
            Ok(()) => Ok(SinkDisposition::Continue),
            Err(_) => Ok(SinkDisposition::Done),
        }
    }
}
