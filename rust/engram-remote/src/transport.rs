//! Transport selection.
//!
//! [`AnySession`] is the [`Consumer`] a caller gets from [`Settings`] alone:
//! a `memory:` API URL yields the in-process emulated session, anything else
//! a pool of websocket sessions. Everything downstream is generic over
//! [`Consumer`] and cannot tell the two apart.

use async_trait::async_trait;
use engram_facts::Space;
use engram_facts::protocol::{FactSet, Query, Subscribe, SubscriptionId, Transact};
use tokio::sync::watch;

use crate::{
    ConnectionStatus, Consumer, EngramRemoteError, MemorySession, PendingCommit, Settings,
    SubscriptionHandle,
};

#[cfg(not(target_arch = "wasm32"))]
use crate::{Authority, SessionPool};

/// A [`Consumer`] chosen from configuration rather than named by type.
#[derive(Clone)]
pub enum AnySession {
    /// The in-process emulated transport
    Emulated(MemorySession),
    /// A pool of websocket sessions, one per space
    #[cfg(not(target_arch = "wasm32"))]
    Remote(SessionPool),
}

impl AnySession {
    /// Choose a transport from the given settings. The signing authority is
    /// only consulted for remote transports.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn from_settings(
        settings: Settings,
        authority: Authority,
    ) -> Result<Self, EngramRemoteError> {
        if settings.is_emulated() {
            Ok(AnySession::Emulated(MemorySession::new()))
        } else {
            Ok(AnySession::Remote(SessionPool::new(settings, authority)))
        }
    }

    /// Choose a transport from the given settings. Only the emulated
    /// transport is available on this target.
    #[cfg(target_arch = "wasm32")]
    pub fn from_settings(settings: Settings) -> Result<Self, EngramRemoteError> {
        if settings.is_emulated() {
            Ok(AnySession::Emulated(MemorySession::new()))
        } else {
            Err(EngramRemoteError::Connection(
                "remote transports are not available on this target".into(),
            ))
        }
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl Consumer for AnySession {
    async fn transact(
        &self,
        space: &Space,
        transact: Transact,
    ) -> Result<PendingCommit, EngramRemoteError> {
        match self {
            AnySession::Emulated(session) => session.transact(space, transact).await,
            #[cfg(not(target_arch = "wasm32"))]
            AnySession::Remote(pool) => pool.transact(space, transact).await,
        }
    }

    async fn query(&self, space: &Space, query: Query) -> Result<FactSet, EngramRemoteError> {
        match self {
            AnySession::Emulated(session) => session.query(space, query).await,
            #[cfg(not(target_arch = "wasm32"))]
            AnySession::Remote(pool) => pool.query(space, query).await,
        }
    }

    async fn subscribe(
        &self,
        space: &Space,
        subscribe: Subscribe,
    ) -> Result<SubscriptionHandle, EngramRemoteError> {
        match self {
            AnySession::Emulated(session) => session.subscribe(space, subscribe).await,
            #[cfg(not(target_arch = "wasm32"))]
            AnySession::Remote(pool) => pool.subscribe(space, subscribe).await,
        }
    }

    async fn unsubscribe(
        &self,
        space: &Space,
        id: SubscriptionId,
    ) -> Result<(), EngramRemoteError> {
        match self {
            AnySession::Emulated(session) => session.unsubscribe(space, id).await,
            #[cfg(not(target_arch = "wasm32"))]
            AnySession::Remote(pool) => pool.unsubscribe(space, id).await,
        }
    }

    fn status(&self, space: &Space) -> watch::Receiver<ConnectionStatus> {
        match self {
            AnySession::Emulated(session) => session.status(space),
            #[cfg(not(target_arch = "wasm32"))]
            AnySession::Remote(pool) => pool.status(space),
        }
    }
}
