use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use engram_common::spawn_detached;
use engram_facts::protocol::{
    Command, Effect, Envelope, Frame, Query, Receipt, ReceiptError, ReceiptOk, Subscribe,
    SubscriptionId, Transact, Unsubscribe,
};
use engram_facts::{Fact, Operation, Space, StoredFact};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::{
    Authority, ConnectionStatus, Consumer, EngramRemoteError, PendingCommit, PushRejection,
    Settings, SubscriptionHandle,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One command awaiting its receipt. The envelope is retained so that a
/// reconnected socket can re-deliver everything the previous connection left
/// unacknowledged; the causal chain makes re-delivery at-most-once safe.
struct PendingCommand {
    envelope: Envelope,
    reply: Option<oneshot::Sender<Receipt>>,
    updates: Option<mpsc::UnboundedSender<Effect>>,
}

#[derive(Default)]
struct SessionState {
    next_id: u64,
    pending: HashMap<u64, PendingCommand>,
    watchers: HashMap<SubscriptionId, mpsc::UnboundedSender<Effect>>,
}

struct SessionInner {
    space: Space,
    authority: Authority,
    outbox: mpsc::UnboundedSender<u64>,
    state: Mutex<SessionState>,
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
}

/// A framed websocket connection to a remote memory service, bound to one
/// space. Commands are signed envelopes; commands produced while the
/// connection is down (or lost with it) are queued and drained ahead of the
/// reader loop when the connection is re-established.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session for the given space. The connection is established in
    /// the background; commands may be issued immediately and are delivered
    /// once the socket is up.
    pub fn open(
        space: Space,
        settings: Settings,
        authority: Authority,
    ) -> Result<Self, EngramRemoteError> {
        let url = settings.socket_url(&space)?;

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Connecting);

        let inner = Arc::new(SessionInner {
            space,
            authority,
            outbox,
            state: Mutex::new(SessionState::default()),
            status,
            cancel: CancellationToken::new(),
        });

        let session = Session {
            inner: inner.clone(),
        };

        spawn_detached(run(inner, settings, url, outbox_rx));

        Ok(session)
    }

    /// Shut the session down for good. In-flight commands resolve with
    /// [`EngramRemoteError::Closed`].
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let _ = self.inner.status.send(ConnectionStatus::Closed);

        let mut state = self.inner.state.lock().await;
        state.pending.clear();
        state.watchers.clear();
    }

    async fn invoke(
        &self,
        command: Command,
        updates: Option<mpsc::UnboundedSender<Effect>>,
    ) -> Result<oneshot::Receiver<Receipt>, EngramRemoteError> {
        if self.inner.cancel.is_cancelled() {
            return Err(EngramRemoteError::Closed("session is shut down".into()));
        }

        let (reply, receipt) = oneshot::channel();

        let id = {
            let mut state = self.inner.state.lock().await;
            state.next_id += 1;
            let id = state.next_id;

            let envelope = self.inner.authority.seal(Envelope {
                id,
                space: self.inner.space.clone(),
                issuer: String::new(),
                command,
                signature: None,
            })?;

            state.pending.insert(
                id,
                PendingCommand {
                    envelope,
                    reply: Some(reply),
                    updates,
                },
            );

            id
        };

        self.inner
            .outbox
            .send(id)
            .map_err(|_| EngramRemoteError::Closed("session pump has exited".into()))?;

        Ok(receipt)
    }

    async fn await_receipt(
        receipt: oneshot::Receiver<Receipt>,
    ) -> Result<ReceiptOk, EngramRemoteError> {
        let receipt = receipt
            .await
            .map_err(|_| EngramRemoteError::Closed("session is shut down".into()))?;

        receipt.into_result().map_err(EngramRemoteError::from)
    }
}

#[async_trait]
impl Consumer for Session {
    async fn transact(
        &self,
        space: &Space,
        transact: Transact,
    ) -> Result<PendingCommit, EngramRemoteError> {
        expect_space(&self.inner.space, space)?;

        let mut facts = Vec::new();
        for operation in &transact.operations {
            match operation {
                Operation::Assert(assertion) => {
                    facts.push(StoredFact::try_from(Fact::Assertion(assertion.clone()))?)
                }
                Operation::Retract(retraction) => {
                    facts.push(StoredFact::try_from(Fact::Retraction(retraction.clone()))?)
                }
                Operation::Claim(_) => (),
            }
        }

        let receipt = self.invoke(Command::Transact(transact), None).await?;
        let (sender, confirmed) = oneshot::channel();

        spawn_detached(async move {
            let outcome = match receipt.await {
                Ok(receipt) => match receipt.into_result() {
                    Ok(ReceiptOk::Commit { commit }) => Ok(commit),
                    Ok(_) => Err(PushRejection::Failed(EngramRemoteError::Transaction(
                        "Remote answered a transact with a non-commit receipt".into(),
                    ))),
                    Err(ReceiptError::Conflict { conflicts }) => {
                        Err(PushRejection::Conflict(conflicts))
                    }
                    Err(other) => Err(PushRejection::Failed(other.into())),
                },
                Err(_) => Err(PushRejection::Failed(EngramRemoteError::Closed(
                    "session is shut down".into(),
                ))),
            };

            let _ = sender.send(outcome);
        });

        Ok(PendingCommit { facts, confirmed })
    }

    async fn query(
        &self,
        space: &Space,
        query: Query,
    ) -> Result<engram_facts::protocol::FactSet, EngramRemoteError> {
        expect_space(&self.inner.space, space)?;

        let receipt = self.invoke(Command::Query(query), None).await?;

        match Self::await_receipt(receipt).await? {
            ReceiptOk::Facts { facts } => Ok(facts),
            _ => Err(EngramRemoteError::Query(
                "Remote answered a query with a non-fact receipt".into(),
            )),
        }
    }

    async fn subscribe(
        &self,
        space: &Space,
        subscribe: Subscribe,
    ) -> Result<SubscriptionHandle, EngramRemoteError> {
        expect_space(&self.inner.space, space)?;

        let (sender, updates) = mpsc::unbounded_channel();

        // The update channel travels with the pending command so the pump
        // installs the watcher before it releases the receipt; no effect
        // frame can slip between installation and reply.
        let receipt = self
            .invoke(Command::Subscribe(subscribe), Some(sender))
            .await?;

        match Self::await_receipt(receipt).await? {
            ReceiptOk::Subscribed { facts, source } => Ok(SubscriptionHandle {
                id: source,
                facts,
                updates,
            }),
            _ => Err(EngramRemoteError::Query(
                "Remote answered a subscribe with an unexpected receipt".into(),
            )),
        }
    }

    async fn unsubscribe(
        &self,
        space: &Space,
        id: SubscriptionId,
    ) -> Result<(), EngramRemoteError> {
        expect_space(&self.inner.space, space)?;

        {
            let mut state = self.inner.state.lock().await;
            state.watchers.remove(&id);
        }

        let receipt = self
            .invoke(Command::Unsubscribe(Unsubscribe { source: id }), None)
            .await?;

        match Self::await_receipt(receipt).await? {
            ReceiptOk::Unsubscribed => Ok(()),
            _ => Err(EngramRemoteError::Query(
                "Remote answered an unsubscribe with an unexpected receipt".into(),
            )),
        }
    }

    fn status(&self, _space: &Space) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }
}

/// Lazily opens one [`Session`] per space behind the shared [`Consumer`]
/// interface, so a multi-space repository can ride a single configuration.
#[derive(Clone)]
pub struct SessionPool {
    settings: Settings,
    authority: Authority,
    sessions: Arc<std::sync::Mutex<HashMap<Space, Session>>>,
}

impl SessionPool {
    /// Create a pool that opens sessions against the configured endpoint
    pub fn new(settings: Settings, authority: Authority) -> Self {
        Self {
            settings,
            authority,
            sessions: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    fn session(&self, space: &Space) -> Result<Session, EngramRemoteError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");

        if let Some(session) = sessions.get(space) {
            return Ok(session.clone());
        }

        let session = Session::open(
            space.clone(),
            self.settings.clone(),
            self.authority.clone(),
        )?;
        sessions.insert(space.clone(), session.clone());

        Ok(session)
    }
}

#[async_trait]
impl Consumer for SessionPool {
    async fn transact(
        &self,
        space: &Space,
        transact: Transact,
    ) -> Result<PendingCommit, EngramRemoteError> {
        self.session(space)?.transact(space, transact).await
    }

    async fn query(
        &self,
        space: &Space,
        query: Query,
    ) -> Result<engram_facts::protocol::FactSet, EngramRemoteError> {
        self.session(space)?.query(space, query).await
    }

    async fn subscribe(
        &self,
        space: &Space,
        subscribe: Subscribe,
    ) -> Result<SubscriptionHandle, EngramRemoteError> {
        self.session(space)?.subscribe(space, subscribe).await
    }

    async fn unsubscribe(
        &self,
        space: &Space,
        id: SubscriptionId,
    ) -> Result<(), EngramRemoteError> {
        self.session(space)?.unsubscribe(space, id).await
    }

    fn status(&self, space: &Space) -> watch::Receiver<ConnectionStatus> {
        match self.session(space) {
            Ok(session) => session.status(space),
            Err(_) => {
                // The session could not be opened at all; report the
                // connection as closed for good
                let (_, receiver) = watch::channel(ConnectionStatus::Closed);
                receiver
            }
        }
    }
}

fn expect_space(bound: &Space, requested: &Space) -> Result<(), EngramRemoteError> {
    if bound == requested {
        Ok(())
    } else {
        Err(EngramRemoteError::Query(format!(
            "Session is bound to {bound}, not {requested}"
        )))
    }
}

enum ConnectionEnd {
    /// The session was shut down; the pump should exit
    Shutdown,
    /// The socket was lost; the pump should reconnect
    Lost,
}

async fn run(
    inner: Arc<SessionInner>,
    settings: Settings,
    url: url::Url,
    mut outbox: mpsc::UnboundedReceiver<u64>,
) {
    let mut connections: u64 = 0;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        connections += 1;

        let connected = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            connected = timeout(settings.connect_timeout, connect_async(url.as_str())) => connected,
        };

        let socket = match connected {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(error)) => {
                tracing::warn!(%url, "connection failed: {error}");
                continue;
            }
            Err(_) => {
                tracing::warn!(%url, "connection handshake timed out");
                continue;
            }
        };

        tracing::debug!(%url, connections, "connection established");
        let _ = inner.status.send(ConnectionStatus::Open { count: connections });

        let end = pump(&inner, socket, &mut outbox).await;

        // Watchers die with the connection; the replica re-subscribes after
        // observing the next Open status.
        {
            let mut state = inner.state.lock().await;
            state.watchers.clear();
        }

        match end {
            ConnectionEnd::Shutdown => break,
            ConnectionEnd::Lost => {
                tracing::debug!(%url, "connection lost, reconnecting");
                let _ = inner.status.send(ConnectionStatus::Connecting);
            }
        }
    }

    let _ = inner.status.send(ConnectionStatus::Closed);
}

async fn pump(
    inner: &Arc<SessionInner>,
    socket: Socket,
    outbox: &mut mpsc::UnboundedReceiver<u64>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = socket.split();

    // Drain the retry queue ahead of the reader loop: everything the
    // previous connection left unacknowledged goes out again first.
    let backlog = {
        let state = inner.state.lock().await;
        let mut backlog: Vec<Envelope> = state
            .pending
            .values()
            .map(|pending| pending.envelope.clone())
            .collect();
        backlog.sort_by_key(|envelope| envelope.id);
        backlog
    };

    for envelope in backlog {
        if send_envelope(&mut sink, &envelope).await.is_err() {
            return ConnectionEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return ConnectionEnd::Shutdown;
            }
            submitted = outbox.recv() => {
                let Some(id) = submitted else {
                    return ConnectionEnd::Shutdown;
                };

                let envelope = {
                    let state = inner.state.lock().await;
                    state.pending.get(&id).map(|pending| pending.envelope.clone())
                };

                if let Some(envelope) = envelope {
                    if send_envelope(&mut sink, &envelope).await.is_err() {
                        return ConnectionEnd::Lost;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => receive_frame(inner, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Lost,
                    Some(Ok(_)) => (),
                    Some(Err(error)) => {
                        tracing::warn!("socket read failed: {error}");
                        return ConnectionEnd::Lost;
                    }
                }
            }
        }
    }
}

type SocketSink = futures_util::stream::SplitSink<Socket, Message>;

async fn send_envelope(sink: &mut SocketSink, envelope: &Envelope) -> Result<(), ()> {
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(error) => {
            tracing::warn!("could not serialize envelope {}: {error}", envelope.id);
            return Ok(());
        }
    };

    sink.send(Message::Text(text.into()))
        .await
        .map_err(|error| {
            tracing::warn!("socket write failed: {error}");
        })
}

async fn receive_frame(inner: &Arc<SessionInner>, text: &str) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!("discarding unreadable frame: {error}");
            return;
        }
    };

    let mut state = inner.state.lock().await;

    match frame {
        Frame::Receipt(receipt) => {
            let Some(mut pending) = state.pending.remove(&receipt.of) else {
                tracing::debug!("receipt for unknown command {}", receipt.of);
                return;
            };

            // Install the subscription watcher before releasing the receipt
            if let Receipt {
                outcome: engram_facts::protocol::Outcome::Ok(ReceiptOk::Subscribed { source, .. }),
                ..
            } = &receipt
            {
                if let Some(updates) = pending.updates.take() {
                    state.watchers.insert(*source, updates);
                }
            }

            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(receipt);
            }
        }
        Frame::Effect(effect) => {
            let source = effect.source;
            let delivered = state
                .watchers
                .get(&source)
                .map(|watcher| watcher.send(effect).is_ok())
                .unwrap_or(false);

            if !delivered {
                state.watchers.remove(&source);
            }
        }
    }
}
