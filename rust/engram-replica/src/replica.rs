//! Per-space replica coordination.
//!
//! A [`Replica`] owns the heap and nursery for one memory space, pulls
//! missing facts from its remote on demand, pushes transactions with
//! conflict-safe causal chains, merges server-driven subscription updates,
//! and recovers its subscriptions after a reconnect. A [`Repository`]
//! maintains one replica per space behind a shared session and notification
//! relay.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use engram_common::spawn_detached;
use engram_facts::protocol::{Query, QuerySelector, Subscribe, Transact};
use engram_facts::{
    Address, Commit, Edit, Entity, FactKey, LINK_SCAN_BUDGET, MediaType, Reference, Revision,
    Space, UNKNOWN_VERSION, scan_links,
};
use engram_remote::{ConnectionStatus, Consumer, PushRejection};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, OnceCell};

use crate::{
    CellObserver, Cells, EngramReplicaError, FactSource, Merge, Notification, NotificationChange,
    NotificationRelay, NotificationSink, RevisionStore, StorageTransaction, TransactionId,
};

/// One tracked selector: the deduplication cell that collapses concurrent
/// resolutions, the schema that rides along to the server (if any), and
/// whether a live server subscription was established for it.
struct TrackedSelector {
    selector: QuerySelector,
    schema: Option<Value>,
    cell: Arc<OnceCell<()>>,
    subscribed: bool,
}

#[derive(Default)]
struct SelectorTracker {
    entries: HashMap<Reference, TrackedSelector>,
}

impl SelectorTracker {
    /// Selectors that must be re-issued after a reconnect
    fn subscriptions(&self) -> Vec<(QuerySelector, Option<Value>)> {
        self.entries
            .values()
            .filter(|entry| entry.subscribed)
            .map(|entry| (entry.selector.clone(), entry.schema.clone()))
            .collect()
    }

    fn tracks_entity(&self, of: &Entity) -> bool {
        self.entries
            .values()
            .any(|entry| entry.selector.of.as_ref() == Some(of))
    }

    /// The schema attached to any tracked subscription, used to expand the
    /// subscription graph over newly discovered links
    fn any_schema(&self) -> Option<Value> {
        self.entries.values().find_map(|entry| entry.schema.clone())
    }
}

struct ReplicaState {
    heap: Cells,
    nursery: Cells,
    /// References of facts pushed to the server whose subscription echo has
    /// not yet been observed; echoes are merged but not re-announced
    pending: HashMap<FactKey, HashSet<Reference>>,
    /// The highest commit version integrated so far
    last_version: i64,
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self {
            heap: Cells::default(),
            nursery: Cells::default(),
            pending: HashMap::new(),
            last_version: 0,
        }
    }
}

/// Counts remote-facing work in flight so that [`Replica::synced`] can act
/// as a barrier over queries and pending subscription establishment.
#[derive(Clone, Default)]
struct SyncGate {
    counter: Arc<std::sync::atomic::AtomicUsize>,
    notify: Arc<Notify>,
}

struct SyncGuard(SyncGate);

impl SyncGate {
    fn guard(&self) -> SyncGuard {
        self.counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        SyncGuard(self.clone())
    }

    async fn idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.counter.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.0
            .counter
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }
}

/// A local replica of one memory space.
pub struct Replica<C>
where
    C: Consumer,
{
    space: Space,
    session: C,
    relay: NotificationRelay,
    cache: Option<Arc<dyn RevisionStore>>,
    state: Mutex<ReplicaState>,
    tracker: Mutex<SelectorTracker>,
    gate: SyncGate,
    this: OnceLock<Weak<Replica<C>>>,
}

impl<C> Replica<C>
where
    C: Consumer,
{
    /// Open a replica for the given space and begin supervising the
    /// session's connection lifecycle. Server-driven updates start flowing
    /// once a subscription is established (a schema-attached load, or the
    /// commit head watch installed during reconnect recovery); [`Replica::poll`]
    /// covers the gaps.
    pub fn open(
        space: Space,
        session: C,
        relay: NotificationRelay,
        cache: Option<Arc<dyn RevisionStore>>,
    ) -> Arc<Self> {
        let replica = Arc::new(Self {
            space,
            session,
            relay,
            cache,
            state: Mutex::new(ReplicaState::default()),
            tracker: Mutex::new(SelectorTracker::default()),
            gate: SyncGate::default(),
            this: OnceLock::new(),
        });

        let _ = replica.this.set(Arc::downgrade(&replica));

        spawn_detached(supervise(Arc::downgrade(&replica)));

        replica
    }

    /// The space this replica mirrors
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Lookup of the latest locally known revision: nursery first, then
    /// heap.
    pub async fn get(&self, key: &FactKey) -> Option<Revision> {
        let state = self.state.lock().await;
        state
            .nursery
            .get(key)
            .or_else(|| state.heap.get(key))
            .cloned()
    }

    /// Install a per-fact observer on the heap
    pub async fn subscribe(&self, key: FactKey, observer: Weak<dyn CellObserver>) {
        let mut state = self.state.lock().await;
        state.heap.subscribe(key, observer);
    }

    /// Remove a previously installed per-fact observer
    pub async fn unsubscribe(&self, key: &FactKey, observer: &Weak<dyn CellObserver>) {
        let mut state = self.state.lock().await;
        state.heap.unsubscribe(key, observer);
    }

    /// Wait until every in-flight query and subscription establishment has
    /// settled
    pub async fn synced(&self) {
        self.gate.idle().await;
    }

    /// The latest revision this replica can produce for a key: nursery,
    /// then heap, then cache, then a remote pull, then a synthesized
    /// placeholder.
    pub async fn load_fact(&self, key: &FactKey) -> Result<Revision, EngramReplicaError> {
        if let Some(revision) = self.get(key).await {
            return Ok(revision);
        }

        let revisions = self.load(&[Address::from(key.clone())]).await?;

        Ok(revisions
            .into_iter()
            .next()
            .unwrap_or_else(|| Revision::unclaimed(key.the.clone(), key.of.clone())))
    }

    /// Resolve the given addresses against the local store, falling through
    /// to the persisted cache and then to a remote pull for facts this
    /// replica has never observed. Concurrent loads of the same selector
    /// collapse onto one in-flight resolution.
    pub async fn load(&self, addresses: &[Address]) -> Result<Vec<Revision>, EngramReplicaError> {
        self.load_with_schema(addresses, None).await
    }

    /// Like [`Replica::load`], but attaches a schema: the remote installs a
    /// reactive subscription for the selector, and arriving values have
    /// their links scanned to expand the subscription graph.
    pub async fn load_with_schema(
        &self,
        addresses: &[Address],
        schema: Option<Value>,
    ) -> Result<Vec<Revision>, EngramReplicaError> {
        let _guard = self.gate.guard();

        let mut missing: Vec<FactKey> = Vec::new();
        {
            let state = self.state.lock().await;
            for address in addresses {
                let key = address.key();
                if state.nursery.get(&key).is_none()
                    && state.heap.get(&key).is_none()
                    && !missing.contains(&key)
                {
                    missing.push(key);
                }
            }
        }

        // Fall through to the persisted cache first; anything it knows is
        // merged and announced as a load
        if let Some(cache) = &self.cache {
            let mut load_changes = Vec::new();
            let mut state = self.state.lock().await;

            for key in std::mem::take(&mut missing) {
                match cache.load(&key).await {
                    Ok(Some(revision)) => {
                        if let Some(merged) = state.heap.merge(revision, Merge::Put) {
                            load_changes.push(NotificationChange {
                                address: merged.key.address(),
                                before: merged.before.as_ref().and_then(|r| r.is().cloned()),
                                after: merged.after.is().cloned(),
                            });
                            state.heap.notify(&merged.key, &merged.after);
                        }
                    }
                    Ok(None) => missing.push(key),
                    Err(error) => {
                        tracing::debug!("revision cache read failed: {error}");
                        missing.push(key);
                    }
                }
            }

            drop(state);

            if !load_changes.is_empty() {
                self.relay.dispatch(Notification::Load {
                    space: self.space.clone(),
                    changes: load_changes,
                });
            }
        }

        // Anything still missing is pulled from the remote, one selector per
        // key, deduplicated through the tracker. Schema selectors resolve
        // first (they establish the server-side reactive queries), plain
        // ones after.
        if schema.is_some() {
            for key in &missing {
                self.resolve_selector(selector_for(key), schema.clone())
                    .await?;
            }
        } else {
            for key in &missing {
                self.resolve_selector(selector_for(key), None).await?;
            }
        }

        // Every requested address now resolves locally (possibly to a
        // placeholder)
        let mut revisions = Vec::with_capacity(addresses.len());
        let state = self.state.lock().await;
        for address in addresses {
            let key = address.key();
            revisions.push(
                state
                    .nursery
                    .get(&key)
                    .or_else(|| state.heap.get(&key))
                    .cloned()
                    .unwrap_or_else(|| Revision::unclaimed(key.the.clone(), key.of.clone())),
            );
        }

        Ok(revisions)
    }

    /// Resolve one selector against the remote, deduplicated so concurrent
    /// callers share a single in-flight resolution. With a schema attached
    /// the resolution is a live subscription; without one it is a one-shot
    /// query.
    async fn resolve_selector(
        &self,
        selector: QuerySelector,
        schema: Option<Value>,
    ) -> Result<(), EngramReplicaError> {
        let digest = match &schema {
            Some(schema) => Reference::of(&(&selector, schema))?,
            None => selector.digest()?,
        };

        let cell = {
            let mut tracker = self.tracker.lock().await;
            tracker
                .entries
                .entry(digest)
                .or_insert_with(|| TrackedSelector {
                    selector: selector.clone(),
                    schema: schema.clone(),
                    cell: Arc::new(OnceCell::new()),
                    subscribed: false,
                })
                .cell
                .clone()
        };

        cell.get_or_try_init(|| async {
            if schema.is_some() {
                self.establish_subscription(digest, selector).await
            } else {
                let facts = self
                    .session
                    .query(
                        &self.space,
                        Query {
                            select: selector.clone(),
                            since: None,
                        },
                    )
                    .await?;

                let mut revisions = Vec::new();
                for (of, the, record) in facts.iter() {
                    revisions.push(record.to_revision(the.clone(), of.clone())?);
                }

                // Placeholders for what the server did not return
                if let (Some(of), Some(the)) = (&selector.of, &selector.the) {
                    if facts.get(of, the).is_none() {
                        revisions.push(Revision::unclaimed(the.clone(), of.clone()));
                    }
                }

                self.merge_pulled(revisions).await;

                Ok(())
            }
        })
        .await?;

        Ok(())
    }

    /// Install a live server-side subscription for a selector, merge its
    /// snapshot, and pump its updates into [`Replica::integrate_commit`].
    async fn establish_subscription(
        &self,
        digest: Reference,
        selector: QuerySelector,
    ) -> Result<(), EngramReplicaError> {
        let subscription = self
            .session
            .subscribe(
                &self.space,
                Subscribe {
                    select: selector.clone(),
                    since: None,
                    nonce: None,
                },
            )
            .await?;

        {
            let mut tracker = self.tracker.lock().await;
            if let Some(entry) = tracker.entries.get_mut(&digest) {
                entry.subscribed = true;
            }
        }

        let mut revisions = Vec::new();
        for (of, the, record) in subscription.facts.iter() {
            revisions.push(record.to_revision(the.clone(), of.clone())?);
        }

        if let (Some(of), Some(the)) = (&selector.of, &selector.the) {
            if subscription.facts.get(of, the).is_none() {
                revisions.push(Revision::unclaimed(the.clone(), of.clone()));
            }
        }

        self.merge_pulled(revisions).await;

        self.pump(subscription.updates);

        Ok(())
    }

    /// Drive a subscription's update channel into commit integration for as
    /// long as both the channel and this replica live.
    fn pump(&self, mut updates: tokio::sync::mpsc::UnboundedReceiver<engram_facts::protocol::Effect>) {
        let Some(replica) = self.this.get().cloned() else {
            return;
        };

        spawn_detached(async move {
            while let Some(effect) = updates.recv().await {
                let Some(replica) = replica.upgrade() else {
                    break;
                };

                if let Err(error) = replica.integrate_commit(&effect.commit).await {
                    tracing::warn!("could not integrate commit: {error}");
                }
            }
        });
    }

    /// Merge remotely pulled revisions into the heap and report the
    /// differential as a `pull` notification.
    async fn merge_pulled(&self, revisions: Vec<Revision>) {
        let mut changes = Vec::new();
        let mut arrived = Vec::new();

        {
            let mut state = self.state.lock().await;

            for revision in revisions {
                state.last_version = state.last_version.max(revision.since);

                let Some(merged) = state.heap.merge(revision, Merge::Put) else {
                    continue;
                };

                state.heap.notify(&merged.key, &merged.after);

                changes.push(NotificationChange {
                    address: merged.key.address(),
                    before: merged.before.as_ref().and_then(|r| r.is().cloned()),
                    after: merged.after.is().cloned(),
                });

                arrived.push(merged.after);
            }
        }

        self.persist(&arrived).await;

        if !changes.is_empty() {
            self.relay.dispatch(Notification::Pull {
                space: self.space.clone(),
                changes,
            });
        }

        self.schedule_expansion(arrived);
    }

    /// Widen the subscription graph over the links of freshly arrived
    /// values, off the calling path. Expansion of one snapshot can pull in
    /// further documents whose snapshots expand again; running each round as
    /// its own task keeps the traversal a bounded worklist rather than a
    /// recursive descent.
    fn schedule_expansion(&self, arrived: Vec<Revision>) {
        if arrived.is_empty() {
            return;
        }

        let Some(replica) = self.this.get().cloned() else {
            return;
        };

        let guard = self.gate.guard();

        spawn_detached(async move {
            let _guard = guard;

            let Some(replica) = replica.upgrade() else {
                return;
            };

            replica.expand_subscriptions(&arrived).await;
        });
    }

    /// The unconditional subscription to the space's own commit head, so
    /// that every later commit reaches this replica as it happens. Installed
    /// during reconnect recovery.
    async fn watch_commit_head(&self) -> Result<(), EngramReplicaError> {
        let selector = QuerySelector {
            of: Some(self.space.entity()?),
            the: Some(MediaType::commit()),
            since: None,
        };

        let subscription = self
            .session
            .subscribe(
                &self.space,
                Subscribe {
                    select: selector.clone(),
                    since: None,
                    nonce: None,
                },
            )
            .await?;

        {
            let digest = selector.digest()?;
            let mut tracker = self.tracker.lock().await;
            tracker.entries.entry(digest).or_insert_with(|| {
                let cell = Arc::new(OnceCell::new());
                let _ = cell.set(());
                TrackedSelector {
                    selector,
                    schema: None,
                    cell,
                    subscribed: true,
                }
            });
        }

        // The snapshot carries the latest commit; integrate it so the
        // replica resumes from the current head
        let snapshot: Vec<Commit> = subscription
            .facts
            .iter()
            .filter_map(|(_, _, record)| record.is.as_ref())
            .filter_map(|value| serde_json::from_value(value.clone()).ok())
            .collect();

        for commit in snapshot {
            self.integrate_commit(&commit).await?;
        }

        self.pump(subscription.updates);

        Ok(())
    }

    /// Feed one server commit through integration: the commit's facts plus
    /// the commit head fact itself become revisions at the commit's version.
    pub async fn integrate_commit(&self, commit: &Commit) -> Result<(), EngramReplicaError> {
        let mut revisions = Vec::with_capacity(commit.facts.len() + 1);

        for stored in &commit.facts {
            revisions.push(Revision::new(stored.fact.clone(), commit.version));
        }

        revisions.push(Revision::new(
            commit.to_fact(&self.space)?.into(),
            commit.version,
        ));

        self.integrate(revisions).await
    }

    /// Inbound apply from a server-driven subscription. Revisions whose
    /// facts this replica pushed itself are merged silently (their `commit`
    /// notification already fired); everything else is merged, announced to
    /// cell observers, and reported as an `integrate` notification.
    pub async fn integrate(&self, revisions: Vec<Revision>) -> Result<(), EngramReplicaError> {
        let mut changes = Vec::new();
        let mut arrived: Vec<Revision> = Vec::new();

        {
            let mut state = self.state.lock().await;

            for revision in revisions {
                let key = revision.fact.key();
                let reference = revision.fact.reference()?;

                let mut echoed = false;
                if let Some(reference) = &reference {
                    if let Some(pending) = state.pending.get_mut(&key) {
                        echoed = pending.remove(reference);
                        let drained = pending.is_empty();
                        if drained {
                            state.pending.remove(&key);
                        }
                    }
                }

                state.last_version = state.last_version.max(revision.since);

                let Some(merged) = state.heap.merge(revision, Merge::Put) else {
                    continue;
                };

                state.nursery.evict(&key, &merged.after);
                state.heap.notify(&merged.key, &merged.after);

                if !echoed {
                    changes.push(NotificationChange {
                        address: merged.key.address(),
                        before: merged.before.as_ref().and_then(|r| r.is().cloned()),
                        after: merged.after.is().cloned(),
                    });
                }

                arrived.push(merged.after);
            }
        }

        self.persist(&arrived).await;

        if !changes.is_empty() {
            self.relay.dispatch(Notification::Integrate {
                space: self.space.clone(),
                changes,
            });
        }

        self.expand_subscriptions(&arrived).await;

        Ok(())
    }

    /// Read the space's commit log head and feed anything new into
    /// integration.
    pub async fn poll(&self) -> Result<(), EngramReplicaError> {
        let _guard = self.gate.guard();

        let since = {
            let state = self.state.lock().await;
            state.last_version + 1
        };

        let facts = self
            .session
            .query(
                &self.space,
                Query {
                    select: QuerySelector {
                        of: Some(self.space.entity()?),
                        the: Some(MediaType::commit()),
                        since: Some(since),
                    },
                    since: None,
                },
            )
            .await?;

        for (_, _, record) in facts.iter() {
            let Some(value) = &record.is else { continue };
            let commit: Commit = serde_json::from_value(value.clone())
                .map_err(|error| EngramReplicaError::Codec(format!("{error}")))?;

            self.integrate_commit(&commit).await?;
        }

        Ok(())
    }

    /// Drop every held revision (keeping observer registrations), the
    /// nursery, the selector tracker, and the pending echo suppression;
    /// announce the reset. Used when a reconnected session can no longer
    /// vouch for local state.
    pub async fn reset(&self) {
        {
            let mut state = self.state.lock().await;
            state.heap.clear();
            state.nursery.clear();
            state.pending.clear();
            state.last_version = 0;
        }

        {
            let mut tracker = self.tracker.lock().await;
            tracker.entries.clear();
        }

        self.relay.dispatch(Notification::Reset {
            space: self.space.clone(),
        });
    }

    /// Recover after a reconnect: poll the commit log, reset local state,
    /// then re-issue every tracked subscription plus the unconditional
    /// commit head watch.
    pub async fn recover(&self) -> Result<(), EngramReplicaError> {
        let _guard = self.gate.guard();

        if let Err(error) = self.poll().await {
            tracing::debug!("pre-reset poll failed: {error}");
        }

        let subscriptions = {
            let tracker = self.tracker.lock().await;
            tracker.subscriptions()
        };

        self.reset().await;

        if let Err(error) = self.watch_commit_head().await {
            tracing::warn!("could not re-establish commit head watch: {error}");
        }

        for (selector, schema) in subscriptions {
            if selector.the == Some(MediaType::commit()) {
                continue;
            }

            if let Err(error) = self.resolve_selector(selector, schema).await {
                tracing::warn!("could not re-establish subscription: {error}");
            }
        }

        Ok(())
    }

    /// Commit an edit produced by a transaction journal: mirror it into the
    /// nursery, announce the optimistic commit, forward it to the remote,
    /// and either promote the facts into the heap or roll them back with a
    /// revert.
    pub async fn push(
        &self,
        edit: Edit,
        source: TransactionId,
    ) -> Result<Commit, EngramReplicaError> {
        let _guard = self.gate.guard();

        if edit.is_empty() {
            return Err(EngramReplicaError::Inconsistent(
                "An empty edit cannot be pushed".into(),
            ));
        }

        let transact = Transact::try_from(edit.clone())?;

        // Mirror the outgoing facts into the nursery so reads observe the
        // optimistic state while the remote decides. The pre-push checkout
        // is retained: a revert reports it as the `before` of every change.
        let mut commit_changes = Vec::new();
        let mut checkout: HashMap<FactKey, Option<Value>> = HashMap::new();
        {
            let mut state = self.state.lock().await;

            for fact in &edit.facts {
                let key = fact.key();

                let before = state
                    .nursery
                    .get(&key)
                    .or_else(|| state.heap.get(&key))
                    .and_then(|revision| revision.is().cloned());

                checkout.insert(key.clone(), before.clone());

                let basis = state
                    .heap
                    .get(&key)
                    .map(|revision| revision.since)
                    .unwrap_or(UNKNOWN_VERSION);

                state.nursery.insert(Revision::new(fact.clone(), basis));

                if let Some(reference) = fact.reference()? {
                    state
                        .pending
                        .entry(key.clone())
                        .or_default()
                        .insert(reference);
                }

                commit_changes.push(NotificationChange {
                    address: key.address(),
                    before,
                    after: fact.is().cloned(),
                });
            }
        }

        self.relay.dispatch(Notification::Commit {
            space: self.space.clone(),
            changes: commit_changes,
            source,
        });

        let outcome = match self.session.transact(&self.space, transact).await {
            Ok(pending) => match pending.confirmed.await {
                Ok(outcome) => outcome,
                Err(_) => Err(PushRejection::Failed(
                    engram_remote::EngramRemoteError::Closed("confirmation channel closed".into()),
                )),
            },
            Err(error) => Err(PushRejection::Failed(error)),
        };

        match outcome {
            Ok(commit) => {
                let mut promoted = Vec::new();
                {
                    let mut state = self.state.lock().await;

                    for stored in &commit.facts {
                        let key = stored.fact.key();
                        let revision = Revision::new(stored.fact.clone(), commit.version);

                        state.last_version = state.last_version.max(commit.version);
                        state.nursery.evict(&key, &revision);

                        if let Some(merged) = state.heap.merge(revision, Merge::Put) {
                            state.heap.notify(&merged.key, &merged.after);
                            promoted.push(merged.after);
                        }
                    }
                }

                self.persist(&promoted).await;

                Ok(commit)
            }
            Err(rejection) => {
                let (reason, conflicts) = match &rejection {
                    PushRejection::Conflict(conflicts) => (
                        format!("Commit rejected with {} conflict(s)", conflicts.len()),
                        conflicts.clone(),
                    ),
                    PushRejection::Failed(error) => (format!("{error}"), Vec::new()),
                };

                let mut revert_changes = Vec::new();
                let mut adopted = Vec::new();
                {
                    let mut state = self.state.lock().await;

                    for fact in &edit.facts {
                        let key = fact.key();

                        state.nursery.remove(&key);

                        if let Some(reference) = fact.reference()? {
                            if let Some(pending) = state.pending.get_mut(&key) {
                                pending.remove(&reference);
                                let drained = pending.is_empty();
                                if drained {
                                    state.pending.remove(&key);
                                }
                            }
                        }

                        // If the server told us what it actually holds,
                        // adopt it; otherwise fall back to the pre-push heap
                        // state
                        let actual = conflicts
                            .iter()
                            .find(|conflict| conflict.the == key.the && conflict.of == key.of)
                            .and_then(|conflict| conflict.actual.as_ref());

                        let after = match actual {
                            Some(record) => {
                                let revision =
                                    record.to_revision(key.the.clone(), key.of.clone())?;
                                let after = revision.is().cloned();

                                if let Some(merged) = state.heap.merge(revision, Merge::Put) {
                                    state.heap.notify(&merged.key, &merged.after);
                                    adopted.push(merged.after);
                                }

                                after
                            }
                            None => state
                                .heap
                                .get(&key)
                                .and_then(|revision| revision.is().cloned()),
                        };

                        revert_changes.push(NotificationChange {
                            address: key.address(),
                            before: checkout.get(&key).cloned().flatten(),
                            after,
                        });
                    }

                    // Conflicts over claimed-but-unwritten facts also carry
                    // the server's actual record; adopt those too
                    for conflict in &conflicts {
                        let key = FactKey::new(conflict.the.clone(), conflict.of.clone());

                        if edit.facts.iter().any(|fact| fact.key() == key) {
                            continue;
                        }

                        let Some(record) = &conflict.actual else {
                            continue;
                        };

                        let revision = record.to_revision(key.the.clone(), key.of.clone())?;
                        let after = revision.is().cloned();
                        let before = state
                            .heap
                            .get(&key)
                            .and_then(|revision| revision.is().cloned());

                        if let Some(merged) = state.heap.merge(revision, Merge::Put) {
                            state.heap.notify(&merged.key, &merged.after);
                            adopted.push(merged.after);
                        }

                        revert_changes.push(NotificationChange {
                            address: key.address(),
                            before,
                            after,
                        });
                    }
                }

                self.persist(&adopted).await;

                self.relay.dispatch(Notification::Revert {
                    space: self.space.clone(),
                    changes: revert_changes,
                    reason,
                    source,
                });

                match rejection {
                    PushRejection::Conflict(conflicts) => {
                        Err(EngramReplicaError::Conflict(conflicts))
                    }
                    PushRejection::Failed(error) => Err(error.into()),
                }
            }
        }
    }

    /// Best-effort write-back of merged revisions into the persisted cache
    async fn persist(&self, revisions: &[Revision]) {
        let Some(cache) = &self.cache else {
            return;
        };

        for revision in revisions {
            if revision.is_placeholder() {
                continue;
            }

            if let Err(error) = cache.store(revision).await {
                tracing::debug!("revision cache write failed: {error}");
            }
        }
    }

    /// Scan freshly arrived values for `{"/": id}` links and widen the
    /// subscription graph to cover newly discovered entities. Bounded by the
    /// link scan budget; cycles terminate because already-tracked entities
    /// are skipped.
    async fn expand_subscriptions(&self, arrived: &[Revision]) {
        let schema = {
            let tracker = self.tracker.lock().await;
            tracker.any_schema()
        };

        let Some(schema) = schema else {
            return;
        };

        let mut discovered = Vec::new();
        {
            let tracker = self.tracker.lock().await;

            for revision in arrived {
                let Some(value) = revision.is() else { continue };

                for entity in scan_links(value, LINK_SCAN_BUDGET) {
                    if entity.is_inline() || tracker.tracks_entity(&entity) {
                        continue;
                    }
                    if !discovered.contains(&entity) {
                        discovered.push(entity);
                    }
                }
            }
        }

        for entity in discovered {
            let selector = QuerySelector {
                of: Some(entity),
                the: Some(MediaType::json()),
                since: None,
            };

            if let Err(error) = self.resolve_selector(selector, Some(schema.clone())).await {
                tracing::warn!("could not expand subscription graph: {error}");
            }
        }
    }
}

fn selector_for(key: &FactKey) -> QuerySelector {
    QuerySelector {
        of: Some(key.of.clone()),
        the: Some(key.the.clone()),
        since: None,
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl<C> FactSource for Arc<Replica<C>>
where
    C: Consumer,
{
    async fn load_fact(&self, key: &FactKey) -> Result<Revision, EngramReplicaError> {
        Replica::load_fact(self, key).await
    }
}

/// Watches the session's connection lifecycle and drives recovery after a
/// reconnect.
async fn supervise<C>(replica: Weak<Replica<C>>)
where
    C: Consumer,
{
    let mut status = {
        let Some(replica) = replica.upgrade() else {
            return;
        };
        replica.session.status(&replica.space)
    };

    loop {
        if status.changed().await.is_err() {
            return;
        }

        let current = *status.borrow();

        match current {
            ConnectionStatus::Open { count } if count > 1 => {
                let Some(replica) = replica.upgrade() else {
                    return;
                };

                tracing::debug!(space = %replica.space, "recovering after reconnect");

                if let Err(error) = replica.recover().await {
                    tracing::warn!("recovery failed: {error}");
                }
            }
            ConnectionStatus::Closed => return,
            _ => (),
        }
    }
}

/// The engine facade: one [`Replica`] per space behind a shared session,
/// notification relay and optional revision cache.
pub struct Repository<C>
where
    C: Consumer,
{
    session: C,
    relay: NotificationRelay,
    cache: Option<Arc<dyn RevisionStore>>,
    replicas: Arc<Mutex<HashMap<Space, Arc<Replica<C>>>>>,
}

impl<C> Clone for Repository<C>
where
    C: Consumer,
{
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            relay: self.relay.clone(),
            cache: self.cache.clone(),
            replicas: self.replicas.clone(),
        }
    }
}

impl<C> Repository<C>
where
    C: Consumer,
{
    /// Open a repository over the given session
    pub fn open(session: C) -> Self {
        Self {
            session,
            relay: NotificationRelay::new(),
            cache: None,
            replicas: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach a persisted revision cache (best effort; correctness never
    /// depends on its contents)
    pub fn with_cache(mut self, cache: Arc<dyn RevisionStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The notification relay shared by every replica of this repository
    pub fn relay(&self) -> &NotificationRelay {
        &self.relay
    }

    /// Install a notification sink on the shared relay
    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) {
        self.relay.subscribe(sink);
    }

    /// The replica for a space, created on first use
    pub async fn replica(&self, space: &Space) -> Arc<Replica<C>> {
        let mut replicas = self.replicas.lock().await;

        replicas
            .entry(space.clone())
            .or_insert_with(|| {
                Replica::open(
                    space.clone(),
                    self.session.clone(),
                    self.relay.clone(),
                    self.cache.clone(),
                )
            })
            .clone()
    }

    /// Open a new transaction over this repository
    pub fn edit(&self) -> StorageTransaction<C> {
        StorageTransaction::open(self.clone())
    }

    /// Wait until every replica's in-flight remote work has settled
    pub async fn synced(&self) {
        let replicas: Vec<Arc<Replica<C>>> = {
            let replicas = self.replicas.lock().await;
            replicas.values().cloned().collect()
        };

        for replica in replicas {
            replica.synced().await;
        }
    }
}
