//! The in-process emulated transport.
//!
//! [`MemorySession`] executes commands synchronously against a local store
//! that mirrors the remote's algorithms: claim and causal-chain validation,
//! monotonic version assignment, commit-fact storage, and subscription
//! broadcast. It backs tests and offline use; a replica cannot tell it apart
//! from a websocket session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use engram_facts::protocol::{
    Conflict, Effect, FactRecord, FactSet, Query, QuerySelector, RevisionRecord, Subscribe,
    SubscriptionId, Transact,
};
use engram_facts::{Commit, Fact, FactKey, MediaType, Operation, Reference, Space, StoredFact};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::{
    ConnectionStatus, Consumer, EngramRemoteError, PendingCommit, PushRejection,
    SubscriptionHandle,
};

struct Watcher {
    selector: QuerySelector,
    sender: mpsc::UnboundedSender<Effect>,
}

#[derive(Default)]
struct SpaceStore {
    records: HashMap<FactKey, FactRecord>,
    version: i64,
    parent: Option<Reference>,
    watchers: HashMap<SubscriptionId, Watcher>,
    next_subscription: u64,
}

impl SpaceStore {
    fn stored_reference(&self, key: &FactKey) -> Option<Reference> {
        self.records.get(key).map(|record| record.reference)
    }

    fn check(&self, key: &FactKey, expected: Option<Reference>, conflicts: &mut Vec<Conflict>) {
        let actual = self.stored_reference(key);

        if actual != expected {
            let already_reported = conflicts
                .iter()
                .any(|conflict| conflict.the == key.the && conflict.of == key.of);

            if !already_reported {
                conflicts.push(Conflict {
                    the: key.the.clone(),
                    of: key.of.clone(),
                    expected,
                    actual: self.records.get(key).cloned(),
                });
            }
        }
    }

    fn transact(
        &mut self,
        space: &Space,
        transact: &Transact,
    ) -> Result<Result<Commit, Vec<Conflict>>, EngramRemoteError> {
        let mut conflicts = Vec::new();

        for claim in transact
            .reads
            .confirmed
            .iter()
            .chain(transact.reads.pending.iter())
        {
            self.check(&claim.key(), claim.fact, &mut conflicts);
        }

        for operation in &transact.operations {
            match operation {
                Operation::Assert(assertion) => {
                    self.check(&operation.key(), assertion.cause, &mut conflicts)
                }
                Operation::Retract(retraction) => {
                    self.check(&operation.key(), Some(retraction.cause), &mut conflicts)
                }
                Operation::Claim(claim) => self.check(&claim.key(), claim.fact, &mut conflicts),
            }
        }

        if !conflicts.is_empty() {
            return Ok(Err(conflicts));
        }

        let version = self.version + 1;
        self.version = version;

        let mut stored = Vec::new();

        for operation in &transact.operations {
            let (key, fact) = match operation {
                Operation::Assert(assertion) => (
                    operation.key(),
                    Fact::Assertion(assertion.clone()),
                ),
                Operation::Retract(retraction) => (
                    operation.key(),
                    Fact::Retraction(retraction.clone()),
                ),
                Operation::Claim(_) => continue,
            };

            let stored_fact = StoredFact::try_from(fact.clone())?;

            self.records.insert(
                key,
                FactRecord {
                    is: fact.is().cloned(),
                    cause: fact.cause().copied(),
                    reference: stored_fact.reference,
                    version,
                },
            );

            stored.push(stored_fact);
        }

        let commit = Commit {
            version,
            facts: stored,
            parent: self.parent,
        };

        let commit_fact = commit.to_fact(space)?;
        let commit_reference = commit_fact.reference()?;
        let commit_key = FactKey::new(MediaType::commit(), commit_fact.of.clone());

        self.records.insert(
            commit_key.clone(),
            FactRecord {
                is: Some(commit_fact.is.clone()),
                cause: commit.parent,
                reference: commit_reference,
                version,
            },
        );
        self.parent = Some(commit_reference);

        self.broadcast(&commit, &commit_key, commit_reference);

        Ok(Ok(commit))
    }

    fn broadcast(&mut self, commit: &Commit, commit_key: &FactKey, commit_reference: Reference) {
        let commit_record = self
            .records
            .get(commit_key)
            .cloned()
            .unwrap_or(FactRecord {
                is: None,
                cause: None,
                reference: commit_reference,
                version: commit.version,
            });

        self.watchers.retain(|source, watcher| {
            let mut revisions = Vec::new();

            for stored in &commit.facts {
                let the = stored.fact.the();
                let of = stored.fact.of();

                if watcher.selector.matches(of, the) {
                    revisions.push(RevisionRecord {
                        the: the.clone(),
                        of: of.clone(),
                        record: FactRecord {
                            is: stored.fact.is().cloned(),
                            cause: stored.fact.cause().copied(),
                            reference: stored.reference,
                            version: commit.version,
                        },
                    });
                }
            }

            if watcher.selector.matches(&commit_key.of, &commit_key.the) {
                revisions.push(RevisionRecord {
                    the: commit_key.the.clone(),
                    of: commit_key.of.clone(),
                    record: commit_record.clone(),
                });
            }

            if revisions.is_empty() {
                return true;
            }

            watcher
                .sender
                .send(Effect {
                    source: *source,
                    commit: commit.clone(),
                    revisions,
                })
                .is_ok()
        });
    }

    fn select(&self, selector: &QuerySelector) -> FactSet {
        let mut facts = FactSet::default();

        for (key, record) in &self.records {
            if !selector.matches(&key.of, &key.the) {
                continue;
            }

            if let Some(since) = selector.since {
                if record.version < since {
                    continue;
                }
            }

            facts.insert(key.of.clone(), key.the.clone(), record.clone());
        }

        facts
    }
}

/// An in-process [`Consumer`] that mirrors the remote's algorithms. One
/// [`MemorySession`] can host any number of spaces; clones share state, so a
/// test can drive "another client" by writing through a clone.
#[derive(Clone)]
pub struct MemorySession {
    spaces: Arc<Mutex<HashMap<Space, SpaceStore>>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl Default for MemorySession {
    fn default() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Open { count: 1 });
        Self {
            spaces: Arc::new(Mutex::new(HashMap::new())),
            status: Arc::new(status),
        }
    }
}

impl MemorySession {
    /// Create a new, empty [`MemorySession`]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current version of the given space (0 if nothing has been
    /// committed yet)
    pub async fn head(&self, space: &Space) -> i64 {
        let spaces = self.spaces.lock().await;
        spaces.get(space).map(|store| store.version).unwrap_or(0)
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl Consumer for MemorySession {
    async fn transact(
        &self,
        space: &Space,
        transact: Transact,
    ) -> Result<PendingCommit, EngramRemoteError> {
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

        let outcome = {
            let mut spaces = self.spaces.lock().await;
            let store = spaces.entry(space.clone()).or_default();
            store.transact(space, &transact)?
        };

        let (sender, confirmed) = oneshot::channel();
        let _ = sender.send(match outcome {
            Ok(commit) => Ok(commit),
            Err(conflicts) => Err(PushRejection::Conflict(conflicts)),
        });

        Ok(PendingCommit { facts, confirmed })
    }

    async fn query(&self, space: &Space, query: Query) -> Result<FactSet, EngramRemoteError> {
        let spaces = self.spaces.lock().await;

        let Some(store) = spaces.get(space) else {
            return Ok(FactSet::default());
        };

        let mut selector = query.select;
        if selector.since.is_none() {
            selector.since = query.since;
        }

        Ok(store.select(&selector))
    }

    async fn subscribe(
        &self,
        space: &Space,
        subscribe: Subscribe,
    ) -> Result<SubscriptionHandle, EngramRemoteError> {
        let mut spaces = self.spaces.lock().await;
        let store = spaces.entry(space.clone()).or_default();

        let facts = store.select(&subscribe.select);

        store.next_subscription += 1;
        let id = SubscriptionId(store.next_subscription);

        let (sender, updates) = mpsc::unbounded_channel();
        store.watchers.insert(
            id,
            Watcher {
                selector: subscribe.select,
                sender,
            },
        );

        Ok(SubscriptionHandle { id, facts, updates })
    }

    async fn unsubscribe(
        &self,
        space: &Space,
        id: SubscriptionId,
    ) -> Result<(), EngramRemoteError> {
        let mut spaces = self.spaces.lock().await;

        if let Some(store) = spaces.get_mut(space) {
            store.watchers.remove(&id);
        }

        Ok(())
    }

    fn status(&self, _space: &Space) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use engram_facts::protocol::{Query, Reads, Subscribe, Transact};
    use engram_facts::{
        Assertion, Entity, FactSelector, MediaType, Operation, QuerySelector, Space,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::{Consumer, MemorySession, PushRejection};

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    fn assert_op(of: &Entity, value: serde_json::Value) -> Operation {
        Operation::Assert(Assertion {
            the: MediaType::json(),
            of: of.clone(),
            is: value,
            cause: None,
        })
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
    async fn it_assigns_monotonic_versions_and_links_commits() -> Result<()> {
        let session = MemorySession::new();
        let space = Space::generate()?;
        let of: Entity = "test:counter".parse()?;

        let first = session
            .transact(
                &space,
                Transact {
                    reads: Reads::default(),
                    operations: vec![assert_op(&of, json!({ "value": 0 }))],
                },
            )
            .await?
            .confirmed
            .await?
            .expect("first commit applies");

        let assertion = Assertion {
            the: MediaType::json(),
            of: of.clone(),
            is: json!({ "value": 0 }),
            cause: None,
        };
        let next = assertion.update(json!({ "value": 1 }))?;

        let second = session
            .transact(
                &space,
                Transact {
                    reads: Reads::default(),
                    operations: vec![Operation::Assert(next)],
                },
            )
            .await?
            .confirmed
            .await?
            .expect("second commit applies");

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(second.parent.is_some());

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
    async fn it_rejects_a_stale_causal_chain_with_the_actual_record() -> Result<()> {
        let session = MemorySession::new();
        let space = Space::generate()?;
        let of: Entity = "test:list".parse()?;

        session
            .transact(
                &space,
                Transact {
                    reads: Reads::default(),
                    operations: vec![assert_op(&of, json!([1, 2, 3]))],
                },
            )
            .await?
            .confirmed
            .await?
            .expect("seed commit applies");

        // A second writer that never saw the seed commit
        let rejection = session
            .transact(
                &space,
                Transact {
                    reads: Reads::default(),
                    operations: vec![assert_op(&of, json!([4]))],
                },
            )
            .await?
            .confirmed
            .await?
            .expect_err("stale cause is rejected");

        match rejection {
            PushRejection::Conflict(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                let actual = conflicts[0].actual.as_ref().expect("server has a record");
                assert_eq!(actual.is, Some(json!([1, 2, 3])));
            }
            other => panic!("expected a conflict, got {other:?}"),
        }

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
    async fn it_broadcasts_matching_revisions_to_subscribers() -> Result<()> {
        let session = MemorySession::new();
        let space = Space::generate()?;
        let of: Entity = "test:counter".parse()?;

        let mut subscription = session
            .subscribe(
                &space,
                Subscribe {
                    select: QuerySelector::from(
                        FactSelector::new().of(of.clone()).the(MediaType::json()),
                    ),
                    since: None,
                    nonce: None,
                },
            )
            .await?;

        assert!(subscription.facts.is_empty());

        session
            .transact(
                &space,
                Transact {
                    reads: Reads::default(),
                    operations: vec![assert_op(&of, json!({ "value": 1 }))],
                },
            )
            .await?
            .confirmed
            .await?
            .expect("commit applies");

        let effect = subscription.updates.recv().await.expect("update arrives");

        assert_eq!(effect.source, subscription.id);
        assert_eq!(effect.revisions.len(), 1);
        assert_eq!(effect.revisions[0].record.is, Some(json!({ "value": 1 })));

        // A commit that touches an unrelated entity is not broadcast
        session
            .transact(
                &space,
                Transact {
                    reads: Reads::default(),
                    operations: vec![assert_op(&"test:other".parse()?, json!(1))],
                },
            )
            .await?
            .confirmed
            .await?
            .expect("commit applies");

        assert!(subscription.updates.try_recv().is_err());

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
    async fn it_selects_wildcard_entities_by_media_type() -> Result<()> {
        let session = MemorySession::new();
        let space = Space::generate()?;

        let assertions = engram_facts::generate_assertions(8)?;

        session
            .transact(
                &space,
                Transact {
                    reads: Reads::default(),
                    operations: assertions.into_iter().map(Operation::Assert).collect(),
                },
            )
            .await?
            .confirmed
            .await?
            .expect("batch commit applies");

        // A selector that leaves the entity open selects every document of
        // the media type, but not the commit head
        let facts = session
            .query(
                &space,
                Query {
                    select: QuerySelector {
                        of: None,
                        the: Some(MediaType::json()),
                        since: None,
                    },
                    since: None,
                },
            )
            .await?;

        assert_eq!(facts.iter().count(), 8);

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
    async fn it_serves_the_commit_head_like_any_other_fact() -> Result<()> {
        let session = MemorySession::new();
        let space = Space::generate()?;

        session
            .transact(
                &space,
                Transact {
                    reads: Reads::default(),
                    operations: vec![assert_op(&"test:counter".parse()?, json!(1))],
                },
            )
            .await?
            .confirmed
            .await?
            .expect("commit applies");

        let facts = session
            .query(
                &space,
                Query {
                    select: QuerySelector::from(
                        FactSelector::new()
                            .of(space.entity()?)
                            .the(MediaType::commit()),
                    ),
                    since: None,
                },
            )
            .await?;

        let record = facts
            .get(&space.entity()?, &MediaType::commit())
            .expect("commit head is stored");

        assert_eq!(record.version, 1);

        Ok(())
    }
}
