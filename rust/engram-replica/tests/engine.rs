use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use engram_facts::{Address, FactKey, MediaType, Revision, Space};
use engram_remote::MemorySession;
use engram_replica::{
    CellObserver, ChannelSink, EngramReplicaError, Notification, Repository, RevisionCache,
};
use engram_storage::MemoryStorageBackend;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

#[cfg(target_arch = "wasm32")]
use wasm_bindgen_test::wasm_bindgen_test;
#[cfg(target_arch = "wasm32")]
wasm_bindgen_test::wasm_bindgen_test_configure!(run_in_dedicated_worker);

fn address(entity: &str, path: &[&str]) -> Result<Address> {
    Ok(Address::new(MediaType::json(), entity.parse()?, path))
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_accumulates_one_hundred_appends() -> Result<()> {
    let repository = Repository::open(MemorySession::new());
    let space = Space::generate()?;

    let seed = repository.edit();
    seed.write(&space, &address("test:doc", &["my_array"])?, Some(json!([])))
        .await?;
    seed.commit().await?;

    for index in 0..100usize {
        let transaction = repository.edit();
        let item = address("test:doc", &["my_array", &index.to_string()])?;

        transaction.write(&space, &item, Some(json!(index))).await?;
        transaction.commit().await?;
    }

    repository.synced().await;

    let transaction = repository.edit();
    let value = transaction
        .read(&space, &address("test:doc", &["my_array"])?)
        .await?
        .expect("the array exists");

    let items = value.as_array().expect("the value is an array");
    assert_eq!(items.len(), 100);
    assert_eq!(items[0], json!(0));
    assert_eq!(items[99], json!(99));

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_reverts_a_conflicted_push_and_adopts_the_actual() -> Result<()> {
    let session = MemorySession::new();
    let space = Space::generate()?;

    let repository = Repository::open(session.clone());
    let (sink, mut notifications) = ChannelSink::new();
    repository.subscribe(sink);

    // Initialize the list
    let seed = repository.edit();
    seed.write(&space, &address("test:list", &[])?, Some(json!([])))
        .await?;
    seed.commit().await?;

    // An external writer advances the server out of band
    let external = Repository::open(session.clone());
    let advance = external.edit();
    advance
        .write(&space, &address("test:list", &[])?, Some(json!([1, 2, 3])))
        .await?;
    advance.commit().await?;

    // The local writer never observed the external commit
    let stale = repository.edit();
    stale
        .write(&space, &address("test:list", &["0"])?, Some(json!(4)))
        .await?;

    let rejection = stale.commit().await;
    assert!(matches!(rejection, Err(EngramReplicaError::Conflict(_))));

    // Exactly one revert arrived, with the pre-push checkout as `before`
    // and the server's actual value as `after`
    let mut reverts = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        if let Notification::Revert { changes, .. } = notification {
            reverts.push(changes);
        }
    }

    assert_eq!(reverts.len(), 1);
    assert_eq!(reverts[0].len(), 1);
    assert_eq!(reverts[0][0].before, Some(json!([])));
    assert_eq!(reverts[0][0].after, Some(json!([1, 2, 3])));

    // The caller's next transaction observes the server's state
    let next = repository.edit();
    let value = next.read(&space, &address("test:list", &[])?).await?;
    assert_eq!(value, Some(json!([1, 2, 3])));

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_fails_a_commit_whose_reads_have_drifted() -> Result<()> {
    let session = MemorySession::new();
    let space = Space::generate()?;

    let repository = Repository::open(session.clone());
    let (sink, mut notifications) = ChannelSink::new();
    repository.subscribe(sink);

    let seed = repository.edit();
    seed.write(
        &space,
        &address("test:doc", &[])?,
        Some(json!({ "a": { "b": 1 } })),
    )
    .await?;
    seed.commit().await?;

    // T reads the subtree
    let transaction = repository.edit();
    let subtree = transaction
        .read(&space, &address("test:doc", &["a"])?)
        .await?;
    assert_eq!(subtree, Some(json!({ "b": 1 })));

    // A concurrent committed write changes the nested field
    let external = Repository::open(session.clone());
    let concurrent = external.edit();
    concurrent
        .write(&space, &address("test:doc", &["a", "b"])?, Some(json!(2)))
        .await?;
    concurrent.commit().await?;

    // The local replica learns about the external commit
    repository.replica(&space).await.poll().await?;

    // T's nested read is answered by subsumption: still the old value
    let nested = transaction
        .read(&space, &address("test:doc", &["a", "b"])?)
        .await?;
    assert_eq!(nested, Some(json!(1)));

    // A write makes the transaction worth committing; the commit fails
    transaction
        .write(&space, &address("test:doc", &["c"])?, Some(json!(true)))
        .await?;

    let result = transaction.commit().await;
    assert!(matches!(result, Err(EngramReplicaError::Inconsistent(_))));

    let reverts = drain_reverts(&mut notifications);
    assert_eq!(reverts, 1);

    Ok(())
}

fn drain_reverts(
    notifications: &mut tokio::sync::mpsc::UnboundedReceiver<Notification>,
) -> usize {
    let mut reverts = 0;
    while let Ok(notification) = notifications.try_recv() {
        if matches!(notification, Notification::Revert { .. }) {
            reverts += 1;
        }
    }
    reverts
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_links_successive_commits_causally() -> Result<()> {
    let session = MemorySession::new();
    let space = Space::generate()?;
    let repository = Repository::open(session.clone());

    let first = repository.edit();
    first
        .write(&space, &address("test:counter", &[])?, Some(json!({ "value": 0 })))
        .await?;
    let first_commit = first.commit().await?.expect("first commit pushes");

    let second = repository.edit();
    second
        .write(
            &space,
            &address("test:counter", &[])?,
            Some(json!({ "value": 1 })),
        )
        .await?;
    let second_commit = second.commit().await?.expect("second commit pushes");

    let first_fact = &first_commit.facts[0];
    let second_fact = &second_commit.facts[0];

    assert_eq!(second_fact.fact.cause(), Some(&first_fact.reference));
    assert!(second_commit.version > first_commit.version);

    let replica = repository.replica(&space).await;
    let held = replica
        .get(&FactKey::new(MediaType::json(), "test:counter".parse()?))
        .await
        .expect("the fact is on the heap");

    assert_eq!(held.since, second_commit.version);

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_enforces_write_isolation_across_spaces() -> Result<()> {
    let repository = Repository::open(MemorySession::new());
    let one = Space::generate()?;
    let other = Space::generate()?;

    let transaction = repository.edit();

    transaction.writer(&one).await?;
    let isolation = transaction.writer(&other).await;
    assert!(matches!(
        isolation,
        Err(EngramReplicaError::WriteIsolation { .. })
    ));

    // Readers on both spaces succeed
    transaction.reader(&one).await?;
    transaction.reader(&other).await?;

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_reads_inline_addresses_and_refuses_to_write_them() -> Result<()> {
    let repository = Repository::open(MemorySession::new());
    let space = Space::generate()?;

    let inline = Address::new(
        MediaType::json(),
        "data:application/json,{\"x\":1}".parse()?,
        [] as [&str; 0],
    );

    let transaction = repository.edit();

    assert_eq!(
        transaction.read(&space, &inline).await?,
        Some(json!({ "x": 1 }))
    );

    let result = transaction.write(&space, &inline, Some(json!(2))).await;
    assert!(matches!(
        result,
        Err(EngramReplicaError::ReadOnlyAddress { .. })
    ));

    Ok(())
}

struct RecordingObserver {
    seen: Mutex<Vec<Value>>,
}

impl CellObserver for RecordingObserver {
    fn observe(&self, _: &FactKey, revision: &Revision) {
        if let Some(value) = revision.is() {
            self.seen.lock().expect("lock poisoned").push(value.clone());
        }
    }
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_notifies_a_fact_subscriber_once_per_merged_revision() -> Result<()> {
    let session = MemorySession::new();
    let space = Space::generate()?;
    let repository = Repository::open(session.clone());
    let replica = repository.replica(&space).await;

    let key = FactKey::new(MediaType::json(), "test:counter".parse()?);
    let observer = Arc::new(RecordingObserver {
        seen: Mutex::new(Vec::new()),
    });
    let weak: Weak<dyn CellObserver> = Arc::downgrade(&(observer.clone() as Arc<dyn CellObserver>));
    replica.subscribe(key.clone(), weak).await;

    // A local commit merges the revision into the heap once
    let transaction = repository.edit();
    transaction
        .write(&space, &address("test:counter", &[])?, Some(json!({ "value": 1 })))
        .await?;
    transaction.commit().await?;

    // An external commit arrives through polling
    let external = Repository::open(session.clone());
    let advance = external.edit();
    advance
        .write(
            &space,
            &address("test:counter", &[])?,
            Some(json!({ "value": 2 })),
        )
        .await?;
    advance.commit().await?;

    replica.poll().await?;
    // Polling again merges nothing new and must not re-notify
    replica.poll().await?;

    let seen = observer.seen.lock().expect("lock poisoned").clone();
    assert_eq!(seen, vec![json!({ "value": 1 }), json!({ "value": 2 })]);

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_recovers_subscriptions_after_a_reset() -> Result<()> {
    let session = MemorySession::new();
    let space = Space::generate()?;
    let repository = Repository::open(session.clone());

    let (sink, mut notifications) = ChannelSink::new();
    repository.subscribe(sink);

    let seed = repository.edit();
    seed.write(&space, &address("test:counter", &[])?, Some(json!({ "value": 1 })))
        .await?;
    seed.commit().await?;

    let replica = repository.replica(&space).await;

    // A schema-attached load of an unseen entity establishes a tracked
    // server subscription
    replica
        .load_with_schema(
            &[address("test:tracked", &[])?],
            Some(json!({ "type": "object" })),
        )
        .await?;

    // Reconnect recovery: poll, reset, re-subscribe
    replica.recover().await?;

    let mut reset_seen = false;
    while let Ok(notification) = notifications.try_recv() {
        if matches!(notification, Notification::Reset { .. }) {
            reset_seen = true;
        }
    }
    assert!(reset_seen);

    // A subsequent external write reaches the local store
    let external = Repository::open(session.clone());
    let advance = external.edit();
    advance
        .write(
            &space,
            &address("test:counter", &[])?,
            Some(json!({ "value": 100 })),
        )
        .await?;
    advance.commit().await?;

    replica.poll().await?;

    let key = FactKey::new(MediaType::json(), "test:counter".parse()?);
    let held = replica.get(&key).await.expect("the fact is back on the heap");
    assert_eq!(held.is(), Some(&json!({ "value": 100 })));

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_serves_loads_from_the_revision_cache() -> Result<()> {
    let backend = MemoryStorageBackend::<String, Vec<u8>>::default();
    let session = MemorySession::new();
    let space = Space::generate()?;

    // A first repository warms the cache
    {
        let repository = Repository::open(session.clone())
            .with_cache(Arc::new(RevisionCache::new(backend.clone())));

        let seed = repository.edit();
        seed.write(&space, &address("test:doc", &[])?, Some(json!({ "cached": true })))
            .await?;
        seed.commit().await?;
        repository.synced().await;
    }

    // A second repository over a *fresh* session finds the fact in the
    // cache without any server round trip
    let offline = Repository::open(MemorySession::new())
        .with_cache(Arc::new(RevisionCache::new(backend)));

    let (sink, mut notifications) = ChannelSink::new();
    offline.subscribe(sink);

    let replica = offline.replica(&space).await;
    let revisions = replica.load(&[address("test:doc", &[])?]).await?;

    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0].is(), Some(&json!({ "cached": true })));

    let mut load_seen = false;
    while let Ok(notification) = notifications.try_recv() {
        if matches!(notification, Notification::Load { .. }) {
            load_seen = true;
        }
    }
    assert!(load_seen);

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_synthesizes_placeholders_for_facts_the_server_never_saw() -> Result<()> {
    let repository = Repository::open(MemorySession::new());
    let space = Space::generate()?;
    let replica = repository.replica(&space).await;

    let revisions = replica.load(&[address("test:unknown", &[])?]).await?;

    assert_eq!(revisions.len(), 1);
    assert!(revisions[0].is_placeholder());
    assert!(revisions[0].is().is_none());

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_expands_the_subscription_graph_over_links() -> Result<()> {
    let session = MemorySession::new();
    let space = Space::generate()?;

    // Another client has already stored a document graph: the root links to
    // the leaf with the `{"/": id}` reference shape
    let external = Repository::open(session.clone());

    let seed_leaf = external.edit();
    seed_leaf
        .write(&space, &address("test:leaf", &[])?, Some(json!({ "done": true })))
        .await?;
    seed_leaf.commit().await?;

    let seed_root = external.edit();
    seed_root
        .write(
            &space,
            &address("test:root", &[])?,
            Some(json!({ "next": { "/": "test:leaf" } })),
        )
        .await?;
    seed_root.commit().await?;

    // A schema-attached load of the root discovers and subscribes the leaf
    let repository = Repository::open(session.clone());
    let replica = repository.replica(&space).await;

    replica
        .load_with_schema(
            &[address("test:root", &[])?],
            Some(json!({ "type": "object" })),
        )
        .await?;

    repository.synced().await;

    let leaf = replica
        .get(&FactKey::new(MediaType::json(), "test:leaf".parse()?))
        .await
        .expect("the linked document was pulled in");

    assert_eq!(leaf.is(), Some(&json!({ "done": true })));

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
async fn it_retracts_and_reasserts_through_the_causal_chain() -> Result<()> {
    let repository = Repository::open(MemorySession::new());
    let space = Space::generate()?;

    let assert = repository.edit();
    assert
        .write(&space, &address("test:doc", &[])?, Some(json!({ "alive": true })))
        .await?;
    assert.commit().await?;

    let retract = repository.edit();
    retract.write(&space, &address("test:doc", &[])?, None).await?;
    let retraction = retract.commit().await?.expect("the retraction pushes");
    assert!(retraction.facts[0].fact.is().is_none());

    // Reading the retracted fact observes absence
    let read = repository.edit();
    assert_eq!(read.read(&space, &address("test:doc", &[])?).await?, None);

    // A new assertion builds on the retraction, not on nothing
    let reassert = repository.edit();
    reassert
        .write(&space, &address("test:doc", &[])?, Some(json!({ "alive": false })))
        .await?;
    let reassertion = reassert.commit().await?.expect("the reassertion pushes");

    assert_eq!(
        reassertion.facts[0].fact.cause(),
        Some(&retraction.facts[0].reference)
    );

    Ok(())
}
