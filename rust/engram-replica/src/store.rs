//! The fact store: keyed revision containers with per-cell observers.
//!
//! A replica owns two [`Cells`] containers. The *heap* holds committed state
//! as seen by the replica (authoritative local truth). The *nursery* shadows
//! writes that have been sent to the remote but not yet acknowledged; reads
//! resolve `nursery ?? heap ?? unclaimed`.

use std::collections::HashMap;
use std::sync::Weak;

use engram_common::ConditionalSync;
use engram_facts::{FactKey, Revision};

/// An observer of one cell of the fact store. Observers are held weakly and
/// pruned once dropped. They are invoked after the originating merge has
/// fully completed and must not mutate the store synchronously.
pub trait CellObserver: ConditionalSync {
    /// Deliver one merged revision
    fn observe(&self, key: &FactKey, revision: &Revision);
}

/// How two revisions of the same fact combine during a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// Absent side loses; otherwise the higher `since` wins
    Put,
    /// Like [`Merge::Put`], but a fact the store does not already hold is
    /// left unknown (server-driven refresh of known-present facts only)
    Update,
}

/// The outcome of merging one revision into a [`Cells`] container
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCell {
    /// The key the revision merged under
    pub key: FactKey,
    /// The revision previously held, if any
    pub before: Option<Revision>,
    /// The revision now held
    pub after: Revision,
}

/// A keyed container mapping `(entity, media type)` to the latest known
/// [`Revision`], with per-cell observer lists.
#[derive(Default)]
pub struct Cells {
    entries: HashMap<FactKey, Revision>,
    observers: HashMap<FactKey, Vec<Weak<dyn CellObserver>>>,
}

impl Cells {
    /// Look up the revision held for a key
    pub fn get(&self, key: &FactKey) -> Option<&Revision> {
        self.entries.get(key)
    }

    /// Whether the container holds a revision for the key
    pub fn contains(&self, key: &FactKey) -> bool {
        self.entries.contains_key(key)
    }

    /// The number of revisions held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the container holds no revisions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge one revision into the container under the given [`Merge`]
    /// predicate. Returns the outcome when the held revision changed,
    /// `None` when the local side won.
    pub fn merge(&mut self, revision: Revision, merge: Merge) -> Option<MergedCell> {
        let key = revision.fact.key();
        let local = self.entries.get(&key);

        let adopt = match (local, merge) {
            (None, Merge::Put) => true,
            (None, Merge::Update) => false,
            (Some(local), _) => local.since < revision.since,
        };

        if !adopt {
            return None;
        }

        let before = self.entries.insert(key.clone(), revision.clone());

        Some(MergedCell {
            key,
            before,
            after: revision,
        })
    }

    /// Insert or replace a revision unconditionally (nursery writes)
    pub fn insert(&mut self, revision: Revision) -> Option<Revision> {
        self.entries.insert(revision.fact.key(), revision)
    }

    /// Remove the revision held for a key
    pub fn remove(&mut self, key: &FactKey) -> Option<Revision> {
        self.entries.remove(key)
    }

    /// Retire a key if the caught-up revision carries the same fact content
    /// (used to evict nursery entries once the heap reflects them)
    pub fn evict(&mut self, key: &FactKey, caught_up: &Revision) -> bool {
        let matches = self
            .entries
            .get(key)
            .and_then(|held| held.same_content(caught_up).ok())
            .unwrap_or(false);

        if matches {
            self.entries.remove(key);
        }

        matches
    }

    /// Drop every held revision, keeping observer registrations
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Install an observer for one cell
    pub fn subscribe(&mut self, key: FactKey, observer: Weak<dyn CellObserver>) {
        self.observers.entry(key).or_default().push(observer);
    }

    /// Remove a previously installed observer
    pub fn unsubscribe(&mut self, key: &FactKey, observer: &Weak<dyn CellObserver>) {
        if let Some(observers) = self.observers.get_mut(key) {
            observers.retain(|held| !Weak::ptr_eq(held, observer));

            if observers.is_empty() {
                self.observers.remove(key);
            }
        }
    }

    /// Fire the observers of one cell with a merged revision. Placeholder
    /// revisions (`since == -1`) represent absence, not a real revision, and
    /// never notify. Dropped observers are pruned as a side effect.
    pub fn notify(&mut self, key: &FactKey, revision: &Revision) {
        if revision.is_placeholder() {
            return;
        }

        let Some(observers) = self.observers.get_mut(key) else {
            return;
        };

        let live: Vec<_> = observers
            .iter()
            .filter_map(|observer| observer.upgrade())
            .collect();

        observers.retain(|observer| observer.strong_count() > 0);
        if observers.is_empty() {
            self.observers.remove(key);
        }

        for observer in live {
            observer.observe(key, revision);
        }
    }
}
