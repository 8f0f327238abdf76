//! The transaction journal.
//!
//! A [`Chronicle`] is the per-transaction, per-space read/write log. Reads
//! are recorded in *history* as [`Attestation`]s ("at this path we observed
//! this value"); writes are folded into *novelty*, one merged root per
//! `(entity, media type)` so that each write costs the depth of its path
//! rather than the number of prior writes. At commit the journal compiles
//! down to an [`Edit`]: concrete facts with resolved causal chains, plus the
//! claims that let the remote validate every read invariant.

use async_trait::async_trait;
use engram_common::ConditionalSync;
use indexmap::IndexMap;
use serde_json::Value;

use engram_facts::{
    Address, Attestation, Claim, Edit, FactKey, Path, PatchFailure, Resolution, Retraction,
    Revision, decode_inline, patch_at, resolve,
};

use crate::EngramReplicaError;

/// Where a [`Chronicle`] loads facts from: the owning replica (nursery, then
/// heap, then remote pull, then a synthesized unclaimed fact).
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait FactSource: ConditionalSync {
    /// Produce the latest known [`Revision`] for a key, pulling from the
    /// remote when the local store has never observed the fact
    async fn load_fact(&self, key: &FactKey) -> Result<Revision, EngramReplicaError>;
}

/// The accumulated writes against one `(entity, media type)` pair: a single
/// merged root attestation plus the set of explicitly written sub-paths.
#[derive(Debug, Clone)]
struct Changes {
    /// The whole-fact value with every write applied (`None` marks the fact
    /// for retraction)
    root: Attestation,
    /// The paths that were explicitly written, in write order
    written: Vec<Path>,
}

impl Changes {
    /// Whether some written path subsumes the given one (a read at or below
    /// a written path resolves purely from novelty)
    fn covers(&self, path: &Path) -> bool {
        self.written.iter().any(|written| written.includes(path))
    }

    /// The value a written region holds in the merged root
    fn written_value(&self, path: &Path) -> Option<Value> {
        match &self.root.is {
            Some(root) => match resolve(root, path) {
                Resolution::Resolved(value) => Some(value.clone()),
                _ => None,
            },
            None => None,
        }
    }

    /// Replay the written regions of this novelty on top of a value read
    /// from elsewhere (history or the store)
    fn rebase(&self, address: &Address, base: Option<Value>) -> Option<Value> {
        let mut value = base;

        for written in &self.written {
            if let Some(relative) = written.strip_prefix(&address.path) {
                let patch = self.written_value(written);

                if relative.is_root() {
                    value = patch;
                } else if let Ok(patched) = patch_at(value.as_ref(), &relative, patch) {
                    value = patched;
                }
            }
        }

        value
    }

    /// Replay the written regions onto the currently stored value, producing
    /// the value this novelty commits. A still-absent fact has not drifted
    /// from the base these writes were applied over, so the merged root is
    /// already the value to commit.
    fn rebase_onto(&self, current: Option<&Value>) -> Result<Option<Value>, PatchFailure> {
        let Some(current) = current else {
            return Ok(self.root.is.clone());
        };

        let mut merged = Some(current.clone());

        for written in &self.written {
            if written.is_root() {
                merged = self.root.is.clone();
                continue;
            }

            merged = patch_at(merged.as_ref(), written, self.written_value(written))?;
        }

        Ok(merged)
    }
}

/// The per-transaction journal for one space. See the module documentation
/// for the shape of its bookkeeping.
#[derive(Debug, Default)]
pub struct Chronicle {
    history: IndexMap<Address, Attestation>,
    novelty: IndexMap<FactKey, Changes>,
}

impl Chronicle {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the journal has recorded any writes
    pub fn has_novelty(&self) -> bool {
        !self.novelty.is_empty()
    }

    /// The merged novelty value per written key (used to describe reverts)
    pub fn novelty_values(&self) -> impl Iterator<Item = (&FactKey, Option<&Value>)> {
        self.novelty
            .iter()
            .map(|(key, changes)| (key, changes.root.is.as_ref()))
    }

    /// Read the value at an address.
    ///
    /// Inline addresses decode out of their own identifier. Otherwise the
    /// read resolves novelty first, then subsuming history, then the fact
    /// source; values read from history or the source are rebased through
    /// novelty so a transaction always observes its own writes.
    pub async fn read<S>(
        &mut self,
        source: &S,
        address: &Address,
    ) -> Result<Option<Value>, EngramReplicaError>
    where
        S: FactSource,
    {
        if address.is_inline() {
            let value = decode_inline(&address.of, &address.the)?;
            return match resolve(&value, &address.path) {
                Resolution::Resolved(value) => Ok(Some(value.clone())),
                Resolution::Absent => Ok(None),
                Resolution::Missing(at) => Err(not_found(address, at)),
                Resolution::Mismatch(at) => Err(type_mismatch(address, at)),
            };
        }

        let key = address.key();

        // A read at or below a written path resolves purely from novelty
        if let Some(changes) = self.novelty.get(&key) {
            if changes.covers(&address.path) {
                return match &changes.root.is {
                    Some(root) => match resolve(root, &address.path) {
                        Resolution::Resolved(value) => Ok(Some(value.clone())),
                        Resolution::Absent => Ok(None),
                        Resolution::Missing(at) => Err(not_found(address, at)),
                        Resolution::Mismatch(at) => Err(type_mismatch(address, at)),
                    },
                    None => Ok(None),
                };
            }
        }

        // A subsuming history entry answers without another source read
        let subsumed = self.history.values().find_map(|entry| {
            entry
                .includes(address)
                .then(|| entry.resolve(address))
                .flatten()
                .map(|resolution| match resolution {
                    Resolution::Resolved(value) => Ok(Some(value.clone())),
                    Resolution::Absent => Ok(None),
                    Resolution::Missing(at) => Err(not_found(address, at)),
                    Resolution::Mismatch(at) => Err(type_mismatch(address, at)),
                })
        });

        if let Some(base) = subsumed {
            let base = base?;
            return Ok(self.rebase_through_novelty(address, base));
        }

        let fact = source.load_fact(&key).await?;

        let observed = match fact.is() {
            None => {
                if address.path.is_root() {
                    None
                } else {
                    // The whole fact is absent; register the root as read so
                    // a concurrent writer that asserts the fact cannot slip
                    // past this transaction unnoticed
                    self.claim(Address::from(key.clone()), None)?;
                    return Err(not_found(address, address.path.truncate(1)));
                }
            }
            Some(base) => match resolve(base, &address.path) {
                Resolution::Resolved(value) => Some(value.clone()),
                Resolution::Absent => None,
                Resolution::Missing(at) => {
                    self.claim_parent(address, base, &at)?;
                    return Err(not_found(address, at));
                }
                Resolution::Mismatch(at) => {
                    self.claim_parent(address, base, &at)?;
                    return Err(type_mismatch(address, at));
                }
            },
        };

        self.claim(address.clone(), observed.clone())?;

        Ok(self.rebase_through_novelty(address, observed))
    }

    /// Write a value at an address (`None` deletes the key at a leaf, and at
    /// the root marks the whole fact for retraction).
    pub async fn write<S>(
        &mut self,
        source: &S,
        address: &Address,
        value: Option<Value>,
    ) -> Result<(), EngramReplicaError>
    where
        S: FactSource,
    {
        if address.is_inline() {
            return Err(EngramReplicaError::ReadOnlyAddress {
                address: address.clone(),
            });
        }

        let key = address.key();

        if !self.novelty.contains_key(&key) {
            let fact = source.load_fact(&key).await?;

            // A fact that has never been asserted vivifies as an empty
            // document, so the first write may address a top-level key
            let base = match fact.is().cloned() {
                Some(base) => Some(base),
                None if !address.path.is_root() => Some(Value::Object(Default::default())),
                None => None,
            };

            self.novelty.insert(
                key.clone(),
                Changes {
                    root: Attestation::new(Address::from(key.clone()), base),
                    written: Vec::new(),
                },
            );
        }

        let changes = self
            .novelty
            .get_mut(&key)
            .expect("novelty entry was just ensured");

        match patch_at(changes.root.is.as_ref(), &address.path, value) {
            Ok(merged) => {
                changes.root.is = merged;
            }
            Err(PatchFailure::Missing(at)) => return Err(not_found(address, at)),
            Err(PatchFailure::Mismatch(at)) => return Err(type_mismatch(address, at)),
        }

        if !changes.written.contains(&address.path) {
            changes.written.push(address.path.clone());
        }

        Ok(())
    }

    /// Compile the journal down to its commit descriptor. Every history
    /// entry is revalidated against the current store and becomes a claim;
    /// every novelty root is rebased onto the current fact and becomes an
    /// assertion, a retraction, or (for no-op writes) a claim.
    pub async fn commit<S>(&self, source: &S) -> Result<Edit, EngramReplicaError>
    where
        S: FactSource,
    {
        let mut edit = Edit::default();
        let mut claimed: Vec<FactKey> = Vec::new();

        for (address, attestation) in &self.history {
            let key = address.key();
            let fact = source.load_fact(&key).await?;

            let current = match fact.is() {
                Some(base) => match resolve(base, &address.path) {
                    Resolution::Resolved(value) => Some(value),
                    Resolution::Absent => None,
                    Resolution::Missing(_) | Resolution::Mismatch(_) => {
                        return Err(EngramReplicaError::Inconsistent(format!(
                            "The container read at {address} no longer resolves"
                        )));
                    }
                },
                None => None,
            };

            if current != attestation.is.as_ref() {
                return Err(EngramReplicaError::Inconsistent(format!(
                    "The value read at {address} has changed"
                )));
            }

            if !claimed.contains(&key) && !self.novelty.contains_key(&key) {
                edit.claims.push(Claim {
                    the: key.the.clone(),
                    of: key.of.clone(),
                    fact: fact.fact.reference()?,
                });
                claimed.push(key);
            }
        }

        for (key, changes) in &self.novelty {
            let fact = source.load_fact(key).await?;
            let current = fact.is();

            let merged = changes.rebase_onto(current).map_err(|failure| {
                let at = match failure {
                    PatchFailure::Missing(at) | PatchFailure::Mismatch(at) => at,
                };
                EngramReplicaError::Inconsistent(format!(
                    "The container written at {} {at} no longer resolves",
                    key
                ))
            })?;

            match (merged, current) {
                (None, Some(_)) => {
                    let cause = fact.fact.reference()?.ok_or_else(|| {
                        EngramReplicaError::Inconsistent(format!(
                            "The fact retracted at {key} has no stored predecessor"
                        ))
                    })?;

                    edit.facts.push(
                        Retraction {
                            the: key.the.clone(),
                            of: key.of.clone(),
                            cause,
                        }
                        .into(),
                    );
                }
                (None, None) => {
                    // Retracting an absent fact is a no-op, but the read
                    // invariant still travels with the commit
                    edit.claims.push(Claim {
                        the: key.the.clone(),
                        of: key.of.clone(),
                        fact: None,
                    });
                }
                (Some(merged), Some(current)) if merged == *current => {
                    // No-op write: the server still validates that the
                    // value this transaction saw is the value it kept
                    edit.claims.push(Claim {
                        the: key.the.clone(),
                        of: key.of.clone(),
                        fact: fact.fact.reference()?,
                    });
                }
                (Some(merged), _) => {
                    edit.facts.push(fact.fact.clone().update(merged)?.into());
                }
            }
        }

        Ok(edit)
    }

    fn rebase_through_novelty(&self, address: &Address, base: Option<Value>) -> Option<Value> {
        match self.novelty.get(&address.key()) {
            Some(changes) => changes.rebase(address, base),
            None => base,
        }
    }

    /// Register an observation in history, consistency-checking it against
    /// every intersecting prior entry at the longer of the two paths.
    fn claim(&mut self, address: Address, is: Option<Value>) -> Result<(), EngramReplicaError> {
        for entry in self.history.values() {
            if entry.includes(&address) {
                let expected = match entry.resolve(&address) {
                    Some(Resolution::Resolved(value)) => Some(value),
                    Some(Resolution::Absent) | None => None,
                    Some(Resolution::Missing(_)) | Some(Resolution::Mismatch(_)) => {
                        return Err(EngramReplicaError::Inconsistent(format!(
                            "Read at {address} does not fit the value previously read at {}",
                            entry.address
                        )));
                    }
                };

                if expected != is.as_ref() {
                    return Err(EngramReplicaError::Inconsistent(format!(
                        "Read at {address} contradicts the value previously read at {}",
                        entry.address
                    )));
                }
            } else if address.includes(&entry.address) {
                let relative = entry
                    .address
                    .path
                    .strip_prefix(&address.path)
                    .unwrap_or_default();

                let actual = match &is {
                    Some(value) => match resolve(value, &relative) {
                        Resolution::Resolved(value) => Some(value),
                        _ => None,
                    },
                    None => None,
                };

                if actual != entry.is.as_ref() {
                    return Err(EngramReplicaError::Inconsistent(format!(
                        "Read at {address} contradicts the value previously read at {}",
                        entry.address
                    )));
                }
            }
        }

        self.history.insert(address.clone(), Attestation::new(address, is));

        Ok(())
    }

    /// Register the longest resolvable parent of a failed read, so that the
    /// transaction cannot silently succeed under a concurrent writer that
    /// supplies the missing branch.
    fn claim_parent(
        &mut self,
        address: &Address,
        base: &Value,
        failed_at: &Path,
    ) -> Result<(), EngramReplicaError> {
        let parent_path = failed_at.truncate(failed_at.len().saturating_sub(1));
        let parent = Address::new(address.the.clone(), address.of.clone(), parent_path.clone());

        let observed = match resolve(base, &parent_path) {
            Resolution::Resolved(value) => Some(value.clone()),
            _ => None,
        };

        self.claim(parent, observed)
    }
}

fn not_found(address: &Address, at: Path) -> EngramReplicaError {
    EngramReplicaError::NotFound {
        address: Address::new(address.the.clone(), address.of.clone(), at),
    }
}

fn type_mismatch(address: &Address, at: Path) -> EngramReplicaError {
    EngramReplicaError::TypeMismatch {
        address: Address::new(address.the.clone(), address.of.clone(), at),
    }
}
