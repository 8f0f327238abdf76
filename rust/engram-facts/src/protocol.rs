//! The wire protocol spoken between a replica and its remote.
//!
//! Every client-originated message is a signed [`Envelope`] around one of
//! four command abilities: `/memory/transact`, `/memory/query`,
//! `/memory/query/subscribe` and `/memory/query/unsubscribe`. The remote
//! answers commands with [`Receipt`]s and pushes subscription updates as
//! [`Effect`] frames.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Assertion, Claim, Commit, Edit, Entity, EngramFactsError, Fact, MediaType, Operation,
    Reference, Retraction, Revision, Space, to_canonical_bytes,
};

pub use crate::QuerySelector;

/// A server-assigned identifier for a live subscription
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}

/// The server's stored record for one fact: its value (absent for
/// retractions), its causal predecessor, its content hash, and the commit
/// version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    /// The stored value, when the fact is an assertion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is: Option<Value>,
    /// The [`Reference`] of the predecessor fact, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Reference>,
    /// The content hash of the stored fact
    pub reference: Reference,
    /// The commit version that produced the stored fact
    pub version: i64,
}

impl FactRecord {
    /// Reconstruct the [`Revision`] this record describes for the given
    /// `(entity, media type)` pair
    pub fn to_revision(&self, the: MediaType, of: Entity) -> Result<Revision, EngramFactsError> {
        let fact = match (&self.is, self.cause) {
            (Some(is), cause) => Fact::Assertion(Assertion {
                the,
                of,
                is: is.clone(),
                cause,
            }),
            (None, Some(cause)) => Fact::Retraction(Retraction { the, of, cause }),
            (None, None) => {
                return Err(EngramFactsError::InvalidReference(format!(
                    "Stored record {} has neither value nor cause",
                    self.reference
                )));
            }
        };

        Ok(Revision::new(fact, self.version))
    }
}

/// The result set of a query or subscription snapshot: for each selected
/// entity and media type, the server's stored record. Entities the server
/// knows nothing about are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct FactSet(pub BTreeMap<Entity, BTreeMap<MediaType, FactRecord>>);

impl FactSet {
    /// Insert a record for the given `(entity, media type)` pair
    pub fn insert(&mut self, of: Entity, the: MediaType, record: FactRecord) {
        self.0.entry(of).or_default().insert(the, record);
    }

    /// Look up the record for the given `(entity, media type)` pair
    pub fn get(&self, of: &Entity, the: &MediaType) -> Option<&FactRecord> {
        self.0.get(of).and_then(|records| records.get(the))
    }

    /// Iterate over every `(entity, media type, record)` triple
    pub fn iter(&self) -> impl Iterator<Item = (&Entity, &MediaType, &FactRecord)> {
        self.0.iter().flat_map(|(of, records)| {
            records.iter().map(move |(the, record)| (of, the, record))
        })
    }

    /// Whether the set contains no records
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The read invariants attached to a transact command. `confirmed` claims
/// have already been acknowledged by some earlier commit; `pending` claims
/// reference facts whose confirmation is still in flight on this client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reads {
    /// Claims over facts the client holds confirmed revisions of
    pub confirmed: Vec<Claim>,
    /// Claims over facts the client has pushed but not yet seen acknowledged
    pub pending: Vec<Claim>,
}

/// The `/memory/transact` command body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transact {
    /// The read invariants guarding this transaction
    pub reads: Reads,
    /// The operations to apply
    pub operations: Vec<Operation>,
}

impl TryFrom<Edit> for Transact {
    type Error = EngramFactsError;

    fn try_from(edit: Edit) -> Result<Self, Self::Error> {
        let mut operations = Vec::with_capacity(edit.facts.len() + edit.claims.len());

        for fact in edit.facts {
            operations.push(match fact {
                Fact::Assertion(assertion) => Operation::Assert(assertion),
                Fact::Retraction(retraction) => Operation::Retract(retraction),
                Fact::Unclaimed(unclaimed) => {
                    return Err(EngramFactsError::InvalidReference(format!(
                        "An unclaimed fact over {} cannot be transacted",
                        unclaimed.of
                    )));
                }
            });
        }

        for claim in &edit.claims {
            operations.push(Operation::Claim(claim.clone()));
        }

        Ok(Transact {
            reads: Reads {
                confirmed: edit.claims,
                pending: Vec::new(),
            },
            operations,
        })
    }
}

/// The `/memory/query` command body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// What to select
    pub select: QuerySelector,
    /// Only report facts at or above this commit version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

/// The `/memory/query/subscribe` command body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    /// What to select, initially and on every later commit
    pub select: QuerySelector,
    /// Only report facts at or above this commit version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    /// A client-chosen marker echoed back with the subscription
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// The `/memory/query/unsubscribe` command body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unsubscribe {
    /// The subscription to retire
    pub source: SubscriptionId,
}

/// One of the four command abilities, tagged on the wire by its ability path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Submit a batch of operations
    #[serde(rename = "/memory/transact")]
    Transact(Transact),
    /// One-shot query
    #[serde(rename = "/memory/query")]
    Query(Query),
    /// Query plus live updates
    #[serde(rename = "/memory/query/subscribe")]
    Subscribe(Subscribe),
    /// Retire a live subscription
    #[serde(rename = "/memory/query/unsubscribe")]
    Unsubscribe(Unsubscribe),
}

impl Command {
    /// The ability path this command invokes
    pub fn ability(&self) -> &'static str {
        match self {
            Command::Transact(_) => "/memory/transact",
            Command::Query(_) => "/memory/query",
            Command::Subscribe(_) => "/memory/query/subscribe",
            Command::Unsubscribe(_) => "/memory/query/unsubscribe",
        }
    }
}

/// A signed command envelope. The signature covers the canonical form of
/// every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The client-assigned command identifier, echoed in the receipt
    pub id: u64,
    /// The space the command addresses
    pub space: Space,
    /// The DID of the signing principal
    pub issuer: String,
    /// The command itself
    pub command: Command,
    /// The base58 ed25519 signature over the unsigned payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    /// The canonical byte form the signature is computed over (the envelope
    /// with its signature field stripped)
    pub fn unsigned_payload(&self) -> Result<Vec<u8>, EngramFactsError> {
        let unsigned = Envelope {
            signature: None,
            ..self.clone()
        };

        to_canonical_bytes(&unsigned)
    }
}

/// One rejected read invariant or causal mismatch inside a conflict receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// The media type of the conflicted fact
    pub the: MediaType,
    /// The entity of the conflicted fact
    pub of: Entity,
    /// The reference the client expected the stored fact to have
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Reference>,
    /// The record the server actually holds (absent if the server holds
    /// nothing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<FactRecord>,
}

/// The error half of a [`Receipt`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReceiptError {
    /// The commit lost a race: some read invariant or causal chain no longer
    /// holds
    Conflict {
        /// The invariants that failed, with the server's actual records
        conflicts: Vec<Conflict>,
    },
    /// The issuer is not authorized for the invoked ability
    Authorization {
        /// Human-readable detail
        message: String,
    },
    /// The transact command was malformed or unapplicable
    Transaction {
        /// Human-readable detail
        message: String,
    },
    /// The query command was malformed or unapplicable
    Query {
        /// Human-readable detail
        message: String,
    },
}

/// The success half of a [`Receipt`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptOk {
    /// A transact command was applied
    Commit {
        /// The commit the remote produced
        commit: Commit,
    },
    /// A query command resolved
    Facts {
        /// The selected records
        facts: FactSet,
    },
    /// A subscribe command was installed
    Subscribed {
        /// The initial snapshot
        facts: FactSet,
        /// The id under which updates will arrive
        source: SubscriptionId,
    },
    /// An unsubscribe command was applied
    Unsubscribed,
}

/// The outcome carried by a [`Receipt`], tagged `ok` or `error` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The command succeeded
    Ok(ReceiptOk),
    /// The command failed
    Error(ReceiptError),
}

/// The server's answer to one [`Envelope`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// The id of the envelope being answered
    pub of: u64,
    /// What happened
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Receipt {
    /// Split this [`Receipt`] into a [`Result`]
    pub fn into_result(self) -> Result<ReceiptOk, ReceiptError> {
        match self.outcome {
            Outcome::Ok(ok) => Ok(ok),
            Outcome::Error(error) => Err(error),
        }
    }
}

/// One revision inside an [`Effect`] frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    /// The media type of the revised fact
    pub the: MediaType,
    /// The entity of the revised fact
    pub of: Entity,
    /// The server's stored record for the revised fact
    #[serde(flatten)]
    pub record: FactRecord,
}

impl RevisionRecord {
    /// Reconstruct the [`Revision`] this record describes
    pub fn to_revision(&self) -> Result<Revision, EngramFactsError> {
        self.record.to_revision(self.the.clone(), self.of.clone())
    }
}

/// A server-pushed subscription update: the commit that advanced the space
/// and the revisions visible to the subscription's selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    /// The subscription this update belongs to
    pub source: SubscriptionId,
    /// The commit that advanced the space
    pub commit: Commit,
    /// The revisions visible to the subscription
    pub revisions: Vec<RevisionRecord>,
}

/// Every frame a server can push over a live connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    /// An answer to a command
    Receipt(Receipt),
    /// A subscription update
    Effect(Effect),
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{
        Command, Envelope, FactRecord, FactSet, Frame, Outcome, Query, Receipt, ReceiptOk,
        SubscriptionId,
    };
    use crate::{FactSelector, MediaType, QuerySelector, Reference, Space};

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    fn envelope() -> Result<Envelope> {
        Ok(Envelope {
            id: 7,
            space: Space::generate()?,
            issuer: "did:key:z6MkExample".into(),
            command: Command::Query(Query {
                select: QuerySelector::from(FactSelector::new().the(MediaType::json())),
                since: None,
            }),
            signature: None,
        })
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_tags_commands_with_their_ability_path() -> Result<()> {
        let envelope = envelope()?;
        let serialized = serde_json::to_value(&envelope)?;

        assert!(serialized["command"].get("/memory/query").is_some());
        assert_eq!(envelope.command.ability(), "/memory/query");

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_excludes_the_signature_from_the_signed_payload() -> Result<()> {
        let unsigned = envelope()?;
        let signed = Envelope {
            signature: Some("z3signature".into()),
            ..unsigned.clone()
        };

        assert_eq!(unsigned.unsigned_payload()?, signed.unsigned_payload()?);

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_round_trips_receipt_frames() -> Result<()> {
        let mut facts = FactSet::default();
        facts.insert(
            "test:counter".parse()?,
            MediaType::json(),
            FactRecord {
                is: Some(json!({ "value": 1 })),
                cause: None,
                reference: Reference::of(&json!({ "value": 1 }))?,
                version: 3,
            },
        );

        let frame = Frame::Receipt(Receipt {
            of: 7,
            outcome: Outcome::Ok(ReceiptOk::Subscribed {
                facts,
                source: SubscriptionId(1),
            }),
        });

        let serialized = serde_json::to_string(&frame)?;
        let deserialized: Frame = serde_json::from_str(&serialized)?;

        assert_eq!(frame, deserialized);

        Ok(())
    }
}
