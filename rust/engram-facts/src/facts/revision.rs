//! Revisions pin facts to the commit versions that produced them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Assertion, Entity, EngramFactsError, Fact, MediaType, Reference, Retraction, Unclaimed,
    to_canonical_bytes,
};

/// The `since` value that marks a locally-synthesized placeholder for known
/// absence. Placeholders never fire subscribers.
pub const UNKNOWN_VERSION: i64 = -1;

/// A [`Revision`] wraps a [`Fact`] with the commit version at which the
/// remote observed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// The observed [`Fact`]
    pub fact: Fact,
    /// The commit version at which the remote observed the fact;
    /// [`UNKNOWN_VERSION`] for synthesized placeholders
    pub since: i64,
}

impl Revision {
    /// Create a new [`Revision`]
    pub fn new(fact: Fact, since: i64) -> Self {
        Self { fact, since }
    }

    /// Synthesize the placeholder [`Revision`] for a fact that the remote
    /// reported absent
    pub fn unclaimed(the: MediaType, of: Entity) -> Self {
        Self {
            fact: Fact::unclaimed(the, of),
            since: UNKNOWN_VERSION,
        }
    }

    /// Whether this [`Revision`] is a locally-synthesized absence placeholder
    pub fn is_placeholder(&self) -> bool {
        self.since == UNKNOWN_VERSION
    }

    /// The value of the underlying fact, if any
    pub fn is(&self) -> Option<&Value> {
        self.fact.is()
    }

    /// Whether two revisions carry the same fact content (used to retire a
    /// nursery entry once the heap has caught up with it)
    pub fn same_content(&self, other: &Revision) -> Result<bool, EngramFactsError> {
        Ok(to_canonical_bytes(&self.fact)? == to_canonical_bytes(&other.fact)?)
    }
}

/// The serialized form a [`Revision`] takes in the persisted cache. The
/// archive flattens the fact and carries the `cause` digest as a plain
/// string, so that cache rows stay greppable key/value records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionArchive {
    /// The media type of the archived fact
    pub the: MediaType,
    /// The entity of the archived fact
    pub of: Entity,
    /// The value, when the archived fact is an assertion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is: Option<Value>,
    /// The cause digest in base32, when the archived fact has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// The commit version of the archived revision
    pub since: i64,
}

impl From<&Revision> for RevisionArchive {
    fn from(revision: &Revision) -> Self {
        RevisionArchive {
            the: revision.fact.the().clone(),
            of: revision.fact.of().clone(),
            is: revision.fact.is().cloned(),
            cause: revision.fact.cause().map(|cause| cause.encode()),
            since: revision.since,
        }
    }
}

impl TryFrom<RevisionArchive> for Revision {
    type Error = EngramFactsError;

    fn try_from(archive: RevisionArchive) -> Result<Self, Self::Error> {
        let cause = archive
            .cause
            .as_deref()
            .map(Reference::decode)
            .transpose()?;

        let fact = match (archive.is, cause) {
            (Some(is), cause) => Fact::Assertion(Assertion {
                the: archive.the,
                of: archive.of,
                is,
                cause,
            }),
            (None, Some(cause)) => Fact::Retraction(Retraction {
                the: archive.the,
                of: archive.of,
                cause,
            }),
            (None, None) => Fact::Unclaimed(Unclaimed {
                the: archive.the,
                of: archive.of,
            }),
        };

        Ok(Revision {
            fact,
            since: archive.since,
        })
    }
}
