//! Changes, claims, and edits.
//!
//! A [`Change`] is the user-facing description of one intended mutation. A
//! transaction journal compiles reads and writes down into an [`Edit`]: the
//! commit descriptor pairing concrete facts (with their causal chains
//! resolved) with the [`Claim`]s that let the remote validate the
//! transaction's read invariants.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Assertion, Entity, Fact, FactKey, MediaType, Reference, Retraction};

/// A [`Claim`] is a read invariant submitted with a commit: the statement
/// that, when the transaction ran, the fact stored under `(entity, media
/// type)` hashed to `fact` (`None` claims the fact was absent). The remote
/// rejects the commit if the claim no longer holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// The [`MediaType`] component of the claimed fact
    pub the: MediaType,
    /// The [`Entity`] component of the claimed fact
    pub of: Entity,
    /// The [`Reference`] of the observed fact; `None` claims absence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact: Option<Reference>,
}

impl Claim {
    /// The `(entity, media type)` pair this [`Claim`] is about
    pub fn key(&self) -> FactKey {
        FactKey {
            the: self.the.clone(),
            of: self.of.clone(),
        }
    }
}

/// A [`Change`] describes one intended mutation of a fact, before its causal
/// chain has been resolved against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Establish the value of a fact
    Assert {
        /// The [`MediaType`] of the fact to assert
        the: MediaType,
        /// The [`Entity`] of the fact to assert
        of: Entity,
        /// The value to assert
        is: Value,
    },
    /// Remove the value of a fact
    Retract {
        /// The [`MediaType`] of the fact to retract
        the: MediaType,
        /// The [`Entity`] of the fact to retract
        of: Entity,
    },
    /// Record a read invariant without mutating anything
    Claim(Claim),
}

impl Change {
    /// The `(entity, media type)` pair this [`Change`] affects
    pub fn key(&self) -> FactKey {
        match self {
            Change::Assert { the, of, .. } => FactKey::new(the.clone(), of.clone()),
            Change::Retract { the, of } => FactKey::new(the.clone(), of.clone()),
            Change::Claim(claim) => claim.key(),
        }
    }
}

/// One operation inside a transact command, as the remote sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Establish the value of a fact
    Assert(Assertion),
    /// Remove the value of a fact
    Retract(Retraction),
    /// Validate a read invariant
    Claim(Claim),
}

impl Operation {
    /// The `(entity, media type)` pair this [`Operation`] affects
    pub fn key(&self) -> FactKey {
        match self {
            Operation::Assert(assertion) => Fact::Assertion(assertion.clone()).key(),
            Operation::Retract(retraction) => Fact::Retraction(retraction.clone()).key(),
            Operation::Claim(claim) => claim.key(),
        }
    }
}

/// An [`Edit`] is the commit descriptor a transaction journal emits: the
/// facts to apply (causal chains already resolved) plus the claims that
/// guard the transaction's reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Edit {
    /// The facts to apply, in write order
    pub facts: Vec<Fact>,
    /// The read invariants to validate
    pub claims: Vec<Claim>,
}

impl Edit {
    /// Whether this [`Edit`] neither writes nor claims anything
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.claims.is_empty()
    }
}
