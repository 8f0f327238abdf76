//! The fact lifecycle.
//!
//! A fact over an `(entity, media type)` pair is exactly one of three
//! things: an [`Assertion`] carrying a JSON value, a [`Retraction`] that
//! removes the value while keeping the causal chain alive, or [`Unclaimed`]
//! (never yet observed, treated as absent). Assertions and retractions both
//! carry a [`Reference`] to the prior state they build upon.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Entity, EngramFactsError, FactKey, MediaType, Reference};

/// An [`Assertion`] establishes the value of a fact. The `cause` is the
/// [`Reference`] of the prior assertion or retraction it supersedes; only the
/// very first assertion over an `(entity, media type)` pair has no cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    /// The [`MediaType`] tagging the payload format
    pub the: MediaType,
    /// The [`Entity`] the fact is about
    pub of: Entity,
    /// The asserted JSON value
    pub is: Value,
    /// The [`Reference`] of the predecessor fact, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Reference>,
}

impl Assertion {
    /// The content-addressed [`Reference`] of this [`Assertion`]
    pub fn reference(&self) -> Result<Reference, EngramFactsError> {
        Reference::of(self)
    }

    /// Produce the [`Assertion`] that supersedes this one with a new value
    pub fn update(self, value: Value) -> Result<Self, EngramFactsError> {
        let cause = Some(self.reference()?);
        Ok(Self {
            is: value,
            cause,
            ..self
        })
    }

    /// Produce the [`Retraction`] that supersedes this [`Assertion`]
    pub fn retract(self) -> Result<Retraction, EngramFactsError> {
        let cause = self.reference()?;
        Ok(Retraction {
            the: self.the,
            of: self.of,
            cause,
        })
    }
}

/// A [`Retraction`] removes the value of a fact. A retracted fact still
/// participates in the causal chain: a later assertion must cite the
/// retraction as its cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retraction {
    /// The [`MediaType`] tagging the payload format
    pub the: MediaType,
    /// The [`Entity`] the fact is about
    pub of: Entity,
    /// The [`Reference`] of the predecessor fact
    pub cause: Reference,
}

impl Retraction {
    /// The content-addressed [`Reference`] of this [`Retraction`]
    pub fn reference(&self) -> Result<Reference, EngramFactsError> {
        Reference::of(self)
    }
}

/// An [`Unclaimed`] fact has never been asserted. It is synthesized locally
/// to represent known absence and never leaves the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unclaimed {
    /// The [`MediaType`] tagging the payload format
    pub the: MediaType,
    /// The [`Entity`] the fact is about
    pub of: Entity,
}

/// A [`Fact`] is the complete lifecycle of one `(entity, media type)` pair.
///
/// The wire form is untagged: an assertion is recognized by its `is` field, a
/// retraction by its `cause`, and an unclaimed fact by carrying neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fact {
    /// The fact has a value
    Assertion(Assertion),
    /// The fact's value has been removed
    Retraction(Retraction),
    /// The fact has never been observed
    Unclaimed(Unclaimed),
}

impl Fact {
    /// Synthesize the [`Fact`] representing known absence
    pub fn unclaimed(the: MediaType, of: Entity) -> Self {
        Fact::Unclaimed(Unclaimed { the, of })
    }

    /// The [`MediaType`] of this [`Fact`]
    pub fn the(&self) -> &MediaType {
        match self {
            Fact::Assertion(assertion) => &assertion.the,
            Fact::Retraction(retraction) => &retraction.the,
            Fact::Unclaimed(unclaimed) => &unclaimed.the,
        }
    }

    /// The [`Entity`] of this [`Fact`]
    pub fn of(&self) -> &Entity {
        match self {
            Fact::Assertion(assertion) => &assertion.of,
            Fact::Retraction(retraction) => &retraction.of,
            Fact::Unclaimed(unclaimed) => &unclaimed.of,
        }
    }

    /// The `(entity, media type)` pair this [`Fact`] is keyed by
    pub fn key(&self) -> FactKey {
        FactKey {
            the: self.the().clone(),
            of: self.of().clone(),
        }
    }

    /// The asserted value, if this [`Fact`] has one
    pub fn is(&self) -> Option<&Value> {
        match self {
            Fact::Assertion(assertion) => Some(&assertion.is),
            _ => None,
        }
    }

    /// The [`Reference`] of the predecessor fact, if any
    pub fn cause(&self) -> Option<&Reference> {
        match self {
            Fact::Assertion(assertion) => assertion.cause.as_ref(),
            Fact::Retraction(retraction) => Some(&retraction.cause),
            Fact::Unclaimed(_) => None,
        }
    }

    /// The content-addressed [`Reference`] of this [`Fact`]. An unclaimed
    /// fact has no content and therefore no reference.
    pub fn reference(&self) -> Result<Option<Reference>, EngramFactsError> {
        match self {
            Fact::Assertion(assertion) => assertion.reference().map(Some),
            Fact::Retraction(retraction) => retraction.reference().map(Some),
            Fact::Unclaimed(_) => Ok(None),
        }
    }

    /// Produce the [`Fact`] that supersedes this one with a new value
    pub fn update(self, value: Value) -> Result<Self, EngramFactsError> {
        let cause = self.reference()?;
        Ok(Fact::Assertion(Assertion {
            the: self.the().clone(),
            of: self.of().clone(),
            is: value,
            cause,
        }))
    }
}

impl From<Assertion> for Fact {
    fn from(value: Assertion) -> Self {
        Fact::Assertion(value)
    }
}

impl From<Retraction> for Fact {
    fn from(value: Retraction) -> Self {
        Fact::Retraction(value)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::{Assertion, Entity, Fact, MediaType};

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    fn assertion() -> Result<Assertion> {
        Ok(Assertion {
            the: MediaType::json(),
            of: "test:subject".parse::<Entity>()?,
            is: json!({ "on": false }),
            cause: None,
        })
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_points_to_causal_ancestor_when_updated() -> Result<()> {
        let assertion = assertion()?;
        let causal_reference = assertion.reference()?;
        let descendant = assertion.update(json!({ "on": true }))?;

        assert_eq!(descendant.is, json!({ "on": true }));
        assert_eq!(descendant.cause, Some(causal_reference));

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_keeps_the_causal_chain_through_retraction() -> Result<()> {
        let assertion = assertion()?;
        let causal_reference = assertion.reference()?;
        let retraction = assertion.retract()?;

        assert_eq!(retraction.cause, causal_reference);

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_discriminates_lifecycle_variants_on_the_wire() -> Result<()> {
        let assertion_fact = Fact::from(assertion()?);
        let retraction = Fact::from(assertion()?.retract()?);
        let unclaimed = Fact::unclaimed(MediaType::json(), "test:subject".parse()?);

        for fact in [&assertion_fact, &retraction, &unclaimed] {
            let serialized = serde_json::to_value(fact)?;
            let deserialized: Fact = serde_json::from_value(serialized)?;
            assert_eq!(fact, &deserialized);
        }

        Ok(())
    }
}
