//! Commits: the unit of change a space's remote acknowledges.

use serde::{Deserialize, Serialize};

use crate::{Assertion, EngramFactsError, Fact, MediaType, Reference, Space};

/// A [`StoredFact`] pairs a fact with its content-addressed [`Reference`],
/// as recorded inside a [`Commit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFact {
    /// The committed [`Fact`]
    pub fact: Fact,
    /// The [`Reference`] of the committed fact
    pub reference: Reference,
}

impl TryFrom<Fact> for StoredFact {
    type Error = EngramFactsError;

    fn try_from(fact: Fact) -> Result<Self, Self::Error> {
        let reference = fact.reference()?.ok_or_else(|| {
            EngramFactsError::InvalidReference(
                "An unclaimed fact cannot be stored in a commit".into(),
            )
        })?;

        Ok(StoredFact { fact, reference })
    }
}

/// A [`Commit`] is the server-acknowledged application of a batch of facts
/// to a space, stamped with the space's next monotonic version. Commits form
/// their own causal chain through `parent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// The monotonic version the remote assigned to this commit
    pub version: i64,
    /// The facts applied by this commit, paired with their references
    pub facts: Vec<StoredFact>,
    /// The [`Reference`] of the previous commit fact, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Reference>,
}

impl Commit {
    /// Render this [`Commit`] as the [`Assertion`] under which it is stored:
    /// the commit entity is the space itself, under the commit media type, so
    /// that the commit log head can be read and subscribed to like any other
    /// fact.
    pub fn to_fact(&self, space: &Space) -> Result<Assertion, EngramFactsError> {
        Ok(Assertion {
            the: MediaType::commit(),
            of: space.entity()?,
            is: serde_json::to_value(self)
                .map_err(|error| EngramFactsError::Canonical(format!("{error}")))?,
            cause: self.parent,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::{Assertion, Commit, Fact, MediaType, Space, StoredFact};

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_stores_the_commit_under_the_space_entity() -> Result<()> {
        let space = Space::generate()?;
        let assertion = Assertion {
            the: MediaType::json(),
            of: "test:subject".parse()?,
            is: json!(1),
            cause: None,
        };

        let commit = Commit {
            version: 1,
            facts: vec![StoredFact::try_from(Fact::from(assertion))?],
            parent: None,
        };

        let fact = commit.to_fact(&space)?;

        assert_eq!(fact.the, MediaType::commit());
        assert_eq!(fact.of.as_str(), space.as_str());
        assert_eq!(fact.is, serde_json::to_value(&commit)?);

        Ok(())
    }
}
