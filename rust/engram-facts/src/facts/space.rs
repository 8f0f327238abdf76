//! Space identifiers.
//!
//! A memory space is a logically isolated replica boundary named by a DID.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{EngramFactsError, Entity, Uri};

/// A [`Space`] names a logically isolated replica boundary. Spaces are
/// identified by a DID; the engine treats the identifier as opaque beyond
/// validating its shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[repr(transparent)]
pub struct Space(String);

impl Space {
    /// Generate a new [`Space`] named by a random ed25519 DID Key
    pub fn generate() -> Result<Self, EngramFactsError> {
        Ok(Self(Uri::unique()?.to_string()))
    }

    /// Get the [`Space`] as a string reference
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The [`Entity`] under which this space's own records (such as its
    /// commit log head) are stored
    pub fn entity(&self) -> Result<Entity, EngramFactsError> {
        self.0.parse()
    }
}

impl TryFrom<String> for Space {
    type Error = EngramFactsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !value.starts_with("did:") {
            return Err(EngramFactsError::InvalidSpace(format!(
                "A space is named by a DID, but got \"{value}\""
            )));
        }

        Ok(Self(value))
    }
}

impl FromStr for Space {
    type Err = EngramFactsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Space::try_from(s.to_owned())
    }
}

impl From<Space> for String {
    fn from(value: Space) -> Self {
        value.0
    }
}

impl Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::Space;

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_requires_a_did() -> Result<()> {
        let space = Space::generate()?;

        assert!(space.as_str().starts_with("did:key:"));
        assert!("not-a-did".parse::<Space>().is_err());
        assert_eq!(space.entity()?.as_str(), space.as_str());

        Ok(())
    }
}
