//! Memory addresses and attestations.
//!
//! An [`Address`] names a subtree of a fact: the `(entity, media type)` pair
//! plus a JSON [`Path`] into its value. An [`Attestation`] is the claim that
//! the subtree rooted at an address equals some value; attestations are the
//! unit of bookkeeping in transaction journals.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Entity, MediaType, Path, Resolution, resolve};

/// A [`FactKey`] is the `(entity, media type)` pair that a fact is stored
/// under. It is the key type of every fact container in the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactKey {
    /// The [`MediaType`] component of the key
    pub the: MediaType,
    /// The [`Entity`] component of the key
    pub of: Entity,
}

impl FactKey {
    /// Create a new [`FactKey`]
    pub fn new(the: MediaType, of: Entity) -> Self {
        Self { the, of }
    }

    /// The [`Address`] of this key's whole value
    pub fn address(&self) -> Address {
        Address {
            the: self.the.clone(),
            of: self.of.clone(),
            path: Path::root(),
        }
    }
}

impl Display for FactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.of, self.the)
    }
}

/// An [`Address`] names a subtree of a fact's value. An empty path addresses
/// the whole value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    /// The [`MediaType`] component of the address
    pub the: MediaType,
    /// The [`Entity`] component of the address
    pub of: Entity,
    /// The [`Path`] into the fact's value
    #[serde(default)]
    pub path: Path,
}

impl Address {
    /// Create a new [`Address`]
    pub fn new<P>(the: MediaType, of: Entity, path: P) -> Self
    where
        P: Into<Path>,
    {
        Self {
            the,
            of,
            path: path.into(),
        }
    }

    /// The `(entity, media type)` pair of this [`Address`]
    pub fn key(&self) -> FactKey {
        FactKey {
            the: self.the.clone(),
            of: self.of.clone(),
        }
    }

    /// Whether this [`Address`] subsumes `other`: same `(entity, media
    /// type)`, and this path is a prefix of the other's.
    pub fn includes(&self, other: &Address) -> bool {
        self.the == other.the && self.of == other.of && self.path.includes(&other.path)
    }

    /// Whether the two addresses overlap (either includes the other)
    pub fn intersects(&self, other: &Address) -> bool {
        self.includes(other) || other.includes(self)
    }

    /// Whether this [`Address`] names an inline `data:` entity
    pub fn is_inline(&self) -> bool {
        self.of.is_inline()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] {}", self.of, self.the, self.path)
    }
}

impl From<FactKey> for Address {
    fn from(value: FactKey) -> Self {
        Address {
            the: value.the,
            of: value.of,
            path: Path::root(),
        }
    }
}

/// An [`Attestation`] claims that the subtree of a fact rooted at an address
/// equals a value (`None` claims that the subtree is absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    /// The [`Address`] the claim is rooted at
    pub address: Address,
    /// The claimed value; `None` claims absence
    pub is: Option<Value>,
}

impl Attestation {
    /// Create a new [`Attestation`]
    pub fn new(address: Address, is: Option<Value>) -> Self {
        Self { address, is }
    }

    /// Whether this [`Attestation`] subsumes the given address
    pub fn includes(&self, address: &Address) -> bool {
        self.address.includes(address)
    }

    /// Resolve the value this [`Attestation`] implies at a descendant
    /// address. Returns `None` when the address is not subsumed. An absent
    /// root implies absence at every descendant.
    pub fn resolve(&self, address: &Address) -> Option<Resolution<'_>> {
        let relative = address.path.strip_prefix(&self.address.path)?;

        if self.address.the != address.the || self.address.of != address.of {
            return None;
        }

        Some(match &self.is {
            Some(value) => resolve(value, &relative),
            None => Resolution::Absent,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::{Address, Attestation, MediaType, Resolution};

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_subsumes_descendant_addresses() -> Result<()> {
        let parent = Address::new(MediaType::json(), "test:subject".parse()?, ["a"]);
        let descendant = Address::new(MediaType::json(), "test:subject".parse()?, ["a", "b"]);
        let other = Address::new(MediaType::json(), "test:other".parse()?, ["a", "b"]);

        assert!(parent.includes(&descendant));
        assert!(!descendant.includes(&parent));
        assert!(parent.intersects(&descendant));
        assert!(!parent.includes(&other));

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_resolves_descendants_of_an_attested_value() -> Result<()> {
        let attestation = Attestation::new(
            Address::new(MediaType::json(), "test:subject".parse()?, ["a"]),
            Some(json!({ "b": 1 })),
        );

        let descendant = Address::new(MediaType::json(), "test:subject".parse()?, ["a", "b"]);

        assert_eq!(
            attestation.resolve(&descendant),
            Some(Resolution::Resolved(&json!(1)))
        );

        Ok(())
    }
}
