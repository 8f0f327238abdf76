//! Entity types for fact subjects.
//!
//! This module defines the [`Entity`] type which represents the subject of a
//! fact. Entities are based on URIs and provide unique identification for
//! documents in a memory space.

use std::{fmt::Display, ops::Deref, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{EngramFactsError, Uri};

/// An [`Entity`] is the subject of a fact. An [`Entity`] can be embodied by
/// any valid [`Uri`]. Entities with a `data:` scheme are *inline*: their
/// value is carried by the identifier itself, and they are read-only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(into = "String", try_from = "String")]
#[repr(transparent)]
pub struct Entity(Uri);

impl Entity {
    /// Initialize a new [`Entity`] with a randomly generated, globally unique
    /// URI. The URI is formatted as an ed25519 DID Key.
    pub fn unique() -> Result<Entity, EngramFactsError> {
        Ok(Self(Uri::unique()?))
    }

    /// Get the [`Entity`] as a string reference
    pub fn as_str(&self) -> &str {
        (**self).as_str()
    }

    /// Whether this [`Entity`] is an inline `data:` URI
    pub fn is_inline(&self) -> bool {
        self.scheme() == "data"
    }
}

impl Deref for Entity {
    type Target = Uri;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Uri> for Entity {
    fn from(value: Uri) -> Self {
        Self(value)
    }
}

impl FromStr for Entity {
    type Err = EngramFactsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uri::from_str(s).map_err(|error| {
            EngramFactsError::InvalidEntity(format!("{error}"))
        })?))
    }
}

impl TryFrom<String> for Entity {
    type Error = EngramFactsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Entity> for String {
    fn from(value: Entity) -> Self {
        value.to_string()
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", **self)
    }
}
