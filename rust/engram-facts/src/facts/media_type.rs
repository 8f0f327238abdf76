//! Media types for fact payloads.
//!
//! This module defines the [`MediaType`] type which tags the payload format
//! of a fact. Media types must follow a "type/subtype" format.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::EngramFactsError;

/// The longest accepted media type, in bytes
pub const MEDIA_TYPE_LENGTH: usize = 128;

/// A [`MediaType`] tags the payload format of a fact. [`MediaType`]s in this
/// crate may be a maximum of 128 bytes, and must be formatted as
/// "type/subtype".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[repr(transparent)]
pub struct MediaType(String);

impl MediaType {
    /// The media type of ordinary JSON documents
    pub fn json() -> Self {
        Self("application/json".into())
    }

    /// The media type under which a space's commit log head is stored
    pub fn commit() -> Self {
        Self("application/commit+json".into())
    }

    /// The media type of classification label documents
    pub fn label() -> Self {
        Self("application/label+json".into())
    }

    /// Get the [`MediaType`] as a string reference
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MediaType {
    type Error = EngramFactsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() > MEDIA_TYPE_LENGTH {
            return Err(EngramFactsError::InvalidMediaType(format!(
                "Media type \"{value}\" is too long (must be no longer than {MEDIA_TYPE_LENGTH} bytes)"
            )));
        }

        let Some((r#type, subtype)) = value.split_once('/') else {
            return Err(EngramFactsError::InvalidMediaType(format!(
                "Media type format is \"type/subtype\", but got \"{value}\""
            )));
        };

        if r#type.is_empty() || subtype.is_empty() {
            return Err(EngramFactsError::InvalidMediaType(format!(
                "Media type format is \"type/subtype\", but got \"{value}\""
            )));
        }

        Ok(Self(value))
    }
}

impl FromStr for MediaType {
    type Err = EngramFactsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MediaType::try_from(s.to_owned())
    }
}

impl From<MediaType> for String {
    fn from(value: MediaType) -> Self {
        value.0
    }
}

impl From<&MediaType> for String {
    fn from(value: &MediaType) -> Self {
        value.0.clone()
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::MediaType;

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_requires_a_type_and_subtype() -> Result<()> {
        assert_eq!("application/json".parse::<MediaType>()?, MediaType::json());
        assert!("application".parse::<MediaType>().is_err());
        assert!("/json".parse::<MediaType>().is_err());

        Ok(())
    }
}
