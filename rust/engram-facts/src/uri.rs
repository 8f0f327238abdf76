use std::{fmt::Display, ops::Deref, str::FromStr};

use base58::ToBase58;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::EngramFactsError;

/// A [`Uri`] is a helper type that helps validate and reliably convert
/// between plain string URIs (which typically represent an entity or a
/// space) and their parsed representation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Uri(Url);

impl Uri {
    /// Generate a globally unique URI. The raw format will be an ed25519 DID
    /// Key.
    pub fn unique() -> Result<Self, EngramFactsError> {
        const PREFIX: &str = "z6Mk";

        let key = [
            PREFIX,
            SigningKey::generate(&mut rand::thread_rng())
                .verifying_key()
                .as_bytes()
                .as_ref()
                .to_base58()
                .as_str(),
        ]
        .concat();

        format!("did:key:{key}")
            .parse()
            .map(Self)
            .map_err(|error| EngramFactsError::InvalidUri(format!("{error}")))
    }

    /// Get the [`Uri`] as a string reference
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The scheme of this [`Uri`] (the part before the first `:`)
    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", **self)
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        (*value).to_string()
    }
}

impl Deref for Uri {
    type Target = Url;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Uri {
    type Err = EngramFactsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse().map_err(|error| {
            EngramFactsError::InvalidUri(format!("{error}"))
        })?))
    }
}

impl TryFrom<String> for Uri {
    type Error = EngramFactsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::Uri;

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_parses_common_identifier_schemes() -> Result<()> {
        for uri in [
            "https://example.com/recipe",
            "did:key:z6Mk2WiNvjBbuWZ8jYNmFzh4uFyt8iqwpDND6ymg6KnKzchw",
            "urn:uuid:2f302fb5-642e-4d3b-af19-d0310deff4c0",
        ] {
            let parsed: Uri = uri.parse()?;
            assert_eq!(parsed.as_str(), uri);
        }

        // Inline payloads survive parsing, though reserved characters are
        // normalized into percent escapes
        let inline: Uri = "data:application/json,{\"x\":1}".parse()?;
        assert_eq!(inline.scheme(), "data");
        assert_eq!(inline.as_str(), "data:application/json,%7B%22x%22:1%7D");

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_generates_unique_did_keys() -> Result<()> {
        let one = Uri::unique()?;
        let other = Uri::unique()?;

        assert!(one.as_str().starts_with("did:key:z6Mk"));
        assert_ne!(one, other);

        Ok(())
    }
}
