use std::fmt::Display;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{EngramFactsError, to_canonical_bytes};

/// The number of bytes in a [`Reference`] digest
pub const REFERENCE_SIZE: usize = 32;

/// Produces the raw digest behind a [`Reference`]; in practice, these bytes
/// are the BLAKE3 hash of the inputs to this function
pub fn make_reference<B>(bytes: B) -> [u8; REFERENCE_SIZE]
where
    B: AsRef<[u8]>,
{
    blake3::hash(bytes.as_ref()).as_bytes().to_owned()
}

/// A [`Reference`] is a content-addressed pointer to a fact: the hash of the
/// fact's canonical serialization. Equal references imply equal content. On
/// the wire a reference appears as `{"/": "<base32 digest>"}`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference([u8; REFERENCE_SIZE]);

impl Reference {
    /// Compute the [`Reference`] of any serializable value by hashing its
    /// canonical byte form
    pub fn of<T>(value: &T) -> Result<Self, EngramFactsError>
    where
        T: Serialize,
    {
        Ok(Self(make_reference(to_canonical_bytes(value)?)))
    }

    /// The raw digest bytes of this [`Reference`]
    pub fn digest(&self) -> &[u8; REFERENCE_SIZE] {
        &self.0
    }

    /// Render the digest in the base32 form used on the wire
    pub fn encode(&self) -> String {
        base32::encode(base32::Alphabet::Rfc4648Lower { padding: false }, &self.0)
    }

    /// Parse a [`Reference`] from its base32 wire form
    pub fn decode(digest: &str) -> Result<Self, EngramFactsError> {
        let bytes = base32::decode(base32::Alphabet::Rfc4648Lower { padding: false }, digest)
            .ok_or_else(|| {
                EngramFactsError::InvalidReference(format!("Not a base32 digest: \"{digest}\""))
            })?;
        Self::try_from(bytes)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl From<[u8; REFERENCE_SIZE]> for Reference {
    fn from(value: [u8; REFERENCE_SIZE]) -> Self {
        Self(value)
    }
}

impl From<Reference> for [u8; REFERENCE_SIZE] {
    fn from(value: Reference) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for Reference {
    type Error = EngramFactsError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(Self(value.try_into().map_err(|value: Vec<u8>| {
            EngramFactsError::InvalidReference(format!(
                "Incorrect length (expected {REFERENCE_SIZE}, got {})",
                value.len()
            ))
        })?))
    }
}

/// The wire shape of a [`Reference`]: a single-key map from `"/"` to the
/// base32 digest.
#[derive(Serialize, Deserialize)]
struct LinkForm {
    #[serde(rename = "/")]
    digest: String,
}

impl Serialize for Reference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        LinkForm {
            digest: self.encode(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let form = LinkForm::deserialize(deserializer)?;
        Reference::decode(&form.digest).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;

    use super::Reference;

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_hashes_equal_values_identically() -> Result<()> {
        let left = Reference::of(&json!({ "a": 1, "b": [true, null] }))?;
        let right = Reference::of(&json!({ "b": [true, null], "a": 1 }))?;
        let other = Reference::of(&json!({ "a": 1, "b": [true] }))?;

        assert_eq!(left, right);
        assert_ne!(left, other);

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_round_trips_through_the_wire_form() -> Result<()> {
        let reference = Reference::of(&json!("some content"))?;

        let serialized = serde_json::to_value(reference)?;
        assert_eq!(serialized, json!({ "/": reference.encode() }));

        let deserialized: Reference = serde_json::from_value(serialized)?;
        assert_eq!(reference, deserialized);

        Ok(())
    }
}
