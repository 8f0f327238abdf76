//! Inline `data:` facts.
//!
//! An entity whose URI carries the `data:` scheme *is* its own value: the
//! payload is decoded out of the identifier according to the media type the
//! identifier declares. Inline facts are read-only.

use base64::Engine;
use serde_json::Value;

use crate::{Entity, EngramFactsError, MediaType};

/// Decode the value of an inline `data:` entity. The entity's declared media
/// type must agree with the media type the caller is addressing. Payloads
/// tagged `application/json` (or any `+json` subtype) are parsed; every
/// other media type is yielded as an opaque string.
pub fn decode_inline(entity: &Entity, the: &MediaType) -> Result<Value, EngramFactsError> {
    let uri = entity.as_str();

    let Some(content) = uri.strip_prefix("data:") else {
        return Err(EngramFactsError::InvalidDataUri(format!(
            "Not a data URI: \"{uri}\""
        )));
    };

    let Some((metadata, payload)) = content.split_once(',') else {
        return Err(EngramFactsError::InvalidDataUri(format!(
            "Missing payload separator in \"{uri}\""
        )));
    };

    let (media_type, base64) = match metadata.strip_suffix(";base64") {
        Some(media_type) => (media_type, true),
        None => (metadata, false),
    };

    // Per RFC 2397 an omitted media type means text/plain
    let media_type = if media_type.is_empty() {
        "text/plain".to_string()
    } else {
        media_type.to_string()
    };

    if media_type != the.as_str() {
        return Err(EngramFactsError::UnsupportedMediaType(format!(
            "Inline fact is \"{media_type}\" but was addressed as \"{the}\""
        )));
    }

    let payload = if base64 {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|error| EngramFactsError::InvalidDataUri(format!("{error}")))?;
        String::from_utf8(bytes)
            .map_err(|error| EngramFactsError::InvalidDataUri(format!("{error}")))?
    } else {
        percent_decode(payload)?
    };

    if media_type == "application/json" || media_type.ends_with("+json") {
        serde_json::from_str(&payload)
            .map_err(|error| EngramFactsError::InvalidDataUri(format!("{error}")))
    } else {
        Ok(Value::String(payload))
    }
}

fn percent_decode(payload: &str) -> Result<String, EngramFactsError> {
    let mut bytes = Vec::with_capacity(payload.len());
    let mut rest = payload.bytes();

    while let Some(byte) = rest.next() {
        if byte == b'%' {
            let digits = [rest.next(), rest.next()];
            let [Some(high), Some(low)] = digits else {
                return Err(EngramFactsError::InvalidDataUri(
                    "Truncated percent escape".into(),
                ));
            };
            let decoded = u8::from_str_radix(&format!("{}{}", high as char, low as char), 16)
                .map_err(|error| EngramFactsError::InvalidDataUri(format!("{error}")))?;
            bytes.push(decoded);
        } else {
            bytes.push(byte);
        }
    }

    String::from_utf8(bytes).map_err(|error| EngramFactsError::InvalidDataUri(format!("{error}")))
}
