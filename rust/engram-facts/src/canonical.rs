//! Canonical JSON serialization.
//!
//! Fact hashing and cache round-trips require that equal values serialize to
//! identical bytes. Canonical form here means: object keys emitted in sorted
//! order (the `serde_json` default map representation), absent optional
//! fields stripped rather than emitted as `null`, and non-finite numbers
//! normalized to `null` before they ever enter a value tree.

use serde::Serialize;
use serde_json::Value;

use crate::EngramFactsError;

/// Serialize the given value into its canonical byte form.
pub fn to_canonical_bytes<T>(value: &T) -> Result<Vec<u8>, EngramFactsError>
where
    T: Serialize,
{
    serde_json::to_vec(value).map_err(|error| EngramFactsError::Canonical(format!("{error}")))
}

/// Convert a float into a canonical JSON value. Non-finite floats (the host
/// language may surface `NaN` or infinities from arithmetic on stored values)
/// normalize to `null`, which is also how they survive a serialization round
/// trip in the reference JSON dialect.
pub fn number(value: f64) -> Value {
    match serde_json::Number::from_f64(value) {
        Some(number) => Value::Number(number),
        None => Value::Null,
    }
}
