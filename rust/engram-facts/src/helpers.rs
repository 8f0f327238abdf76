//! Test and example data helpers.

use anyhow::Result;
use serde_json::json;

use crate::{Assertion, Entity, MediaType};

/// Generate `count` unrelated assertions with generated entities, suitable
/// for seeding a store under test.
pub fn generate_assertions(count: usize) -> Result<Vec<Assertion>> {
    let mut assertions = Vec::with_capacity(count);

    for index in 0..count {
        assertions.push(Assertion {
            the: MediaType::json(),
            of: Entity::unique()?,
            is: json!({ "id": index, "name": format!("name{index}") }),
            cause: None,
        });
    }

    Ok(assertions)
}
