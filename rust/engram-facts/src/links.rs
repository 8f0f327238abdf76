//! Link discovery inside stored values.
//!
//! Documents may reference other entities with the same single-key map shape
//! used by causal references: `{"/": "<entity uri>"}`. The subscription
//! manager discovers such links in recently-arrived values to expand its
//! wildcard subscriptions. Values can form reference cycles through the
//! store, so the traversal is a bounded worklist, never a recursive walk.

use std::collections::VecDeque;

use serde_json::Value;

use crate::Entity;

/// The default bound on the number of nodes a single scan will visit
pub const LINK_SCAN_BUDGET: usize = 4096;

/// Collect the entities referenced by `{"/": id}` link objects inside
/// `value`, in discovery order and deduplicated. At most `budget` JSON nodes
/// are visited; anything beyond the budget is left undiscovered (a later
/// arrival of the linked document will surface it again).
pub fn scan_links(value: &Value, budget: usize) -> Vec<Entity> {
    let mut worklist = VecDeque::from([value]);
    let mut visited = 0usize;
    let mut links = Vec::new();

    while let Some(node) = worklist.pop_front() {
        if visited >= budget {
            break;
        }
        visited += 1;

        match node {
            Value::Object(fields) => {
                if fields.len() == 1 {
                    if let Some(Value::String(target)) = fields.get("/") {
                        if let Ok(entity) = target.parse::<Entity>() {
                            if !links.contains(&entity) {
                                links.push(entity);
                            }
                            continue;
                        }
                    }
                }

                worklist.extend(fields.values());
            }
            Value::Array(items) => worklist.extend(items.iter()),
            _ => (),
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;

    use super::{LINK_SCAN_BUDGET, scan_links};
    use crate::Entity;

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_collects_nested_links_once_each() -> Result<()> {
        let value = json!({
            "left": { "/": "test:alpha" },
            "right": [{ "/": "test:beta" }, { "/": "test:alpha" }],
            "decoy": { "/": "not a uri at all ::" , "other": 1 },
        });

        let links = scan_links(&value, LINK_SCAN_BUDGET);

        assert_eq!(
            links,
            vec![
                "test:alpha".parse::<Entity>()?,
                "test:beta".parse::<Entity>()?
            ]
        );

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_stops_at_the_node_budget() {
        let wide = json!((0..100).map(|i| json!({ "/": format!("test:{i}") })).collect::<Vec<_>>());

        let links = scan_links(&wide, 10);

        assert!(links.len() < 100);
    }
}
