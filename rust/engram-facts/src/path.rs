use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A [`Path`] names a descendant of a JSON document: a sequence of object
/// keys and array indexes (indexes are carried as decimal strings). The
/// empty path addresses the whole document. Paths never name an array's
/// `length` (that is a host-language view over the data, not data).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Path(Vec<String>);

impl Path {
    /// The empty [`Path`], addressing a whole document
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Whether this [`Path`] addresses the whole document
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of segments in this [`Path`]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this [`Path`] has no segments (alias of [`Path::is_root`])
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The segments of this [`Path`], in order
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether this [`Path`] is a (non-strict) prefix of `other`. A path
    /// subsumes every path beneath it.
    pub fn includes(&self, other: &Path) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Whether either of the two paths is a prefix of the other
    pub fn intersects(&self, other: &Path) -> bool {
        self.includes(other) || other.includes(self)
    }

    /// The segments of `self` that remain after removing the `prefix`, if
    /// `prefix` actually is one
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        prefix
            .includes(self)
            .then(|| Path(self.0[prefix.0.len()..].to_vec()))
    }

    /// Extend this [`Path`] by one segment
    pub fn child<S>(&self, segment: S) -> Path
    where
        S: Into<String>,
    {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Path(segments)
    }

    /// The first `length` segments of this [`Path`]
    pub fn truncate(&self, length: usize) -> Path {
        Path(self.0[..length.min(self.0.len())].to_vec())
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            for segment in &self.0 {
                write!(f, "/{segment}")?;
            }
            Ok(())
        }
    }
}

impl From<Vec<String>> for Path {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

impl From<&[&str]> for Path {
    fn from(value: &[&str]) -> Self {
        Self(value.iter().map(|segment| segment.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Path {
    fn from(value: [&str; N]) -> Self {
        Self(value.iter().map(|segment| segment.to_string()).collect())
    }
}

/// The outcome of resolving a [`Path`] against a JSON document
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution<'a> {
    /// Every segment resolved; the referenced value is attached
    Resolved(&'a Value),
    /// Every interior segment resolved to a container, but the final segment
    /// is not present in it. This is an ordinary "absent" read, not a fault.
    Absent,
    /// An interior segment was not present in its (container) parent. The
    /// attached path is the prefix that failed to resolve.
    Missing(Path),
    /// A segment addressed into a value that is not a container. The attached
    /// path is the prefix that failed to resolve.
    Mismatch(Path),
}

/// Resolve `path` against `value`, descending through objects by key and
/// through arrays by decimal index.
pub fn resolve<'a>(value: &'a Value, path: &Path) -> Resolution<'a> {
    let mut current = value;

    for (position, segment) in path.segments().iter().enumerate() {
        let at = || path.truncate(position + 1);
        let leaf = position + 1 == path.len();

        let next = match current {
            Value::Object(fields) => fields.get(segment),
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(index) => items.get(index),
                Err(_) => None,
            },
            _ => return Resolution::Mismatch(at()),
        };

        match next {
            Some(next) => current = next,
            None if leaf => return Resolution::Absent,
            None => return Resolution::Missing(at()),
        }
    }

    Resolution::Resolved(current)
}

/// The ways in which a targeted patch can fail to apply
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum PatchFailure {
    /// An interior segment was not present in its (container) parent
    #[error("path segment missing: {0}")]
    Missing(Path),
    /// A segment addressed into a value that is not a container
    #[error("path segment is not a container: {0}")]
    Mismatch(Path),
}

/// Apply a targeted patch to an immutable document, producing the patched
/// copy. A patch of `None` at the root marks the whole document for
/// retraction (the result is `None`); `None` at a leaf deletes the key.
/// Array indexes may extend the array by at most its length; assigning past
/// the end pads the gap with `null`.
pub fn patch_at(
    value: Option<&Value>,
    path: &Path,
    patch: Option<Value>,
) -> Result<Option<Value>, PatchFailure> {
    if path.is_root() {
        return Ok(patch);
    }

    let Some(value) = value else {
        return Err(PatchFailure::Missing(path.truncate(1)));
    };

    let mut document = value.clone();
    patch_in_place(&mut document, path, 0, patch)?;

    Ok(Some(document))
}

fn patch_in_place(
    current: &mut Value,
    path: &Path,
    position: usize,
    patch: Option<Value>,
) -> Result<(), PatchFailure> {
    let segment = &path.segments()[position];
    let at = || path.truncate(position + 1);
    let leaf = position + 1 == path.len();

    match current {
        Value::Object(fields) => {
            if leaf {
                match patch {
                    Some(patch) => {
                        fields.insert(segment.clone(), patch);
                    }
                    None => {
                        fields.remove(segment);
                    }
                }
                Ok(())
            } else {
                match fields.get_mut(segment) {
                    Some(next) => patch_in_place(next, path, position + 1, patch),
                    None => Err(PatchFailure::Missing(at())),
                }
            }
        }
        Value::Array(items) => {
            let index = segment
                .parse::<usize>()
                .map_err(|_| PatchFailure::Mismatch(at()))?;

            if leaf {
                match patch {
                    Some(patch) => {
                        while items.len() < index {
                            items.push(Value::Null);
                        }
                        if index < items.len() {
                            items[index] = patch;
                        } else {
                            items.push(patch);
                        }
                    }
                    None => {
                        if index < items.len() {
                            items[index] = Value::Null;
                        }
                    }
                }
                Ok(())
            } else {
                match items.get_mut(index) {
                    Some(next) => patch_in_place(next, path, position + 1, patch),
                    None => Err(PatchFailure::Missing(at())),
                }
            }
        }
        _ => Err(PatchFailure::Mismatch(at())),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{Path, PatchFailure, Resolution, patch_at, resolve};

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_recognizes_prefix_inclusion() {
        let parent = Path::from(["a", "b"]);
        let descendant = Path::from(["a", "b", "c"]);
        let sibling = Path::from(["a", "x"]);

        assert!(parent.includes(&descendant));
        assert!(!descendant.includes(&parent));
        assert!(parent.intersects(&descendant));
        assert!(descendant.intersects(&parent));
        assert!(!parent.intersects(&sibling));
        assert!(Path::root().includes(&parent));
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_resolves_paths_through_objects_and_arrays() {
        let document = json!({ "a": { "b": [1, 2, { "c": true }] } });

        assert_eq!(
            resolve(&document, &Path::from(["a", "b", "2", "c"])),
            Resolution::Resolved(&json!(true))
        );
        assert_eq!(
            resolve(&document, &Path::from(["a", "missing"])),
            Resolution::Absent
        );
        assert_eq!(
            resolve(&document, &Path::from(["a", "missing", "deeper"])),
            Resolution::Missing(Path::from(["a", "missing"]))
        );
        assert_eq!(
            resolve(&document, &Path::from(["a", "b", "0", "c"])),
            Resolution::Mismatch(Path::from(["a", "b", "0", "c"]))
        );
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_patches_without_disturbing_the_source() -> Result<()> {
        let document = json!({ "a": { "b": 1 } });

        let patched = patch_at(Some(&document), &Path::from(["a", "b"]), Some(json!(2)))?;

        assert_eq!(patched, Some(json!({ "a": { "b": 2 } })));
        assert_eq!(document, json!({ "a": { "b": 1 } }));

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_deletes_keys_and_extends_arrays() -> Result<()> {
        let document = json!({ "kept": 1, "dropped": 2, "items": [] });

        let patched = patch_at(Some(&document), &Path::from(["dropped"]), None)?;
        assert_eq!(patched, Some(json!({ "kept": 1, "items": [] })));

        let patched = patch_at(Some(&document), &Path::from(["items", "2"]), Some(json!(9)))?;
        assert_eq!(
            patched,
            Some(json!({ "kept": 1, "dropped": 2, "items": [null, null, 9] }))
        );

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_rejects_patches_through_missing_parents() {
        let document = json!({ "a": 1 });

        assert_eq!(
            patch_at(Some(&document), &Path::from(["b", "c"]), Some(json!(1))),
            Err(PatchFailure::Missing(Path::from(["b"])))
        );
        assert_eq!(
            patch_at(Some(&document), &Path::from(["a", "c"]), Some(json!(1))),
            Err(PatchFailure::Mismatch(Path::from(["a", "c"])))
        );
    }
}
