//! The persisted revision cache.
//!
//! An optional, best-effort sidecar keyed by `(entity, media type)`. A
//! replica consults it before reaching for the remote and writes freshly
//! merged revisions back into it. A missing cache is semantically equivalent
//! to a cache that always returns empty; cache faults are logged and never
//! surfaced.

use async_trait::async_trait;
use engram_common::ConditionalSync;
use engram_facts::{FactKey, Revision, RevisionArchive};
use engram_storage::{EngramStorageError, JsonEncoder, Storage, StorageBackend};
use tokio::sync::Mutex;

/// Anything that can persist revisions by `(entity, media type)`
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait RevisionStore: ConditionalSync {
    /// Retrieve the archived revision for a key, if any
    async fn load(&self, key: &FactKey) -> Result<Option<Revision>, EngramStorageError>;

    /// Archive a revision against its key
    async fn store(&self, revision: &Revision) -> Result<(), EngramStorageError>;
}

/// A [`RevisionStore`] over any [`StorageBackend`], encoding revisions as
/// [`RevisionArchive`] rows (the `cause` digest flattened to a string).
pub struct RevisionCache<Backend>
where
    Backend: StorageBackend<Key = String, Value = Vec<u8>>,
{
    storage: Mutex<Storage<JsonEncoder, Backend>>,
}

impl<Backend> RevisionCache<Backend>
where
    Backend: StorageBackend<Key = String, Value = Vec<u8>>,
{
    /// Wrap the provided [`StorageBackend`] as a revision cache
    pub fn new(backend: Backend) -> Self {
        Self {
            storage: Mutex::new(Storage {
                encoder: JsonEncoder,
                backend,
            }),
        }
    }

    fn cache_key(key: &FactKey) -> String {
        format!("{} {}", key.the, key.of)
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl<Backend> RevisionStore for RevisionCache<Backend>
where
    Backend: StorageBackend<Key = String, Value = Vec<u8>> + ConditionalSync,
{
    async fn load(&self, key: &FactKey) -> Result<Option<Revision>, EngramStorageError> {
        let storage = self.storage.lock().await;

        let Some(archive) = storage
            .read::<RevisionArchive>(&Self::cache_key(key))
            .await?
        else {
            return Ok(None);
        };

        let revision = Revision::try_from(archive)
            .map_err(|error| EngramStorageError::DecodeFailed(format!("{error}")))?;

        Ok(Some(revision))
    }

    async fn store(&self, revision: &Revision) -> Result<(), EngramStorageError> {
        let key = Self::cache_key(&revision.fact.key());
        let archive = RevisionArchive::from(revision);

        let mut storage = self.storage.lock().await;
        storage.write(key, &archive).await
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use engram_facts::{Assertion, Fact, MediaType, Revision};
    use engram_storage::{JsonEncoder, MemoryStorageBackend};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{RevisionCache, RevisionStore};
    use engram_storage::Encoder;

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), tokio::test)]
    async fn it_round_trips_revisions_byte_identically() -> Result<()> {
        let cache = RevisionCache::new(MemoryStorageBackend::<String, Vec<u8>>::default());

        let revision = Revision::new(
            Fact::Assertion(Assertion {
                the: MediaType::json(),
                of: "test:subject".parse()?,
                is: json!({ "value": [1, 2, 3] }),
                cause: None,
            }),
            9,
        );

        cache.store(&revision).await?;
        let restored = cache
            .load(&revision.fact.key())
            .await?
            .expect("revision was cached");

        assert_eq!(revision, restored);

        let encoder = JsonEncoder;
        assert_eq!(
            encoder.encode(&revision).await?,
            encoder.encode(&restored).await?
        );

        Ok(())
    }
}
