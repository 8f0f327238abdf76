use async_trait::async_trait;
use engram_common::ConditionalSync;
use serde::{Serialize, de::DeserializeOwned};

mod backend;
pub use backend::*;

/// A universal envelope for all compatible combinations of [Encoder] and
/// [StorageBackend] implementations. See the crate documentation for
/// a practical example of usage.
#[derive(Clone)]
pub struct Storage<Encoder, Backend>
where
    Encoder: crate::Encoder,
    Backend: StorageBackend,
{
    /// The [Encoder] used by the [Storage]
    pub encoder: Encoder,
    /// The [StorageBackend] used by the [Storage]
    pub backend: Backend,
}

use crate::Encoder;

impl<E, Backend> Storage<E, Backend>
where
    E: Encoder,
    Backend: StorageBackend<Value = Vec<u8>>,
{
    /// Encode the given value and store it against the given key
    pub async fn write<T>(&mut self, key: Backend::Key, value: &T) -> Result<(), crate::EngramStorageError>
    where
        T: Serialize + ConditionalSync + std::fmt::Debug,
    {
        let bytes = self.encoder.encode(value).await.map_err(|error| error.into())?;
        self.backend.set(key, bytes).await.map_err(|error| error.into())
    }

    /// Retrieve and decode the value (if any) stored against the given key
    pub async fn read<T>(&self, key: &Backend::Key) -> Result<Option<T>, crate::EngramStorageError>
    where
        T: DeserializeOwned + ConditionalSync,
    {
        match self.backend.get(key).await.map_err(|error| error.into())? {
            Some(bytes) => {
                let value = self.encoder.decode(&bytes).await.map_err(|error| error.into())?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl<E, Backend> StorageBackend for Storage<E, Backend>
where
    E: Encoder,
    Backend: StorageBackend,
    Self: ConditionalSync,
{
    type Key = Backend::Key;
    type Value = Backend::Value;
    type Error = Backend::Error;

    async fn set(&mut self, key: Self::Key, value: Self::Value) -> Result<(), Self::Error> {
        self.backend.set(key, value).await
    }

    async fn get(&self, key: &Self::Key) -> Result<Option<Self::Value>, Self::Error> {
        self.backend.get(key).await
    }
}
