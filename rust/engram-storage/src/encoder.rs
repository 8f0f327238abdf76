use async_trait::async_trait;
use engram_common::ConditionalSync;
use serde::{Serialize, de::DeserializeOwned};

use crate::EngramStorageError;

/// An [Encoder] converts values to and from a byte representation that is
/// suitable for a [StorageBackend](crate::StorageBackend) to persist.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait Encoder: Clone {
    /// The error type produced by this [Encoder]
    type Error: Into<EngramStorageError>;

    /// Encode a serializable item into bytes
    async fn encode<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize + ConditionalSync + std::fmt::Debug;

    /// Decode bytes into a value
    async fn decode<T>(&self, bytes: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned + ConditionalSync;
}

/// An [Encoder] that serializes values as canonical JSON. Canonical here means
/// that object keys are emitted in sorted order, so that encoding the same
/// value twice yields byte-identical output.
#[derive(Clone)]
pub struct JsonEncoder;

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl Encoder for JsonEncoder {
    type Error = EngramStorageError;

    async fn encode<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize + ConditionalSync + std::fmt::Debug,
    {
        serde_json::to_vec(value)
            .map_err(|error| EngramStorageError::EncodeFailed(format!("{error}")))
    }

    async fn decode<T>(&self, bytes: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned + ConditionalSync,
    {
        serde_json::from_slice::<T>(bytes)
            .map_err(|error| EngramStorageError::DecodeFailed(format!("{error}")))
    }
}
