use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use base58::ToBase58;

use crate::EngramStorageError;

use super::StorageBackend;

/// A basic file-system-based [StorageBackend] implementation. All values are
/// stored inside a root directory as files named after their (base58-encoded)
/// keys. Writes go through a temporary file and a rename so that a partially
/// written value is never observable.
#[derive(Clone)]
pub struct FsStorageBackend<Key, Value>
where
    Key: AsRef<[u8]> + Clone,
    Value: AsRef<[u8]> + From<Vec<u8>> + Clone,
{
    root_dir: PathBuf,
    key_type: PhantomData<Key>,
    value_type: PhantomData<Value>,
}

impl<Key, Value> FsStorageBackend<Key, Value>
where
    Key: AsRef<[u8]> + Clone,
    Value: AsRef<[u8]> + From<Vec<u8>> + Clone,
{
    /// Creates a new [`FsStorageBackend`] that stores files in `root_dir`.
    pub async fn new<Pathlike>(root_dir: Pathlike) -> Result<Self, EngramStorageError>
    where
        Pathlike: AsRef<Path>,
    {
        let root_dir = root_dir.as_ref().to_owned();
        tokio::fs::create_dir_all(&root_dir)
            .await
            .map_err(|error| EngramStorageError::StorageBackend(format!("{error}")))?;
        Ok(Self {
            root_dir,
            key_type: PhantomData,
            value_type: PhantomData,
        })
    }

    fn make_path(&self, key: &Key) -> PathBuf {
        self.root_dir.join(key.as_ref().to_base58())
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<Key, Value> StorageBackend for FsStorageBackend<Key, Value>
where
    Key: AsRef<[u8]> + Clone + Send + Sync,
    Value: AsRef<[u8]> + From<Vec<u8>> + Clone + Send + Sync,
{
    type Key = Key;
    type Value = Value;
    type Error = EngramStorageError;

    async fn set(&mut self, key: Self::Key, value: Self::Value) -> Result<(), Self::Error> {
        let path = self.make_path(&key);
        let temp_path = path.with_extension("tmp");

        tokio::fs::write(&temp_path, value.as_ref())
            .await
            .map_err(|error| EngramStorageError::StorageBackend(format!("{error}")))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|error| EngramStorageError::StorageBackend(format!("{error}")))?;

        Ok(())
    }

    async fn get(&self, key: &Self::Key) -> Result<Option<Self::Value>, Self::Error> {
        let path = self.make_path(key);

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Value::from(bytes))),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(EngramStorageError::StorageBackend(format!("{error}"))),
        }
    }
}
