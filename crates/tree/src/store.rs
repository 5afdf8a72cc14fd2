//! Key-value storage backends

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::StoreError;

/// Puts committed together by [`KvStore::write_batch`]
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push((key.into(), value.into()));
    }

    /// Number of queued puts
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queued puts in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.ops.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

/// Byte-oriented key-value store.
///
/// `write_batch` must be atomic: either every put becomes visible or none does.
pub trait KvStore: Send + Sync {
    /// Read a value, `None` if absent
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a single value
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Commit a batch atomically
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        (**self).put(key, value)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }
}

/// In-memory store.
///
/// Clones share the same map, so a tree can be reopened against a clone.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    map: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.map.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.write().map_err(|_| StoreError::Poisoned)?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut map = self.map.write().map_err(|_| StoreError::Poisoned)?;
        for (key, value) in batch.ops {
            map.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(feature = "rocksdb")]
mod rocks {
    use std::path::Path;

    use rocksdb::{Options, DB};

    use super::{KvStore, StoreError, WriteBatch};

    impl From<rocksdb::Error> for StoreError {
        fn from(err: rocksdb::Error) -> Self {
            Self::Backend(err.into_string())
        }
    }

    /// RocksDB-backed store
    #[derive(Debug)]
    pub struct RocksDbStore {
        db: DB,
    }

    impl RocksDbStore {
        /// Open or create a database at `path`
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            let mut options = Options::default();
            options.create_if_missing(true);
            Ok(Self { db: DB::open(&options, path)? })
        }
    }

    impl KvStore for RocksDbStore {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.db.get(key)?)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            Ok(self.db.put(key, value)?)
        }

        fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
            let mut rocks_batch = rocksdb::WriteBatch::default();
            for (key, value) in batch.iter() {
                rocks_batch.put(key, value);
            }
            Ok(self.db.write(rocks_batch)?)
        }
    }

}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksDbStore;
