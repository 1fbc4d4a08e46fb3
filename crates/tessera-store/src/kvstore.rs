//! Durable key/value contract the encrypted store sits on.
//!
//! The store only needs a flat table of opaque byte values keyed by strings,
//! with get/put/delete and small atomic multi-key batches. [`MemoryKvStore`]
//! backs tests and ephemeral sessions; [`crate::dir_store::DirKvStore`]
//! persists to a directory.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::StoreError;

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: String,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: String,
    },
}

/// Key-value store trait for record persistence.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Put a key-value pair. Overwrites any existing value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically apply a batch of operations: either all land or none do.
    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Drop every record.
    async fn clear(&self) -> Result<(), StoreError>;

    /// All keys, sorted.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// True when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        data.clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        Ok(data.keys().cloned().collect())
    }
}
