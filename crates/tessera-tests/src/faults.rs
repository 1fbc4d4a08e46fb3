//! Fault Injection Utilities - a key/value table that fails on demand

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tessera_store::{BatchOp, KvStore, MemoryKvStore, StoreError, ROOT_INDEX_KEY};

/// Which writes to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// Every write after the first `n` succeeds
    AfterWrites(usize),
    /// Any write touching the root index
    RootIndexWrite,
    /// Every read
    Reads,
}

impl FaultType {
    pub fn description(&self) -> String {
        match self {
            FaultType::AfterWrites(n) => format!("writes after the first {}", n),
            FaultType::RootIndexWrite => "root index writes".to_string(),
            FaultType::Reads => "reads".to_string(),
        }
    }
}

/// Wraps a [`MemoryKvStore`] and fails selected operations while armed.
/// Failed writes leave the inner table untouched.
#[derive(Clone, Default)]
pub struct FaultyKvStore {
    inner: MemoryKvStore,
    fault: Arc<Mutex<Option<FaultType>>>,
    armed: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
    injected: Arc<AtomicUsize>,
}

impl FaultyKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `fault`, restarting the write count.
    pub fn inject(&self, fault: FaultType) {
        if let Ok(mut slot) = self.fault.lock() {
            *slot = Some(fault);
        }
        self.writes.store(0, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Writes that reached the inner table since the last [`FaultyKvStore::inject`].
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Operations failed so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryKvStore {
        &self.inner
    }

    fn active(&self) -> Option<FaultType> {
        if !self.armed.load(Ordering::SeqCst) {
            return None;
        }
        self.fault.lock().ok().and_then(|f| *f)
    }

    fn fail(&self, what: &str) -> StoreError {
        self.injected.fetch_add(1, Ordering::SeqCst);
        StoreError::Kv(format!("injected fault: {}", what))
    }

    fn check_write(&self, keys: &[&str]) -> Result<(), StoreError> {
        match self.active() {
            Some(FaultType::AfterWrites(n)) if self.writes() >= n => Err(self.fail("write")),
            Some(FaultType::RootIndexWrite) if keys.contains(&ROOT_INDEX_KEY) => {
                Err(self.fail("root index write"))
            }
            _ => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn check_read(&self) -> Result<(), StoreError> {
        match self.active() {
            Some(FaultType::Reads) => Err(self.fail("read")),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for FaultyKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_read()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check_write(&[key])?;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_write(&[key])?;
        self.inner.delete(key).await
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let keys: Vec<&str> = ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, .. } | BatchOp::Delete { key } => key.as_str(),
            })
            .collect();
        self.check_write(&keys)?;
        self.inner.write_batch(ops).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.check_write(&[])?;
        self.inner.clear().await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.check_read()?;
        self.inner.keys().await
    }
}
