//! Directory-backed key/value store with a write-ahead batch journal.
//!
//! Each key maps to one file under `records/`, named by the base64url form of
//! the key. A batch is serialized to `batch.journal` and fsynced before any
//! record file is touched; puts are then applied by writing a temp file and
//! renaming it over the target. A journal left behind by a crash is replayed
//! on open, and a torn journal (checksum mismatch) is discarded, so a batch is
//! all-or-nothing.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{b64_decode, b64_encode, blake3_hash};
use crate::error::StoreError;
use crate::kvstore::{BatchOp, KvStore};

const RECORDS_DIR: &str = "records";
const JOURNAL_FILE: &str = "batch.journal";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalOp {
    Put {
        key: String,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
}

impl From<BatchOp> for JournalOp {
    fn from(op: BatchOp) -> Self {
        match op {
            BatchOp::Put { key, value } => JournalOp::Put { key, value },
            BatchOp::Delete { key } => JournalOp::Delete { key },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    checksum: [u8; 32],
    ops: Vec<JournalOp>,
}

impl JournalRecord {
    fn new(ops: Vec<JournalOp>) -> Result<Self, StoreError> {
        let checksum = blake3_hash(&bincode::serialize(&ops)?).0;
        Ok(Self { checksum, ops })
    }

    fn verify(&self) -> bool {
        match bincode::serialize(&self.ops) {
            Ok(bytes) => blake3_hash(&bytes).0 == self.checksum,
            Err(_) => false,
        }
    }
}

struct Inner {
    root: PathBuf,
    lock: Mutex<()>,
}

impl Inner {
    fn records(&self) -> PathBuf {
        self.root.join(RECORDS_DIR)
    }

    fn journal(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.records().join(b64_encode(key.as_bytes()))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock.lock().map_err(|e| StoreError::Kv(e.to_string()))
    }

    fn write_atomic(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let target = self.record_path(key);
        let mut tmp = target.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        let mut f = File::create(&tmp)?;
        f.write_all(value)?;
        f.sync_all()?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn apply(&self, ops: &[JournalOp]) -> Result<(), StoreError> {
        for op in ops {
            match op {
                JournalOp::Put { key, value } => self.write_atomic(key, value)?,
                JournalOp::Delete { key } => self.remove(key)?,
            }
        }
        sync_dir(&self.records())
    }

    fn commit_batch(&self, ops: Vec<JournalOp>) -> Result<(), StoreError> {
        let record = JournalRecord::new(ops)?;
        let journal = self.journal();
        let mut f = File::create(&journal)?;
        f.write_all(&bincode::serialize(&record)?)?;
        f.sync_all()?;
        drop(f);
        sync_dir(&self.root)?;

        self.apply(&record.ops)?;
        fs::remove_file(&journal)?;
        sync_dir(&self.root)
    }

    fn recover(&self) -> Result<(), StoreError> {
        let journal = self.journal();
        let bytes = match fs::read(&journal) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match bincode::deserialize::<JournalRecord>(&bytes) {
            Ok(record) if record.verify() => {
                debug!(ops = record.ops.len(), "replaying batch journal");
                self.apply(&record.ops)?;
            }
            _ => warn!(path = %journal.display(), "discarding torn batch journal"),
        }
        fs::remove_file(&journal)?;
        sync_dir(&self.root)
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<(), StoreError> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

/// Persistent [`KvStore`] rooted at a directory.
#[derive(Clone)]
pub struct DirKvStore {
    inner: Arc<Inner>,
}

impl DirKvStore {
    /// Opens (creating if needed) a store at `root`, replaying any leftover journal.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let inner = Arc::new(Inner {
            root: root.into(),
            lock: Mutex::new(()),
        });
        let setup = inner.clone();
        blocking(move || {
            fs::create_dir_all(setup.records())?;
            let _g = setup.guard()?;
            setup.recover()
        })
        .await?;
        Ok(Self { inner })
    }

    /// Directory the store lives in.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Kv(format!("blocking task failed: {}", e)))?
}

#[async_trait]
impl KvStore for DirKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.clone();
        let key = key.to_string();
        blocking(move || match fs::read(inner.record_path(&key)) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let key = key.to_string();
        blocking(move || {
            let _g = inner.guard()?;
            inner.write_atomic(&key, &value)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let key = key.to_string();
        blocking(move || {
            let _g = inner.guard()?;
            inner.remove(&key)
        })
        .await
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let ops: Vec<JournalOp> = ops.into_iter().map(JournalOp::from).collect();
        blocking(move || {
            let _g = inner.guard()?;
            inner.commit_batch(ops)
        })
        .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        blocking(move || {
            let _g = inner.guard()?;
            let records = inner.records();
            fs::remove_dir_all(&records)?;
            fs::create_dir_all(&records)?;
            sync_dir(&inner.root)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.clone();
        blocking(move || {
            let mut keys = Vec::new();
            for entry in fs::read_dir(inner.records())? {
                let name = entry?.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.ends_with(TMP_SUFFIX) {
                    continue;
                }
                let raw = b64_decode(name)?;
                let key = String::from_utf8(raw)
                    .map_err(|e| StoreError::Corrupt(format!("record name: {}", e)))?;
                keys.push(key);
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }
}
