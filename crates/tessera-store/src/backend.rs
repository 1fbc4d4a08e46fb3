//! Encrypted store backend: key check, record sealing and raw record CRUD.
//!
//! Every record in the durable table is a bincode [`SealedRecord`] whose key
//! id is bound as AEAD associated data. Random records are keyed by the
//! base64url form of their nonce. Two fixed keys exist: [`KEY_HASH_KEY`]
//! holds the cleartext hash marker of the store key and [`ROOT_INDEX_KEY`]
//! holds the sealed [`RootIndex`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::codec::{b64_encode, from_json, to_json};
use crate::encryption::{open, random_nonce, seal_with_nonce, EncryptionAlgorithm, SealedRecord};
use crate::error::{StoreError, StoreResult};
use crate::key::{KeyMarker, Secret, StoreKey};
use crate::kvstore::{BatchOp, KvStore};
use crate::notify::{EventBus, StoreEvent};
use crate::types::RootIndex;

/// Key of the cleartext key-hash marker.
pub const KEY_HASH_KEY: &str = "KEY-HASH";
/// Key of the sealed root index.
pub const ROOT_INDEX_KEY: &str = "ROOT-INDEX";

/// What a connection intends to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Read only. A virgin store reads as absent.
    Read,
    /// Read and write. May claim a virgin store.
    Write,
}

/// One logical store: the durable table plus the state every handle onto it shares.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KvStore>,
    bus: EventBus,
    write_lock: Arc<Mutex<()>>,
    algo: EncryptionAlgorithm,
}

impl Store {
    /// Wraps a durable table. New records are sealed with `algo`.
    pub fn new(kv: Arc<dyn KvStore>, algo: EncryptionAlgorithm) -> Self {
        Self {
            kv,
            bus: EventBus::default(),
            write_lock: Arc::new(Mutex::new(())),
            algo,
        }
    }

    /// The durable table.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// The notification bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribes to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.bus.subscribe()
    }

    /// Cipher used for new records.
    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algo
    }

    /// Serializes commit and reset pipelines against each other.
    pub async fn lock_writes(&self) -> OwnedMutexGuard<()> {
        self.write_lock.clone().lock_owned().await
    }

    /// The stored key-hash marker, if the store has been claimed.
    pub async fn stored_marker(&self) -> StoreResult<Option<KeyMarker>> {
        match self.kv.get(KEY_HASH_KEY).await? {
            Some(bytes) => Ok(Some(KeyMarker::from_stored(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// A sealed record that has not been written yet.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    /// Record id
    pub id: String,
    /// Encoded envelope
    pub bytes: Vec<u8>,
}

impl PendingRecord {
    /// Size of the encoded envelope.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for an empty envelope.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A connection onto a [`Store`] under a verified key.
pub struct Backend {
    store: Store,
    key: StoreKey,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("key", &self.key).finish()
    }
}

impl Backend {
    /// Connects to `store` under `secret`.
    ///
    /// Returns `Ok(None)` when a read connection finds a virgin store or a
    /// store claimed under another secret. A write connection claims a
    /// virgin store and fails with [`StoreError::KeyMismatch`] on a foreign one.
    pub async fn connect(
        store: &Store,
        secret: &Secret,
        mode: ConnectMode,
    ) -> StoreResult<Option<Self>> {
        let key = StoreKey::derive(secret)?;
        let stored = store.stored_marker().await?;
        match (stored, mode) {
            (Some(m), _) if m == key.marker => {}
            (None, ConnectMode::Read) => return Ok(None),
            (None, ConnectMode::Write) => {
                store
                    .kv
                    .put(KEY_HASH_KEY, key.marker.as_str().as_bytes().to_vec())
                    .await?;
                warn!(marker = key.marker.as_str(), "claimed empty store under new key");
                store.bus.publish(StoreEvent::Rekey);
            }
            (Some(_), ConnectMode::Read) => return Ok(None),
            (Some(_), ConnectMode::Write) => return Err(StoreError::KeyMismatch),
        }
        Ok(Some(Self {
            store: store.clone(),
            key,
        }))
    }

    /// The store this backend is connected to.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Hash marker of this connection's key.
    pub fn marker(&self) -> &KeyMarker {
        &self.key.marker
    }

    async fn open_record(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let Some(bytes) = self.store.kv.get(id).await? else {
            return Ok(None);
        };
        let record = SealedRecord::from_bytes(&bytes)?;
        Ok(Some(open(&record, id.as_bytes(), &self.key.key)?))
    }

    /// Fetches and decrypts a JSON record.
    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> StoreResult<Option<T>> {
        match self.open_record(id).await? {
            Some(plain) => Ok(Some(from_json(&plain)?)),
            None => Ok(None),
        }
    }

    /// Fetches and decrypts a binary record.
    pub async fn get_binary(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        self.open_record(id).await
    }

    /// The root index, empty if none has been written.
    pub async fn get_root_index(&self) -> StoreResult<RootIndex> {
        Ok(self.get(ROOT_INDEX_KEY).await?.unwrap_or_default())
    }

    fn seal_at(&self, id: String, plaintext: &[u8]) -> StoreResult<PendingRecord> {
        let record = seal_with_nonce(
            plaintext,
            id.as_bytes(),
            &self.key.key,
            self.store.algo,
            random_nonce(),
        )?;
        Ok(PendingRecord {
            id,
            bytes: record.to_bytes()?,
        })
    }

    /// Seals raw bytes under a fresh random id.
    pub fn seal_binary(&self, plaintext: &[u8]) -> StoreResult<PendingRecord> {
        let id = b64_encode(&random_nonce().0);
        self.seal_at(id, plaintext)
    }

    /// Serializes and seals a value under a fresh random id.
    pub fn seal<T: Serialize + ?Sized>(&self, value: &T) -> StoreResult<PendingRecord> {
        self.seal_binary(&to_json(value)?)
    }

    /// Writes sealed records in one atomic batch, returning their ids.
    pub async fn put_records(&self, records: Vec<PendingRecord>) -> StoreResult<Vec<String>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let ids = records.iter().map(|r| r.id.clone()).collect();
        let ops = records
            .into_iter()
            .map(|r| BatchOp::Put {
                key: r.id,
                value: r.bytes,
            })
            .collect();
        self.store.kv.write_batch(ops).await?;
        Ok(ids)
    }

    /// Encrypts and stores one value, returning its id.
    pub async fn encrypted_put<T: Serialize + ?Sized>(&self, value: &T) -> StoreResult<String> {
        let record = self.seal(value)?;
        let id = record.id.clone();
        self.store.kv.put(&id, record.bytes).await?;
        Ok(id)
    }

    /// Encrypts and stores several values in one atomic batch.
    pub async fn batch_put<T: Serialize>(&self, values: &[T]) -> StoreResult<Vec<String>> {
        let records = values
            .iter()
            .map(|v| self.seal(v))
            .collect::<StoreResult<Vec<_>>>()?;
        self.put_records(records).await
    }

    /// Deletes records in one atomic batch. Missing ids are ignored.
    pub async fn delete<I>(&self, ids: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = String>,
    {
        let ops: Vec<BatchOp> = ids.into_iter().map(|key| BatchOp::Delete { key }).collect();
        if ops.is_empty() {
            return Ok(());
        }
        debug!(count = ops.len(), "deleting records");
        self.store.kv.write_batch(ops).await
    }

    /// Read-modify-write of the root index. Must be the last step of any commit.
    pub async fn update_root_index<F>(&self, mutate: F) -> StoreResult<RootIndex>
    where
        F: FnOnce(&mut RootIndex),
    {
        let mut index = self.get_root_index().await?;
        mutate(&mut index);
        let record = self.seal_at(ROOT_INDEX_KEY.to_string(), &to_json(&index)?)?;
        self.store.kv.put(ROOT_INDEX_KEY, record.bytes).await?;
        Ok(index)
    }

    /// Drops every record including the key marker and broadcasts a rekey.
    pub async fn clear(&self) -> StoreResult<()> {
        warn!("clearing encrypted store");
        self.store.kv.clear().await?;
        self.store.bus.publish(StoreEvent::Rekey);
        Ok(())
    }
}

/// Wipes the store if it was claimed under a key other than the one derived
/// from `secret` (or if there is no secret at all). Returns true if it wiped.
pub async fn maybe_expire(store: &Store, secret: Option<&Secret>) -> StoreResult<bool> {
    let _guard = store.lock_writes().await;
    let Some(stored) = store.stored_marker().await? else {
        return Ok(false);
    };
    if let Some(secret) = secret {
        if StoreKey::derive(secret)?.marker == stored {
            return Ok(false);
        }
    }
    warn!("expiring encrypted store claimed under a stale key");
    store.kv.clear().await?;
    store.bus.publish(StoreEvent::Rekey);
    Ok(true)
}
