#![warn(missing_docs)]

//! Tessera store subsystem: an encrypted, indexed local record store with atomic per-provider commits
//!
//! Write path: DataFile / TimelineEntry → Writer (seal, batch) → payload records → ProviderIndex → RootIndex
//! Read path:  RootIndex → ProviderIndex → ProviderQuery → hydrate (open payload record)

pub mod backend;
pub mod codec;
pub mod connection;
pub mod dir_store;
pub mod encryption;
pub mod error;
pub mod key;
pub mod kvstore;
pub mod notify;
pub mod query;
pub mod secret;
pub mod types;
pub mod write;

pub use backend::{maybe_expire, Backend, ConnectMode, PendingRecord, Store, KEY_HASH_KEY, ROOT_INDEX_KEY};
pub use codec::{b64_decode, b64_encode, blake3_hash, file_slug, timeline_slug, ContentHash};
pub use connection::ConnectionManager;
pub use dir_store::DirKvStore;
pub use encryption::{EncryptionAlgorithm, EncryptionKey, SealedRecord};
pub use error::{StoreError, StoreResult};
pub use key::{KeyMarker, Secret, StoreKey};
pub use kvstore::{BatchOp, KvStore, MemoryKvStore};
pub use notify::{EventBus, StoreEvent};
pub use query::{load_index, ProviderQuery};
pub use secret::{FileSecretSource, MemorySecretSource, SecretSource, DEFAULT_SECRET_TTL};
pub use types::{
    Category, DataFile, DataFileKey, FileStatus, ParseError, ParseStage, ProviderIndex, RootIndex,
    SkipReason, TimelineContext, TimelineEntry, TimelineEntryKey, TimelineRow, TimelineSlot,
    TimelineUser,
};
pub use write::{CommitSummary, ResetOutcome, Resetter, Writer, WriterConfig};
