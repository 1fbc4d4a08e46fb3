//! Write path: buffer one import session and commit it atomically, or erase a provider.

use std::collections::{BTreeMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::backend::{Backend, PendingRecord};
use crate::error::{StoreError, StoreResult};
use crate::notify::StoreEvent;
use crate::query::load_index;
use crate::types::{Category, DataFile, DataFileKey, ProviderIndex, TimelineEntry, TimelineRow, TimelineSlot};

/// Buffering knobs for the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Timeline entries sealed together into one payload record
    pub timeline_batch_size: usize,
    /// Buffered file payload bytes that trigger a flush
    pub file_buffer_limit_bytes: usize,
    /// Sealed timeline batches buffered before a flush
    pub timeline_flush_records: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            timeline_batch_size: 64,
            file_buffer_limit_bytes: 16 * 1024 * 1024,
            timeline_flush_records: 16,
        }
    }
}

/// Counters reported by a finished commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Record id of the new provider index
    pub index_id: String,
    /// Files in the index
    pub files: usize,
    /// Timeline entries in the index
    pub timeline_entries: usize,
    /// Metadata keys in the index
    pub metadata_keys: usize,
    /// Whether any file had parse errors
    pub has_errors: bool,
    /// Payload records written, index excluded
    pub records_written: usize,
}

#[derive(Default)]
struct FileBuffer {
    pending: Vec<PendingRecord>,
    pending_bytes: usize,
    index: Vec<DataFileKey>,
}

struct TimelineBuffer<C> {
    batch: Vec<TimelineEntry<C>>,
    pending: Vec<PendingRecord>,
    dedup: HashSet<String>,
    index: Vec<TimelineRow>,
}

impl<C> Default for TimelineBuffer<C> {
    fn default() -> Self {
        Self {
            batch: Vec::new(),
            pending: Vec::new(),
            dedup: HashSet::new(),
            index: Vec::new(),
        }
    }
}

/// Accumulates one import session's output for a single provider.
///
/// Payload records may be flushed early to bound memory; they stay
/// unreachable until [`Writer::commit`] swaps the root index pointer.
pub struct Writer<C: Category> {
    backend: Arc<Backend>,
    provider: String,
    config: WriterConfig,
    files: FileBuffer,
    metadata: BTreeMap<String, Value>,
    timeline: TimelineBuffer<C>,
    records_written: usize,
    _category: PhantomData<fn() -> C>,
}

impl<C: Category> Writer<C> {
    /// A writer for `provider` with default buffering.
    pub fn new(backend: Arc<Backend>, provider: impl Into<String>) -> Self {
        Self::with_config(backend, provider, WriterConfig::default())
    }

    /// A writer for `provider` with explicit buffering.
    pub fn with_config(
        backend: Arc<Backend>,
        provider: impl Into<String>,
        config: WriterConfig,
    ) -> Self {
        Self {
            backend,
            provider: provider.into(),
            config,
            files: FileBuffer::default(),
            metadata: BTreeMap::new(),
            timeline: TimelineBuffer::default(),
            records_written: 0,
            _category: PhantomData,
        }
    }

    /// Provider slug.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Buffers a file. Size-limited files are indexed without a payload.
    pub async fn put_file(&mut self, file: DataFile) -> StoreResult<()> {
        let DataFile { mut key, data } = file;
        if key.skipped.is_none() {
            let record = self.backend.seal_binary(&data)?;
            key.payload = Some(record.id.clone());
            self.files.pending_bytes += data.len();
            self.files.pending.push(record);
        }
        self.files.index.push(key);
        if self.files.pending_bytes > self.config.file_buffer_limit_bytes {
            self.flush_files().await?;
        }
        Ok(())
    }

    /// Merges metadata. Later values for the same key win.
    pub fn put_metadata<I>(&mut self, metadata: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.metadata.extend(metadata);
    }

    /// Buffers a timeline entry. Returns false if its slug was already seen.
    pub async fn put_timeline_entry(&mut self, entry: TimelineEntry<C>) -> StoreResult<bool> {
        if !self.timeline.dedup.insert(entry.key.slug.clone()) {
            return Ok(false);
        }
        self.timeline.batch.push(entry);
        if self.timeline.batch.len() >= self.config.timeline_batch_size.max(1) {
            self.flush_timeline_batch()?;
        }
        if self.timeline.pending.len() >= self.config.timeline_flush_records.max(1) {
            self.flush_timeline_writes().await?;
        }
        Ok(true)
    }

    /// Number of distinct timeline entries buffered so far.
    pub fn timeline_len(&self) -> usize {
        self.timeline.dedup.len()
    }

    async fn flush_files(&mut self) -> StoreResult<()> {
        let records = std::mem::take(&mut self.files.pending);
        self.files.pending_bytes = 0;
        self.records_written += records.len();
        self.backend.put_records(records).await?;
        Ok(())
    }

    fn flush_timeline_batch(&mut self) -> StoreResult<()> {
        if self.timeline.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.timeline.batch);
        let slots: Vec<TimelineSlot> = batch
            .iter()
            .map(|e| (e.file.clone(), e.context.clone(), e.value.clone()))
            .collect();
        let record = self.backend.seal(&slots)?;
        for (offset, entry) in batch.into_iter().enumerate() {
            let key = entry.key;
            self.timeline.index.push(TimelineRow {
                payload: record.id.clone(),
                offset,
                day: key.day,
                timestamp: key.timestamp,
                slug: key.slug,
                category: key.category.as_tag().to_string(),
            });
        }
        self.timeline.pending.push(record);
        Ok(())
    }

    async fn flush_timeline_writes(&mut self) -> StoreResult<()> {
        let records = std::mem::take(&mut self.timeline.pending);
        self.records_written += records.len();
        self.backend.put_records(records).await?;
        Ok(())
    }

    /// Flushes everything, writes the new provider index and then points
    /// the root index at it. Nothing is visible until the last step.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn commit(mut self) -> StoreResult<CommitSummary> {
        let _guard = self.backend.store().lock_writes().await;

        self.flush_files().await?;
        self.files.index.sort_by_key(|f| f.joined_path());

        let metadata: Vec<(String, Value)> = std::mem::take(&mut self.metadata).into_iter().collect();

        self.flush_timeline_batch()?;
        self.flush_timeline_writes().await?;
        self.timeline.index.sort_by(|a, b| a.slug.cmp(&b.slug));

        let files = std::mem::take(&mut self.files.index);
        let timeline = std::mem::take(&mut self.timeline.index);
        let has_errors = files.iter().any(|f| !f.errors.is_empty());
        let index = ProviderIndex {
            files,
            metadata,
            timeline,
            has_errors,
        };
        let record = self.backend.seal(&index)?;
        let index_id = record.id.clone();
        self.backend.put_records(vec![record]).await?;

        // A reset of the last provider may have wiped the store (and its key)
        // while this session was buffering.
        let stored = self.backend.store().stored_marker().await?;
        if stored.as_ref() != Some(self.backend.marker()) {
            return Err(StoreError::KeyMismatch);
        }

        // The replaced index and its payloads stay readable for handles that
        // still hold it; only a full reset reclaims them.
        let root = self
            .backend
            .update_root_index(|root| {
                root.insert(self.provider.clone(), index_id.clone());
            })
            .await?;
        debug!(providers = root.len(), "root index updated");

        self.backend.store().bus().publish(StoreEvent::Write {
            provider: self.provider.clone(),
        });

        let summary = CommitSummary {
            index_id,
            files: index.files.len(),
            timeline_entries: index.timeline.len(),
            metadata_keys: index.metadata.len(),
            has_errors,
            records_written: self.records_written,
        };
        info!(
            files = summary.files,
            timeline_entries = summary.timeline_entries,
            metadata_keys = summary.metadata_keys,
            has_errors = summary.has_errors,
            "committed provider index"
        );
        Ok(summary)
    }
}

/// What a provider reset did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The provider had no committed data.
    NotPresent,
    /// The provider was removed and others remain.
    Removed {
        /// Providers still present
        remaining: usize,
    },
    /// The provider was the last one; the whole store was cleared.
    StoreCleared,
}

/// Erases one provider's records.
pub struct Resetter {
    backend: Arc<Backend>,
    provider: String,
}

impl Resetter {
    /// A resetter for `provider`.
    pub fn new(backend: Arc<Backend>, provider: impl Into<String>) -> Self {
        Self {
            backend,
            provider: provider.into(),
        }
    }

    /// Deletes every payload the provider's index references plus the index
    /// itself, drops its root entry and clears the store if none remain.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn reset(&self) -> StoreResult<ResetOutcome> {
        let _guard = self.backend.store().lock_writes().await;

        let root = self.backend.get_root_index().await?;
        let Some(index_id) = root.get(&self.provider).cloned() else {
            debug!("provider has no committed data");
            return Ok(ResetOutcome::NotPresent);
        };

        let index = load_index(Some(&self.backend), &self.provider).await?;
        let mut ids: HashSet<String> = index.payload_ids().map(str::to_string).collect();
        ids.insert(index_id);
        let deleted = ids.len();
        self.backend.delete(ids).await?;

        let provider = self.provider.clone();
        let root = self
            .backend
            .update_root_index(move |root| {
                root.remove(&provider);
            })
            .await?;

        if root.is_empty() {
            self.backend.clear().await?;
            info!(deleted, "reset last provider, store cleared");
            Ok(ResetOutcome::StoreCleared)
        } else {
            self.backend.store().bus().publish(StoreEvent::Reset);
            info!(deleted, remaining = root.len(), "reset provider");
            Ok(ResetOutcome::Removed {
                remaining: root.len(),
            })
        }
    }
}
