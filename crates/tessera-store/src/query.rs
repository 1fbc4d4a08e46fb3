//! Read path: typed views over one provider's committed index.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    Category, DataFile, DataFileKey, ProviderIndex, TimelineEntry, TimelineEntryKey, TimelineSlot,
};

/// Loads `provider`'s committed index, or an empty one when there is none.
pub async fn load_index(backend: Option<&Backend>, provider: &str) -> StoreResult<ProviderIndex> {
    let Some(backend) = backend else {
        return Ok(ProviderIndex::default());
    };
    let root = backend.get_root_index().await?;
    let Some(id) = root.get(provider) else {
        return Ok(ProviderIndex::default());
    };
    match backend.get::<ProviderIndex>(id).await? {
        Some(index) => Ok(index),
        None => {
            warn!(provider, index = %id, "root index points at a missing provider index");
            Ok(ProviderIndex::default())
        }
    }
}

/// Decrypted, typed view of one provider.
///
/// Without a backend (no valid key yet) every accessor returns empty results.
pub struct ProviderQuery<C> {
    backend: Option<Arc<Backend>>,
    provider: String,
    index: Arc<ProviderIndex>,
    _category: PhantomData<fn() -> C>,
}

impl<C> Clone for ProviderQuery<C> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            provider: self.provider.clone(),
            index: self.index.clone(),
            _category: PhantomData,
        }
    }
}

impl<C: Category> ProviderQuery<C> {
    /// A view over an already loaded index.
    pub fn with_index(
        backend: Option<Arc<Backend>>,
        provider: impl Into<String>,
        index: Arc<ProviderIndex>,
    ) -> Self {
        Self {
            backend,
            provider: provider.into(),
            index,
            _category: PhantomData,
        }
    }

    /// Loads the provider's index now.
    pub async fn load(backend: Option<Arc<Backend>>, provider: impl Into<String>) -> StoreResult<Self> {
        let provider = provider.into();
        let index = load_index(backend.as_deref(), &provider).await?;
        Ok(Self::with_index(backend, provider, Arc::new(index)))
    }

    /// Provider slug.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// The underlying index.
    pub fn index(&self) -> &ProviderIndex {
        &self.index
    }

    /// True if any imported file carries parse errors.
    pub fn get_has_errors(&self) -> bool {
        self.index.has_errors
    }

    /// Files sorted by joined path.
    pub fn get_files(&self) -> &[DataFileKey] {
        &self.index.files
    }

    /// Metadata as a sorted map.
    pub fn get_metadata(&self) -> BTreeMap<String, Value> {
        self.index.metadata.iter().cloned().collect()
    }

    /// Timeline keys in slug order. Rows with tags `C` doesn't know are dropped.
    pub fn get_timeline_entries(&self) -> Vec<TimelineEntryKey<C>> {
        self.index
            .timeline
            .iter()
            .filter_map(|row| {
                let key = row.to_key::<C>();
                if key.is_none() {
                    debug!(provider = %self.provider, tag = %row.category, "unknown category tag");
                }
                key
            })
            .collect()
    }

    /// Fetches the file's bytes. Size-limited files hydrate with no data.
    pub async fn hydrate_file(&self, key: &DataFileKey) -> StoreResult<Option<DataFile>> {
        if key.skipped.is_some() {
            return Ok(Some(DataFile {
                key: key.clone(),
                data: Vec::new(),
            }));
        }
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        let id = key
            .payload
            .as_deref()
            .ok_or_else(|| StoreError::MissingPayload(key.joined_path()))?;
        Ok(backend.get_binary(id).await?.map(|data| DataFile {
            key: key.clone(),
            data,
        }))
    }

    /// Fetches the batched payload holding this entry and picks its slot.
    pub async fn hydrate_timeline_entry(
        &self,
        key: &TimelineEntryKey<C>,
    ) -> StoreResult<Option<TimelineEntry<C>>> {
        let (Some(id), Some(offset)) = (key.payload.as_deref(), key.offset) else {
            return Err(StoreError::MissingPayload(key.slug.clone()));
        };
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        let Some(mut batch) = backend.get::<Vec<TimelineSlot>>(id).await? else {
            return Ok(None);
        };
        if offset >= batch.len() {
            return Err(StoreError::Corrupt(format!(
                "timeline offset {} out of range for batch of {}",
                offset,
                batch.len()
            )));
        }
        let (file, context, value) = batch.swap_remove(offset);
        Ok(Some(TimelineEntry {
            key: key.clone(),
            file,
            context,
            value,
        }))
    }

    /// Finds an entry by slug with a linear scan of the index, then hydrates it.
    pub async fn get_timeline_entry_by_slug(
        &self,
        slug: &str,
    ) -> StoreResult<Option<TimelineEntry<C>>> {
        let Some(key) = self
            .index
            .timeline
            .iter()
            .find(|row| row.slug == slug)
            .and_then(|row| row.to_key::<C>())
        else {
            return Ok(None);
        };
        self.hydrate_timeline_entry(&key).await
    }

    /// Files whose joined path equals `path`.
    pub fn find_file(&self, path: &str) -> Option<&DataFileKey> {
        self.index.files.iter().find(|f| f.joined_path() == path)
    }
}
