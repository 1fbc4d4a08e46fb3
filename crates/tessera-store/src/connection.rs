//! Connection manager: the application-owned handle onto one logical store.
//!
//! Owns the secret source, a cached read backend and a per-provider index
//! cache. Every store event bumps a generation counter and drops the cached
//! state it affects, so readers pick up commits and resets made through any
//! handle on the same [`Store`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{maybe_expire, Backend, ConnectMode, Store};
use crate::error::{StoreError, StoreResult};
use crate::notify::StoreEvent;
use crate::query::{load_index, ProviderQuery};
use crate::secret::SecretSource;
use crate::types::{Category, ProviderIndex};
use crate::write::{ResetOutcome, Resetter, Writer, WriterConfig};

type IndexCell = Arc<OnceCell<Arc<ProviderIndex>>>;

/// Shared entry point for reads, writes and resets against one store.
pub struct ConnectionManager {
    store: Store,
    secrets: Arc<dyn SecretSource>,
    writer_config: WriterConfig,
    reader: RwLock<Option<Option<Arc<Backend>>>>,
    indices: DashMap<String, IndexCell>,
    generation: AtomicU64,
}

impl ConnectionManager {
    /// A manager over `store` deriving keys from `secrets`.
    pub fn new(store: Store, secrets: Arc<dyn SecretSource>) -> Arc<Self> {
        Self::with_writer_config(store, secrets, WriterConfig::default())
    }

    /// Like [`ConnectionManager::new`] with explicit writer buffering.
    pub fn with_writer_config(
        store: Store,
        secrets: Arc<dyn SecretSource>,
        writer_config: WriterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            secrets,
            writer_config,
            reader: RwLock::new(None),
            indices: DashMap::new(),
            generation: AtomicU64::new(0),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Incremented on every invalidation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Subscribes to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    /// Drops cached state affected by `event`.
    pub async fn invalidate(&self, event: &StoreEvent) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        match event {
            StoreEvent::Write { provider } => {
                self.indices.remove(provider);
            }
            StoreEvent::Rekey | StoreEvent::Reset => {
                self.indices.clear();
                *self.reader.write().await = None;
            }
        }
        debug!(?event, generation = self.generation(), "invalidated caches");
    }

    /// The read backend, or `None` while no valid key exists.
    pub async fn reader(&self) -> StoreResult<Option<Arc<Backend>>> {
        if let Some(cached) = self.reader.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let mut slot = self.reader.write().await;
        if let Some(cached) = slot.as_ref() {
            return Ok(cached.clone());
        }
        let backend = match self.secrets.current().await? {
            Some(secret) => Backend::connect(&self.store, &secret, ConnectMode::Read)
                .await?
                .map(Arc::new),
            None => None,
        };
        *slot = Some(backend.clone());
        Ok(backend)
    }

    /// A write backend, generating a secret and claiming the store if needed.
    /// A store claimed under a stale key is wiped first.
    pub async fn writer(&self) -> StoreResult<Arc<Backend>> {
        let secret = self.secrets.get_or_generate().await?;
        if maybe_expire(&self.store, Some(&secret)).await? {
            self.invalidate(&StoreEvent::Rekey).await;
        }
        let backend = Backend::connect(&self.store, &secret, ConnectMode::Write)
            .await?
            .map(Arc::new)
            .ok_or(StoreError::NotConnected)?;
        let mut slot = self.reader.write().await;
        if !matches!(slot.as_ref(), Some(Some(_))) {
            *slot = Some(Some(backend.clone()));
        }
        Ok(backend)
    }

    /// A fresh writer for `provider`.
    pub async fn begin_import<C: Category>(&self, provider: &str) -> StoreResult<Writer<C>> {
        let backend = self.writer().await?;
        Ok(Writer::with_config(backend, provider, self.writer_config))
    }

    /// Providers with committed data.
    pub async fn providers(&self) -> StoreResult<BTreeSet<String>> {
        match self.reader().await? {
            Some(backend) => Ok(backend.get_root_index().await?.into_keys().collect()),
            None => Ok(BTreeSet::new()),
        }
    }

    /// A typed view of `provider`, backed by the index cache.
    pub async fn provider<C: Category>(&self, provider: &str) -> StoreResult<ProviderQuery<C>> {
        let backend = self.reader().await?;
        let Some(b) = backend.as_ref() else {
            return Ok(ProviderQuery::with_index(
                None,
                provider,
                Arc::new(ProviderIndex::default()),
            ));
        };
        let cell = self
            .indices
            .entry(provider.to_string())
            .or_default()
            .value()
            .clone();
        let index = cell
            .get_or_try_init(|| async { load_index(Some(b.as_ref()), provider).await.map(Arc::new) })
            .await?
            .clone();
        Ok(ProviderQuery::with_index(backend, provider, index))
    }

    /// Erases `provider`. A no-op when the store or the provider is absent.
    pub async fn reset_provider(&self, provider: &str) -> StoreResult<ResetOutcome> {
        let Some(backend) = self.reader().await? else {
            debug!(provider, "reset on unclaimed store");
            return Ok(ResetOutcome::NotPresent);
        };
        let outcome = Resetter::new(backend.clone(), provider).reset().await?;
        match outcome {
            ResetOutcome::NotPresent => {}
            ResetOutcome::Removed { .. } => self.invalidate(&StoreEvent::Reset).await,
            ResetOutcome::StoreCleared => {
                if self.secrets.clear_if_match(backend.marker()).await? {
                    info!("cleared store secret after last provider reset");
                }
                self.invalidate(&StoreEvent::Rekey).await;
            }
        }
        Ok(outcome)
    }

    /// Runs the expiry check against the current secret.
    pub async fn expire(&self) -> StoreResult<bool> {
        let secret = self.secrets.current().await?;
        let wiped = maybe_expire(&self.store, secret.as_ref()).await?;
        if wiped {
            self.invalidate(&StoreEvent::Rekey).await;
        }
        Ok(wiped)
    }

    /// Applies bus events to this manager's caches until it is dropped.
    pub fn spawn_invalidation_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "invalidation listener lagged");
                        StoreEvent::Rekey
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(manager) = weak.upgrade() else { break };
                manager.invalidate(&event).await;
            }
        })
    }

    /// Runs [`ConnectionManager::expire`] every `interval` until the manager is dropped.
    pub fn spawn_expiry_watch(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                match manager.expire().await {
                    Ok(true) => info!("expired store on schedule"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "expiry check failed"),
                }
            }
        })
    }
}
