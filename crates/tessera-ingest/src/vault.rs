//! The vault facade: the public operations over one store and one provider registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tessera_store::{
    Category, ConnectionManager, DirKvStore, FileSecretSource, ProviderQuery, ResetOutcome, Store,
    StoreEvent,
};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::config::VaultConfig;
use crate::error::{IngestError, IngestResult};
use crate::ingest::{ImportReport, IngestOptions, InputFile, ProgressFn};
use crate::registry::{ImportRequest, ProviderImporter, ProviderRegistry};

/// Imports, resets and queries against one encrypted store.
#[derive(Clone)]
pub struct Vault {
    manager: Arc<ConnectionManager>,
    registry: Arc<ProviderRegistry>,
    options: IngestOptions,
}

impl Vault {
    /// A vault over an already-built manager and registry.
    pub fn new(manager: Arc<ConnectionManager>, registry: ProviderRegistry, options: IngestOptions) -> Self {
        Self {
            manager,
            registry: Arc::new(registry),
            options,
        }
    }

    /// Opens the on-disk store described by `config` and runs the startup
    /// expiry check. Configured providers are registered.
    pub async fn open(config: &VaultConfig) -> IngestResult<Self> {
        let kv = DirKvStore::open(&config.data_dir).await?;
        let store = Store::new(Arc::new(kv), config.cipher);
        let secrets = FileSecretSource::new(&config.secret_path, config.secret_ttl());
        let manager = ConnectionManager::with_writer_config(store, Arc::new(secrets), config.writer_config());
        let registry = ProviderRegistry::from_specs(&config.providers)?;
        let vault = Self::new(manager, registry, config.ingest_options());
        if vault.expire().await? {
            info!(data_dir = %config.data_dir.display(), "store expired at startup");
        }
        Ok(vault)
    }

    /// Shared connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Registered providers.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Limits applied to every import.
    pub fn options(&self) -> IngestOptions {
        self.options
    }

    fn importer(&self, provider: &str) -> IngestResult<Arc<dyn ProviderImporter>> {
        self.registry
            .get(provider)
            .ok_or_else(|| IngestError::UnknownProvider(provider.to_string()))
    }

    /// Expands, parses and commits `inputs` for `provider`, replacing its
    /// previous import.
    #[instrument(skip(self, inputs, progress), fields(input_count = inputs.len()))]
    pub async fn import_files(
        &self,
        provider: &str,
        inputs: Vec<InputFile>,
        profile: Option<String>,
        progress: Option<ProgressFn>,
    ) -> IngestResult<ImportReport> {
        let importer = self.importer(provider)?;
        let request = ImportRequest {
            inputs,
            profile,
            options: self.options,
            progress,
        };
        let report = importer.import(&self.manager, request).await?;
        if report.committed {
            self.manager
                .invalidate(&StoreEvent::Write {
                    provider: provider.to_string(),
                })
                .await;
        }
        Ok(report)
    }

    /// Erases `provider`; erasing the last one clears the store and its secret.
    pub async fn reset_provider(&self, provider: &str) -> IngestResult<ResetOutcome> {
        Ok(self.manager.reset_provider(provider).await?)
    }

    /// Providers with committed data.
    pub async fn get_providers(&self) -> IngestResult<BTreeSet<String>> {
        Ok(self.manager.providers().await?)
    }

    /// Profile names in an export, before importing it.
    pub async fn list_profiles(&self, provider: &str, inputs: Vec<InputFile>) -> IngestResult<Vec<String>> {
        self.importer(provider)?.list_profiles(inputs, self.options).await
    }

    /// Read handle for `provider`. Empty while no key exists or nothing was imported.
    pub async fn provider<C: Category>(&self, provider: &str) -> IngestResult<ProviderQuery<C>> {
        Ok(self.manager.provider::<C>(provider).await?)
    }

    /// Wipes the store if it was claimed under a secret that is no longer current.
    pub async fn expire(&self) -> IngestResult<bool> {
        Ok(self.manager.expire().await?)
    }

    /// Starts the cache invalidation listener and the periodic expiry check.
    pub fn spawn_background(&self, expiry_interval: Duration) -> Vec<JoinHandle<()>> {
        vec![
            self.manager.spawn_invalidation_listener(),
            self.manager.spawn_expiry_watch(expiry_interval),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configured::ConfiguredCategory;
    use crate::rules::TimelineRule;
    use crate::test_support::{zip_of, Kind};
    use crate::time::EventTime;
    use crate::rules::ProviderRules;
    use serde_json::json;
    use tessera_store::{EncryptionAlgorithm, MemoryKvStore, MemorySecretSource};

    fn vault() -> Vault {
        let store = Store::new(Arc::new(MemoryKvStore::new()), EncryptionAlgorithm::default());
        let manager = ConnectionManager::new(store, Arc::new(MemorySecretSource::default()));
        let mut registry = ProviderRegistry::new();
        registry.register(
            ProviderRules::<Kind>::new("acme", "Acme").timeline(
                TimelineRule::new("events.json", |v| {
                    Ok(vec![(Kind::Message, EventTime::from_unix_seconds(v.as_f64().unwrap_or(0.0)), None)])
                })
                .unwrap(),
            ),
        );
        Vault::new(manager, registry, IngestOptions::default())
    }

    fn export(events: &[u32]) -> Vec<InputFile> {
        let body = json!(events).to_string();
        vec![InputFile::new("x.zip", zip_of(&[("events.json", body.as_bytes())]))]
    }

    #[tokio::test]
    async fn test_empty_vault_reads() {
        let v = vault();
        assert!(v.get_providers().await.unwrap().is_empty());
        let q = v.provider::<Kind>("acme").await.unwrap();
        assert!(q.get_files().is_empty());
    }

    #[tokio::test]
    async fn test_reimport_replaces_and_reads_fresh() {
        let v = vault();
        v.import_files("acme", export(&[1, 2]), None, None).await.unwrap();
        assert_eq!(v.provider::<Kind>("acme").await.unwrap().get_timeline_entries().len(), 2);

        v.import_files("acme", export(&[1, 2, 3]), None, None).await.unwrap();
        assert_eq!(v.provider::<Kind>("acme").await.unwrap().get_timeline_entries().len(), 3);
        assert_eq!(
            v.get_providers().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["acme"]
        );
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let v = vault();
        let err = v.import_files("nope", export(&[1]), None, None).await.unwrap_err();
        assert!(matches!(err, IngestError::UnknownProvider(ref s) if s == "nope"));
        assert!(v.list_profiles("nope", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_last_provider_clears_store() {
        let v = vault();
        v.import_files("acme", export(&[1]), None, None).await.unwrap();
        assert_eq!(v.reset_provider("acme").await.unwrap(), ResetOutcome::StoreCleared);
        assert!(v.get_providers().await.unwrap().is_empty());
        assert_eq!(v.reset_provider("acme").await.unwrap(), ResetOutcome::NotPresent);

        v.import_files("acme", export(&[5]), None, None).await.unwrap();
        let q = v.provider::<ConfiguredCategory>("acme").await.unwrap();
        assert_eq!(q.get_timeline_entries()[0].category, ConfiguredCategory("message".into()));
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig {
            data_dir: dir.path().join("data"),
            secret_path: dir.path().join("secret.json"),
            providers: vec![toml::from_str("slug = \"acme\"\nignore = [\"*\"]").unwrap()],
            ..Default::default()
        };
        let v = Vault::open(&config).await.unwrap();
        let report = v
            .import_files("acme", vec![InputFile::new("x.zip", zip_of(&[("a", &b"1"[..])]))], None, None)
            .await
            .unwrap();
        assert!(report.committed);
        drop(v);

        let reopened = Vault::open(&config).await.unwrap();
        assert_eq!(reopened.get_providers().await.unwrap().len(), 1);
    }
}
