//! Provider registry: rule sets of any category type behind one object-safe trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tessera_store::{Category, ConnectionManager};
use tracing::debug;

use crate::configured::ProviderSpec;
use crate::error::IngestResult;
use crate::ingest::{ImportReport, IngestOptions, Ingestor, InputFile, ProgressFn};
use crate::rules::ProviderRules;

/// Everything one import needs besides the provider.
#[derive(Clone, Default)]
pub struct ImportRequest {
    /// User-selected inputs
    pub inputs: Vec<InputFile>,
    /// Selected profile, if the export has several
    pub profile: Option<String>,
    /// Size and chunk limits
    pub options: IngestOptions,
    /// Progress sink
    pub progress: Option<ProgressFn>,
}

impl std::fmt::Debug for ImportRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportRequest")
            .field("inputs", &self.inputs.iter().map(|i| &i.name).collect::<Vec<_>>())
            .field("profile", &self.profile)
            .field("options", &self.options)
            .finish()
    }
}

/// A provider as the vault sees it, with its category type erased.
#[async_trait]
pub trait ProviderImporter: Send + Sync {
    /// Store key
    fn slug(&self) -> &str;
    /// Human-readable name
    fn display_name(&self) -> &str;
    /// Runs a full import into `manager`'s store.
    async fn import(&self, manager: &ConnectionManager, request: ImportRequest) -> IngestResult<ImportReport>;
    /// Profile names found in `inputs`.
    async fn list_profiles(&self, inputs: Vec<InputFile>, options: IngestOptions) -> IngestResult<Vec<String>>;
}

#[async_trait]
impl<C: Category> ProviderImporter for ProviderRules<C> {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn import(&self, manager: &ConnectionManager, request: ImportRequest) -> IngestResult<ImportReport> {
        let writer = manager.begin_import::<C>(&self.slug).await?;
        Ingestor::new(self, request.options)
            .profile(request.profile.as_deref())
            .progress(request.progress)
            .run(writer, request.inputs)
            .await
    }

    async fn list_profiles(&self, inputs: Vec<InputFile>, options: IngestOptions) -> IngestResult<Vec<String>> {
        Ingestor::new(self, options).list_profiles(inputs).await
    }
}

/// Known providers by slug.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ProviderImporter>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles every spec. The first invalid spec fails the whole registry.
    pub fn from_specs(specs: &[ProviderSpec]) -> IngestResult<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec.compile()?);
        }
        Ok(registry)
    }

    /// Adds a provider, replacing any with the same slug.
    pub fn register<P: ProviderImporter + 'static>(&mut self, provider: P) -> Option<Arc<dyn ProviderImporter>> {
        let slug = provider.slug().to_string();
        debug!(%slug, "registered provider");
        self.providers.insert(slug, Arc::new(provider))
    }

    /// Provider by slug.
    pub fn get(&self, slug: &str) -> Option<Arc<dyn ProviderImporter>> {
        self.providers.get(slug).cloned()
    }

    /// Registered slugs, sorted.
    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Registered providers in slug order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProviderImporter>> {
        self.providers.values()
    }

    /// Number of providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.slugs()).finish()
    }
}
