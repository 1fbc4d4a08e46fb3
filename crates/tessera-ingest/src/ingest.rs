//! Ingestion driver: expands user-selected inputs into leaf files, parses
//! each leaf and commits the session once.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_store::{Category, DataFile, DataFileKey, SkipReason, Writer};
use tracing::{debug, info, instrument, warn};

use crate::container::{self, ContainerKind, ExpandLimits, Payload, WorkItem};
use crate::error::{IngestError, IngestResult};
use crate::parse::{parse_file, rule_path};
use crate::rules::ProviderRules;
use crate::stream::DEFAULT_CHUNK_SIZE;

/// Progress callback receiving the overall fraction done, 0.0 to 1.0.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// One user-selected input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    /// File name, the first path segment of everything inside it
    pub name: String,
    /// Raw bytes
    pub data: Bytes,
}

impl InputFile {
    /// An input from memory.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Reads an input from disk, named by its file name.
    pub async fn read(path: impl AsRef<Path>) -> IngestResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, data))
    }
}

/// Ingestion limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestOptions {
    /// Leaf files above this many bytes are indexed but not stored
    pub size_limit: u64,
    /// Compressed bytes fed to decompressors per read
    pub chunk_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            size_limit: 128 * 1024 * 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl IngestOptions {
    fn limits(&self) -> ExpandLimits {
        ExpandLimits {
            size_limit: self.size_limit,
            chunk_size: self.chunk_size,
        }
    }
}

/// An input or container that could not be expanded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedInput {
    /// Joined path
    pub path: String,
    /// Why it failed
    pub reason: String,
}

/// Counters describing one import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Provider slug
    pub provider: String,
    /// Leaf files indexed, size-limited ones included
    pub files: usize,
    /// Leaf files over the size ceiling
    pub skipped_too_large: usize,
    /// Distinct timeline entries buffered
    pub timeline_entries: usize,
    /// Entries dropped because their slug was already seen
    pub duplicate_entries: usize,
    /// Distinct metadata keys
    pub metadata_keys: usize,
    /// Captured parse errors across all files
    pub parse_errors: usize,
    /// Inputs and containers that could not be read
    pub failed_inputs: Vec<FailedInput>,
    /// Whether anything was committed
    pub committed: bool,
}

impl ImportReport {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            ..Default::default()
        }
    }
}

struct PendingContainer {
    kind: ContainerKind,
    path: Vec<String>,
    data: Bytes,
    input_index: Option<usize>,
}

/// Pulls leaf files out of a work queue of containers, expanding lazily.
struct LeafWalker {
    containers: VecDeque<PendingContainer>,
    leaves: VecDeque<WorkItem>,
    failed: Vec<FailedInput>,
    limits: ExpandLimits,
    progress: Option<ProgressFn>,
    inputs: usize,
}

impl LeafWalker {
    fn new(inputs: Vec<InputFile>, options: &IngestOptions, progress: Option<ProgressFn>) -> Self {
        let count = inputs.len();
        let mut containers = VecDeque::new();
        let mut failed = Vec::new();
        for (i, input) in inputs.into_iter().enumerate() {
            match ContainerKind::detect(&input.name) {
                Some(kind) => containers.push_back(PendingContainer {
                    kind,
                    path: vec![input.name],
                    data: input.data,
                    input_index: Some(i),
                }),
                None => {
                    let err = IngestError::UnsupportedInput { name: input.name.clone() };
                    warn!(input = %input.name, "skipping input that is not an archive");
                    failed.push(FailedInput {
                        path: input.name,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Self {
            containers,
            leaves: VecDeque::new(),
            failed,
            limits: options.limits(),
            progress,
            inputs: count,
        }
    }

    async fn next_leaf(&mut self) -> IngestResult<Option<WorkItem>> {
        loop {
            if let Some(leaf) = self.leaves.pop_front() {
                return Ok(Some(leaf));
            }
            let Some(pending) = self.containers.pop_front() else {
                return Ok(None);
            };
            let path = pending.path.join("/");
            match self.expand(pending).await {
                Ok(items) => {
                    for item in items {
                        match (item.container(), item.payload) {
                            (Some(kind), Payload::Bytes(data)) => {
                                self.containers.push_back(PendingContainer {
                                    kind,
                                    path: item.path,
                                    data,
                                    input_index: None,
                                })
                            }
                            (_, payload) => self.leaves.push_back(WorkItem {
                                path: item.path,
                                payload,
                            }),
                        }
                    }
                }
                Err(IngestError::CorruptArchive { path, reason }) => {
                    warn!(%path, %reason, "corrupt archive");
                    self.failed.push(FailedInput {
                        reason: format!("corrupt archive: {}", reason),
                        path,
                    });
                }
                Err(e) => {
                    warn!(%path, error = %e, "archive expansion failed");
                    return Err(e);
                }
            }
        }
    }

    async fn expand(&self, pending: PendingContainer) -> IngestResult<Vec<WorkItem>> {
        let limits = self.limits;
        let total = self.inputs.max(1) as f64;
        let progress = match (self.progress.clone(), pending.input_index) {
            (Some(p), Some(i)) => Some((p, i as f64)),
            _ => None,
        };
        let report = progress.clone();
        let items = tokio::task::spawn_blocking(move || {
            let mut on_progress = |fraction: f64| {
                if let Some((p, i)) = &progress {
                    p((i + fraction) / total);
                }
            };
            container::expand(pending.kind, &pending.path, &pending.data, &limits, &mut on_progress)
        })
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e.to_string())))??;
        if let Some((p, i)) = report {
            p((i + 1.0) / total);
        }
        Ok(items)
    }

    fn into_failed(self) -> Vec<FailedInput> {
        self.failed
    }
}

/// Runs one import or profile scan for a provider.
pub struct Ingestor<'a, C> {
    rules: &'a ProviderRules<C>,
    options: IngestOptions,
    profile: Option<&'a str>,
    progress: Option<ProgressFn>,
}

impl<'a, C: Category> Ingestor<'a, C> {
    /// An ingestor for `rules`.
    pub fn new(rules: &'a ProviderRules<C>, options: IngestOptions) -> Self {
        Self {
            rules,
            options,
            profile: None,
            progress: None,
        }
    }

    /// Keeps only timeline tokens the rules' filters accept for `profile`.
    pub fn profile(mut self, profile: Option<&'a str>) -> Self {
        self.profile = profile;
        self
    }

    /// Reports progress as containers are expanded.
    pub fn progress(mut self, progress: Option<ProgressFn>) -> Self {
        self.progress = progress;
        self
    }

    /// Expands `inputs`, parses every leaf into `writer` and commits once.
    /// Nothing is committed when no leaf file was found.
    #[instrument(skip_all, fields(provider = %self.rules.slug, inputs = inputs.len()))]
    pub async fn run(&self, mut writer: Writer<C>, inputs: Vec<InputFile>) -> IngestResult<ImportReport> {
        let start = Instant::now();
        let mut report = ImportReport::new(&self.rules.slug);
        let mut walker = LeafWalker::new(inputs, &self.options, self.progress.clone());
        let mut metadata = BTreeMap::new();

        while let Some(item) = walker.next_leaf().await? {
            self.ingest_leaf(&mut writer, item, &mut metadata, &mut report).await?;
            tokio::task::yield_now().await;
        }
        report.failed_inputs = walker.into_failed();

        if report.files == 0 {
            warn!(failed = report.failed_inputs.len(), "no files found, nothing committed");
            return Ok(report);
        }

        report.metadata_keys = metadata.len();
        writer.put_metadata(metadata);
        let parsed = Instant::now();
        info!(secs = (parsed - start).as_secs_f64(), "parse time");

        writer.commit().await?;
        report.committed = true;
        info!(
            db_secs = parsed.elapsed().as_secs_f64(),
            total_secs = start.elapsed().as_secs_f64(),
            files = report.files,
            entries = report.timeline_entries,
            "import finished"
        );
        Ok(report)
    }

    async fn ingest_leaf(
        &self,
        writer: &mut Writer<C>,
        item: WorkItem,
        metadata: &mut BTreeMap<String, Value>,
        report: &mut ImportReport,
    ) -> IngestResult<()> {
        let mut key = DataFileKey::new(self.rules.slug.as_str(), item.path);
        report.files += 1;
        let data = match item.payload {
            Payload::TooLarge(len) => {
                debug!(path = %key.joined_path(), len, "file over size ceiling");
                key.skipped = Some(SkipReason::TooLarge);
                report.skipped_too_large += 1;
                writer.put_file(DataFile { key, data: Vec::new() }).await?;
                return Ok(());
            }
            Payload::Bytes(data) => data,
        };

        let outcome = parse_file(self.rules, self.profile, &key.path, &data);
        for entry in outcome.timeline {
            if writer.put_timeline_entry(entry).await? {
                report.timeline_entries += 1;
            } else {
                report.duplicate_entries += 1;
            }
        }
        metadata.extend(outcome.metadata);
        report.parse_errors += outcome.errors.len();
        key.status = Some(outcome.status);
        key.errors = outcome.errors;
        writer.put_file(DataFile { key, data: data.to_vec() }).await?;
        Ok(())
    }

    /// Profile names found in `inputs`, sorted. Empty when the provider has
    /// no profile rule.
    pub async fn list_profiles(&self, inputs: Vec<InputFile>) -> IngestResult<Vec<String>> {
        let Some(rule) = &self.rules.profile else {
            return Ok(Vec::new());
        };
        let mut names = BTreeSet::new();
        let mut walker = LeafWalker::new(inputs, &self.options, self.progress.clone());
        while let Some(item) = walker.next_leaf().await? {
            let Payload::Bytes(data) = &item.payload else { continue };
            if !rule.glob.matches(&rule_path(&item.path)) {
                continue;
            }
            match (rule.extract)(&data[..]) {
                Ok(found) => names.extend(found),
                Err(e) => warn!(path = %item.path.join("/"), error = %format!("{:#}", e), "profile extraction failed"),
            }
        }
        Ok(names.into_iter().collect())
    }
}
