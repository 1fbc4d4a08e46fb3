//! The `tessera` command line.

use crate::config::VaultConfig;
use crate::configured::ConfiguredCategory;
use crate::ingest::InputFile;
use crate::vault::Vault;
use crate::worker::{ImportWorker, WorkerConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use tessera_store::{DataFileKey, ProviderQuery, ResetOutcome, TimelineEntry};

const HYDRATE_CONCURRENCY: usize = 8;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Encrypted personal data vault", long_about = None)]
pub struct Cli {
    /// Vault configuration file (TOML or JSON)
    #[arg(short, long, default_value = "tessera.toml", env = "TESSERA_CONFIG")]
    pub config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Operation to run
    #[command(subcommand)]
    pub command: Command,
}

/// Vault operations.
#[derive(Subcommand)]
pub enum Command {
    /// Import an export, replacing the provider's previous import
    Import {
        /// Provider slug
        #[arg(short, long)]
        provider: String,
        /// Only keep entries attributed to this profile
        #[arg(long)]
        profile: Option<String>,
        /// Export files or archives
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List the profiles in an export without importing it
    Profiles {
        /// Provider slug
        #[arg(short, long)]
        provider: String,
        /// Export files or archives
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Erase one provider
    Reset {
        /// Provider slug
        provider: String,
    },
    /// List providers with committed data
    Providers,
    /// List a provider's files and their parse status
    Files {
        /// Provider slug
        provider: String,
    },
    /// Print a provider's metadata as JSON
    Metadata {
        /// Provider slug
        provider: String,
    },
    /// List timeline entries in chronological order
    Timeline {
        /// Provider slug
        provider: String,
        /// Maximum entries to print
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Only entries on this day (YYYY-MM-DD)
        #[arg(short, long)]
        day: Option<String>,
    },
    /// Print one timeline entry as JSON
    Show {
        /// Provider slug
        provider: String,
        /// Entry slug
        slug: String,
    },
    /// Write a stored file's bytes to stdout
    Cat {
        /// Provider slug
        provider: String,
        /// Joined path, e.g. export.zip/posts.json
        path: String,
    },
    /// Wipe the store if its secret has expired
    Expire,
}

impl Cli {
    /// Opens the configured vault and runs the command.
    pub async fn run(self) -> Result<()> {
        let config = VaultConfig::load_or_default(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        let vault = Vault::open(&config).await?;

        match self.command {
            Command::Import {
                ref provider,
                ref profile,
                ref files,
            } => import(&vault, provider, profile.clone(), files).await,
            Command::Profiles { ref provider, ref files } => {
                let inputs = read_inputs(files).await?;
                for name in vault.list_profiles(provider, inputs).await? {
                    println!("{}", name);
                }
                Ok(())
            }
            Command::Reset { ref provider } => {
                match vault.reset_provider(provider).await? {
                    ResetOutcome::NotPresent => println!("{} has no data", provider),
                    ResetOutcome::Removed { remaining } => {
                        println!("Removed {} ({} providers remain)", provider, remaining)
                    }
                    ResetOutcome::StoreCleared => println!("Removed {}; store cleared", provider),
                }
                Ok(())
            }
            Command::Providers => {
                let present = vault.get_providers().await?;
                for (slug, importer) in vault.registry().iter().map(|i| (i.slug().to_string(), i)) {
                    let mark = if present.contains(&slug) { "*" } else { " " };
                    println!("{} {:<16} {}", mark, slug, importer.display_name());
                }
                for slug in present.iter().filter(|s| vault.registry().get(s).is_none()) {
                    println!("* {:<16} (not configured)", slug);
                }
                Ok(())
            }
            Command::Files { ref provider } => {
                let q = query(&vault, provider).await?;
                for file in q.get_files() {
                    println!("{}", file_line(file));
                }
                if q.get_has_errors() {
                    println!("(some files had parse errors)");
                }
                Ok(())
            }
            Command::Metadata { ref provider } => {
                let q = query(&vault, provider).await?;
                println!("{}", serde_json::to_string_pretty(&q.get_metadata())?);
                Ok(())
            }
            Command::Timeline {
                ref provider,
                limit,
                ref day,
            } => {
                let q = query(&vault, provider).await?;
                let keys: Vec<_> = q
                    .get_timeline_entries()
                    .into_iter()
                    .filter(|k| day.as_ref().map_or(true, |d| &k.day == d))
                    .take(limit)
                    .collect();
                let q = &q;
                let entries: Vec<_> = stream::iter(keys)
                    .map(|key| async move { q.hydrate_timeline_entry(&key).await })
                    .buffered(HYDRATE_CONCURRENCY)
                    .try_collect()
                    .await?;
                for entry in entries.into_iter().flatten() {
                    println!("{}", timeline_line(&entry));
                }
                Ok(())
            }
            Command::Show {
                ref provider,
                ref slug,
            } => {
                let q = query(&vault, provider).await?;
                let entry = q
                    .get_timeline_entry_by_slug(slug)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no timeline entry {}", slug))?;
                println!("{}", serde_json::to_string_pretty(&entry_json(&entry))?);
                Ok(())
            }
            Command::Cat {
                ref provider,
                ref path,
            } => {
                let q = query(&vault, provider).await?;
                let key = q
                    .find_file(path)
                    .ok_or_else(|| anyhow::anyhow!("no file {}", path))?;
                if let Some(reason) = key.skipped {
                    anyhow::bail!("{} was not stored: {:?}", path, reason);
                }
                let file = q
                    .hydrate_file(key)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("payload for {} is missing", path))?;
                std::io::stdout().write_all(&file.data)?;
                Ok(())
            }
            Command::Expire => {
                if vault.expire().await? {
                    println!("Store expired and cleared");
                } else {
                    println!("Store is current");
                }
                Ok(())
            }
        }
    }
}

async fn read_inputs(files: &[PathBuf]) -> Result<Vec<InputFile>> {
    let mut inputs = Vec::with_capacity(files.len());
    for path in files {
        inputs.push(
            InputFile::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        );
    }
    Ok(inputs)
}

async fn query(vault: &Vault, provider: &str) -> Result<ProviderQuery<ConfiguredCategory>> {
    Ok(vault.provider::<ConfiguredCategory>(provider).await?)
}

async fn import(vault: &Vault, provider: &str, profile: Option<String>, files: &[PathBuf]) -> Result<()> {
    let inputs = read_inputs(files).await?;
    let (worker, handle) = ImportWorker::start(vault.clone(), WorkerConfig::default());
    let job = worker.import(provider, inputs, profile).await?;

    let mut progress = job.progress_receiver();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let fraction = *progress.borrow();
            eprint!("\rimporting: {:>3.0}%", fraction * 100.0);
        }
        eprintln!();
    });

    let report = job.wait().await;
    worker.shutdown().await?;
    let _ = handle.await;
    let _ = reporter.await;

    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.committed {
        anyhow::bail!("no files found in the selected inputs; nothing was imported");
    }
    Ok(())
}

fn file_line(file: &DataFileKey) -> String {
    let status = match (&file.skipped, &file.status) {
        (Some(reason), _) => format!("skipped:{:?}", reason),
        (None, Some(status)) => format!("{:?}", status).to_lowercase(),
        (None, None) => "-".to_string(),
    };
    let errors = if file.errors.is_empty() {
        String::new()
    } else {
        format!(" ({} errors)", file.errors.len())
    };
    format!("{:<12} {}{}", status, file.joined_path(), errors)
}

fn timeline_line(entry: &TimelineEntry<ConfiguredCategory>) -> String {
    let title = entry.context.as_ref().map(|c| c.title.as_str()).unwrap_or("");
    format!(
        "{} {} {:<12} {}",
        entry.key.day, entry.key.slug, entry.key.category.0, title
    )
}

fn entry_json(entry: &TimelineEntry<ConfiguredCategory>) -> Value {
    json!({
        "slug": entry.key.slug,
        "day": entry.key.day,
        "timestamp": entry.key.timestamp,
        "category": entry.key.category,
        "file": entry.file.join("/"),
        "context": entry.context,
        "value": entry.value,
    })
}
