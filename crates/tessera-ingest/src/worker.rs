//! Background import worker.
//! Runs imports, resets and profile scans on a dedicated task so a long
//! archive expansion never blocks readers. Jobs run one at a time in
//! submission order.

use std::sync::Arc;

use tessera_store::ResetOutcome;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::ingest::{ImportReport, InputFile, ProgressFn};
use crate::vault::Vault;

/// A unit of work for the import worker.
pub enum Job {
    /// Import files for a provider.
    Import {
        /// Job id
        id: Uuid,
        /// Provider slug
        provider: String,
        /// Inputs to expand
        inputs: Vec<InputFile>,
        /// Selected profile
        profile: Option<String>,
        /// Fraction done
        progress: watch::Sender<f64>,
        /// Result
        reply: oneshot::Sender<IngestResult<ImportReport>>,
    },
    /// Erase a provider.
    Reset {
        /// Job id
        id: Uuid,
        /// Provider slug
        provider: String,
        /// Result
        reply: oneshot::Sender<IngestResult<ResetOutcome>>,
    },
    /// List the profiles in an export.
    ListProfiles {
        /// Job id
        id: Uuid,
        /// Provider slug
        provider: String,
        /// Inputs to scan
        inputs: Vec<InputFile>,
        /// Result
        reply: oneshot::Sender<IngestResult<Vec<String>>>,
    },
    /// Stop after the jobs already queued.
    Shutdown,
}

/// A submitted job: its id, live progress and eventual result.
pub struct JobHandle<T> {
    /// Job id
    pub id: Uuid,
    progress: watch::Receiver<f64>,
    reply: oneshot::Receiver<IngestResult<T>>,
}

impl<T> JobHandle<T> {
    /// Latest reported fraction.
    pub fn progress(&self) -> f64 {
        *self.progress.borrow()
    }

    /// A receiver that can be awaited for progress changes.
    pub fn progress_receiver(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    /// Waits for the job to finish.
    pub async fn wait(self) -> IngestResult<T> {
        self.reply.await.map_err(|_| IngestError::WorkerClosed)?
    }
}

/// Configuration for the import worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs that may wait in the queue
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { channel_capacity: 16 }
    }
}

/// Sends jobs to the worker task.
#[derive(Clone)]
pub struct ImportWorker {
    sender: mpsc::Sender<Job>,
}

impl ImportWorker {
    /// Starts the worker over `vault`.
    pub fn start(vault: Vault, config: WorkerConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let handle = tokio::spawn(run(vault, rx));
        (Self { sender: tx }, handle)
    }

    async fn send(&self, job: Job) -> IngestResult<()> {
        self.sender.send(job).await.map_err(|_| IngestError::WorkerClosed)
    }

    /// Queues an import.
    pub async fn import(
        &self,
        provider: impl Into<String>,
        inputs: Vec<InputFile>,
        profile: Option<String>,
    ) -> IngestResult<JobHandle<ImportReport>> {
        let id = Uuid::new_v4();
        let (progress, progress_rx) = watch::channel(0.0);
        let (reply, reply_rx) = oneshot::channel();
        self.send(Job::Import {
            id,
            provider: provider.into(),
            inputs,
            profile,
            progress,
            reply,
        })
        .await?;
        Ok(JobHandle {
            id,
            progress: progress_rx,
            reply: reply_rx,
        })
    }

    /// Queues a provider reset.
    pub async fn reset(&self, provider: impl Into<String>) -> IngestResult<JobHandle<ResetOutcome>> {
        let id = Uuid::new_v4();
        let (_, progress_rx) = watch::channel(0.0);
        let (reply, reply_rx) = oneshot::channel();
        self.send(Job::Reset {
            id,
            provider: provider.into(),
            reply,
        })
        .await?;
        Ok(JobHandle {
            id,
            progress: progress_rx,
            reply: reply_rx,
        })
    }

    /// Queues a profile scan.
    pub async fn list_profiles(
        &self,
        provider: impl Into<String>,
        inputs: Vec<InputFile>,
    ) -> IngestResult<JobHandle<Vec<String>>> {
        let id = Uuid::new_v4();
        let (_, progress_rx) = watch::channel(0.0);
        let (reply, reply_rx) = oneshot::channel();
        self.send(Job::ListProfiles {
            id,
            provider: provider.into(),
            inputs,
            reply,
        })
        .await?;
        Ok(JobHandle {
            id,
            progress: progress_rx,
            reply: reply_rx,
        })
    }

    /// Asks the worker to stop once queued jobs are done.
    pub async fn shutdown(&self) -> IngestResult<()> {
        self.send(Job::Shutdown).await
    }

    /// Whether the worker task is still accepting jobs.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

async fn run(vault: Vault, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Import {
                id,
                provider,
                inputs,
                profile,
                progress,
                reply,
            } => {
                debug!(%id, %provider, "import job started");
                let progress = Arc::new(progress);
                let sink = progress.clone();
                let on_progress: ProgressFn = Arc::new(move |f: f64| {
                    sink.send_replace(f.clamp(0.0, 1.0));
                });
                let result = vault.import_files(&provider, inputs, profile, Some(on_progress)).await;
                match &result {
                    Ok(report) => {
                        progress.send_replace(1.0);
                        info!(%id, %provider, files = report.files, "import job finished");
                    }
                    Err(e) => warn!(%id, %provider, error = %e, "import job failed"),
                }
                let _ = reply.send(result);
            }
            Job::Reset { id, provider, reply } => {
                debug!(%id, %provider, "reset job started");
                let _ = reply.send(vault.reset_provider(&provider).await);
            }
            Job::ListProfiles {
                id,
                provider,
                inputs,
                reply,
            } => {
                debug!(%id, %provider, "profile scan started");
                let _ = reply.send(vault.list_profiles(&provider, inputs).await);
            }
            Job::Shutdown => break,
        }
    }
    debug!("import worker stopped");
}
