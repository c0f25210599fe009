use crate::services::extractor::ExtractError;
use crate::services::storage::StorageError;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::oneshot;
use utoipa::ToSchema;
use uuid::Uuid;

/// File name of the staged archive inside a job's private staging directory.
pub const ARTIFACT_NAME: &str = "artifact.tar.gz";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Staging error: {0}")]
    Staging(#[source] std::io::Error),

    #[error("Destination not ready: {0:#}")]
    NotReady(anyhow::Error),

    #[error(transparent)]
    Extraction(#[from] ExtractError),

    #[error("Reconciliation failed: {0}")]
    Reconciliation(#[source] StorageError),

    #[error("Job aborted: {0}")]
    Aborted(String),
}

/// Outcome of a successful job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SyncReport {
    /// Files written from the archive
    pub written: usize,
    /// Stale files removed from the destination
    pub removed: usize,
    /// Stale files that could not be removed
    pub failed_deletes: usize,
}

/// Result of submitting a committed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Started,
    Queued { behind: String },
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Started => "started",
            Admission::Queued { .. } => "queued",
        }
    }
}

/// Hooks invoked around the processing of an admitted job.
#[async_trait]
pub trait JobCallbacks: Send + Sync {
    /// Called right before extraction. An error skips extraction and
    /// reconciliation and is reported through `on_extraction_finished`.
    async fn on_ready_to_extract(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called exactly once per admitted job.
    async fn on_extraction_finished(&self, outcome: Result<SyncReport, SyncError>);
}

/// Fire-and-forget callbacks; the coordinator already logs the outcome.
pub struct DetachedCallbacks;

#[async_trait]
impl JobCallbacks for DetachedCallbacks {
    async fn on_extraction_finished(&self, _outcome: Result<SyncReport, SyncError>) {}
}

/// Hands the outcome to whoever holds the matching receiver.
pub struct CompletionCallbacks {
    sender: Mutex<Option<oneshot::Sender<Result<SyncReport, SyncError>>>>,
}

impl CompletionCallbacks {
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<Result<SyncReport, SyncError>>) {
        let (tx, rx) = oneshot::channel();
        let callbacks = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
        });
        (callbacks, rx)
    }
}

#[async_trait]
impl JobCallbacks for CompletionCallbacks {
    async fn on_extraction_finished(&self, outcome: Result<SyncReport, SyncError>) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The waiting caller may have gone away.
            let _ = sender.send(outcome);
        }
    }
}

/// One request to replace a destination subtree with an archive's content.
/// Owns its staging directory; dropping the job removes it.
pub struct UploadJob {
    pub id: Uuid,
    pub destination_dir: String,
    pub(crate) staging: TempDir,
    pub(crate) callbacks: Arc<dyn JobCallbacks>,
}

impl UploadJob {
    pub fn archive_path(&self) -> PathBuf {
        self.staging.path().join(ARTIFACT_NAME)
    }
}

impl std::fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadJob")
            .field("id", &self.id)
            .field("destination_dir", &self.destination_dir)
            .field("staging", &self.staging.path())
            .finish()
    }
}
