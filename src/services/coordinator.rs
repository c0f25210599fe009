//! Admission and scheduling of archive deployment jobs.
//!
//! A job holds a *scope* (its normalized destination directory) for the whole
//! of its processing. Jobs whose destination overlaps a held scope, in either
//! direction, wait in that scope's queue and are resubmitted once the holder
//! finishes. Unrelated destinations run concurrently, bounded by
//! `max_concurrent_jobs`.

use crate::config::SyncConfig;
use crate::services::extractor::ArchiveExtractor;
use crate::services::job::{
    ARTIFACT_NAME, Admission, JobCallbacks, SyncError, SyncReport, UploadJob,
};
use crate::services::reconcile::ReconciliationEngine;
use crate::services::storage::StorageBackend;
use crate::utils::path::{scope_key, scopes_overlap};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{Notify, Semaphore};
use tracing::Instrument;
use uuid::Uuid;

/// Returned (wrapped in an `io::Error`) when a staging write would exceed
/// `max_archive_size`.
#[derive(Debug, thiserror::Error)]
#[error("Archive exceeds the maximum size of {limit} bytes")]
pub struct ArchiveTooLarge {
    pub limit: u64,
}

/// Held while a job runs against a destination subtree.
struct ScopeLock {
    destination_prefix: String,
    queued_jobs: Vec<UploadJob>,
}

#[derive(Default)]
struct ScopeTable {
    locks: HashMap<String, ScopeLock>,
}

impl ScopeTable {
    /// The lock a job for `destination` has to wait behind. Jobs already
    /// waiting count too, so a newcomer never overtakes an earlier job it
    /// overlaps.
    fn overlapping_mut(&mut self, destination: &str) -> Option<&mut ScopeLock> {
        self.locks.values_mut().find(|lock| {
            scopes_overlap(&lock.destination_prefix, destination)
                || lock
                    .queued_jobs
                    .iter()
                    .any(|job| scopes_overlap(&job.destination_dir, destination))
        })
    }

    fn queued(&self) -> usize {
        self.locks.values().map(|lock| lock.queued_jobs.len()).sum()
    }
}

struct CoordinatorInner {
    staging_root: PathBuf,
    max_archive_size: u64,
    extractor: ArchiveExtractor,
    reconciler: ReconciliationEngine,
    scopes: Mutex<ScopeTable>,
    permits: Semaphore,
    idle: Notify,
}

/// Accepts archive uploads and drives them through extraction and
/// reconciliation, serializing jobs with overlapping destinations.
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl UploadCoordinator {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                staging_root: PathBuf::from(&config.staging_dir),
                max_archive_size: config.max_archive_size,
                extractor: ArchiveExtractor::new(Arc::clone(&storage)),
                reconciler: ReconciliationEngine::new(storage),
                scopes: Mutex::new(ScopeTable::default()),
                permits: Semaphore::new(config.max_concurrent_jobs.max(1)),
                idle: Notify::new(),
            }),
        }
    }

    /// Allocates a private staging directory and returns a sink bound to a
    /// new job for `destination_dir`. Sibling staging directories are never
    /// touched.
    pub async fn open_staging_sink(
        &self,
        destination_dir: &str,
        callbacks: Arc<dyn JobCallbacks>,
    ) -> Result<StagingSink, SyncError> {
        let root = &self.inner.staging_root;
        fs::create_dir_all(root).await.map_err(SyncError::Staging)?;

        let staging = tempfile::Builder::new()
            .prefix("upload-")
            .tempdir_in(root)
            .map_err(SyncError::Staging)?;
        let file = fs::File::create(staging.path().join(ARTIFACT_NAME))
            .await
            .map_err(SyncError::Staging)?;

        let job = UploadJob {
            id: Uuid::new_v4(),
            destination_dir: scope_key(destination_dir),
            staging,
            callbacks,
        };
        tracing::debug!(job_id = %job.id, "Opened staging sink at {}", job.staging.path().display());

        Ok(StagingSink {
            coordinator: Arc::clone(&self.inner),
            job,
            file: BufWriter::new(file),
            written: 0,
        })
    }

    /// Stages everything `reader` yields and commits the job.
    pub async fn deploy<R>(
        &self,
        destination_dir: &str,
        mut reader: R,
        callbacks: Arc<dyn JobCallbacks>,
    ) -> Result<Admission, SyncError>
    where
        R: AsyncRead + Unpin,
    {
        let mut sink = self.open_staging_sink(destination_dir, callbacks).await?;
        if let Err(e) = tokio::io::copy(&mut reader, &mut sink).await {
            sink.abort().await;
            return Err(SyncError::Staging(e));
        }
        sink.commit().await
    }

    /// Destinations currently held by a running job.
    pub fn active_scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.inner.lock_scopes().locks.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Jobs waiting behind a running job.
    pub fn queued_jobs(&self) -> usize {
        self.inner.lock_scopes().queued()
    }

    /// Resolves once no job is running or queued.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.lock_scopes().locks.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Removes staging entries older than `max_age`. Meant for startup,
    /// before any sink is opened; directories of live jobs are never this old
    /// at that point.
    pub async fn purge_stale_staging(&self, max_age: Duration) -> io::Result<usize> {
        let root = &self.inner.staging_root;
        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut purged = 0;

        while let Some(entry) = entries.next_entry().await? {
            let modified = entry.metadata().await?.modified()?;
            if modified > cutoff {
                continue;
            }
            let path = entry.path();
            let removed = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match removed {
                Ok(()) => purged += 1,
                Err(e) => tracing::warn!("Failed to purge staging entry {}: {}", path.display(), e),
            }
        }

        if purged > 0 {
            tracing::info!("🧹 Purged {} stale staging entr(ies)", purged);
        }
        Ok(purged)
    }
}

impl CoordinatorInner {
    fn lock_scopes(&self) -> MutexGuard<'_, ScopeTable> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts `job` now or parks it behind the in-flight scope it overlaps.
    fn submit(self: &Arc<Self>, job: UploadJob) -> Admission {
        let admitted = admit(&mut self.lock_scopes(), job);
        match admitted {
            Admitted::Run(job) => {
                self.start(job);
                Admission::Started
            }
            Admitted::Parked(behind) => Admission::Queued { behind },
        }
    }

    fn start(self: &Arc<Self>, job: UploadJob) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.process(job).await });
    }

    async fn process(self: Arc<Self>, job: UploadJob) {
        let span = tracing::info_span!(
            "sync_job",
            job_id = %job.id,
            destination = %job.destination_dir
        );

        async move {
            let scope = ScopeRelease {
                inner: Arc::clone(&self),
                destination: job.destination_dir.clone(),
            };

            let outcome = AssertUnwindSafe(async {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| SyncError::Aborted("job scheduler closed".to_string()))?;
                self.run(&job).await
            })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(SyncError::Aborted(format!(
                    "job panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

            match &outcome {
                Ok(report) => tracing::info!(
                    "✅ Deployed '{}': {} written, {} removed",
                    job.destination_dir,
                    report.written,
                    report.removed
                ),
                Err(e) => tracing::error!("❌ Deployment to '{}' failed: {}", job.destination_dir, e),
            }

            job.callbacks.on_extraction_finished(outcome).await;

            if let Err(e) = job.staging.close() {
                tracing::warn!("Failed to remove staging directory: {}", e);
            }
            drop(scope);
        }
        .instrument(span)
        .await
    }

    async fn run(&self, job: &UploadJob) -> Result<SyncReport, SyncError> {
        job.callbacks
            .on_ready_to_extract()
            .await
            .map_err(SyncError::NotReady)?;

        let archive = fs::File::open(job.archive_path())
            .await
            .map_err(SyncError::Staging)?
            .into_std()
            .await;

        let written = self
            .extractor
            .extract(&job.destination_dir, archive)
            .await?;

        let reconciled = self
            .reconciler
            .reconcile(&job.destination_dir, &written)
            .await
            .map_err(SyncError::Reconciliation)?;

        Ok(SyncReport {
            written: written.len(),
            removed: reconciled.removed.len(),
            failed_deletes: reconciled.failed.len(),
        })
    }

    /// Drops the scope held for `destination` and readmits its waiters in
    /// arrival order, before any later submission can claim the scope.
    fn release(self: &Arc<Self>, destination: &str) {
        let mut scopes = self.lock_scopes();
        let queued = scopes
            .locks
            .remove(destination)
            .map(|lock| lock.queued_jobs)
            .unwrap_or_default();

        let runnable: Vec<UploadJob> = queued
            .into_iter()
            .filter_map(|job| match admit(&mut scopes, job) {
                Admitted::Run(job) => Some(job),
                Admitted::Parked(_) => None,
            })
            .collect();
        let idle = scopes.locks.is_empty();
        drop(scopes);

        for job in runnable {
            self.start(job);
        }
        if idle {
            self.idle.notify_waiters();
        }
    }
}

/// Gives a running job's scope back when dropped, so a job whose task
/// unwinds still readmits the jobs waiting behind it.
struct ScopeRelease {
    inner: Arc<CoordinatorInner>,
    destination: String,
}

impl Drop for ScopeRelease {
    fn drop(&mut self) {
        self.inner.release(&self.destination);
    }
}

fn panic_message<'a>(payload: &'a (dyn Any + Send + 'static)) -> &'a str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

enum Admitted {
    Run(UploadJob),
    Parked(String),
}

/// Parks `job` behind an overlapping scope, or claims a new scope for it.
fn admit(scopes: &mut ScopeTable, job: UploadJob) -> Admitted {
    if let Some(lock) = scopes.overlapping_mut(&job.destination_dir) {
        let behind = lock.destination_prefix.clone();
        tracing::info!(
            job_id = %job.id,
            "⏳ Queued deployment to '{}' behind '{}'",
            job.destination_dir,
            behind
        );
        lock.queued_jobs.push(job);
        return Admitted::Parked(behind);
    }

    scopes.locks.insert(
        job.destination_dir.clone(),
        ScopeLock {
            destination_prefix: job.destination_dir.clone(),
            queued_jobs: Vec::new(),
        },
    );
    Admitted::Run(job)
}

/// Write side of a job's staging artifact.
///
/// Dropping an uncommitted sink discards the artifact, like `abort`.
pub struct StagingSink {
    coordinator: Arc<CoordinatorInner>,
    job: UploadJob,
    file: BufWriter<fs::File>,
    written: u64,
}

impl StagingSink {
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn destination(&self) -> &str {
        &self.job.destination_dir
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Persists the artifact and submits the job for admission.
    pub async fn commit(mut self) -> Result<Admission, SyncError> {
        self.file.flush().await.map_err(SyncError::Staging)?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(SyncError::Staging)?;

        let StagingSink {
            coordinator,
            job,
            file,
            written,
        } = self;
        drop(file);

        tracing::info!(
            job_id = %job.id,
            "📦 Staged {} bytes for '{}'",
            written,
            job.destination_dir
        );
        Ok(coordinator.submit(job))
    }

    /// Discards the artifact; no job is submitted.
    pub async fn abort(self) {
        let StagingSink { job, file, .. } = self;
        drop(file);
        tracing::debug!(job_id = %job.id, "Aborted staging for '{}'", job.destination_dir);
        if let Err(e) = job.staging.close() {
            tracing::warn!("Failed to remove staging directory: {}", e);
        }
    }
}

impl AsyncWrite for StagingSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let limit = this.coordinator.max_archive_size;
        if this.written + buf.len() as u64 > limit {
            return Poll::Ready(Err(io::Error::other(ArchiveTooLarge { limit })));
        }
        let n = ready!(Pin::new(&mut this.file).poll_write(cx, buf))?;
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}
