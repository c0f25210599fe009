#![allow(dead_code)]

use artifact_sync::config::SyncConfig;
use artifact_sync::services::coordinator::UploadCoordinator;
use artifact_sync::services::job::{CompletionCallbacks, JobCallbacks, SyncError, SyncReport};
use artifact_sync::services::storage::{DirEntry, LocalStorage, StorageBackend};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::TryStreamExt;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::oneshot;

pub struct Harness {
    pub dir: TempDir,
    pub storage: Arc<LocalStorage>,
    pub coordinator: UploadCoordinator,
    pub config: SyncConfig,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut SyncConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig {
            local_root: dir.path().join("store").display().to_string(),
            staging_dir: dir.path().join("staging").display().to_string(),
            max_concurrent_jobs: 4,
            ..SyncConfig::development()
        };
        tweak(&mut config);

        let storage = Arc::new(LocalStorage::open(&config.local_root).await.unwrap());
        let coordinator = UploadCoordinator::new(storage.clone(), &config);
        Self {
            dir,
            storage,
            coordinator,
            config,
        }
    }

    pub fn store_path(&self, path: &str) -> std::path::PathBuf {
        self.dir.path().join("store").join(path)
    }

    pub fn staging_entries(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("staging"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Deploys `archive` to `destination` and waits for the outcome.
    pub async fn deploy(&self, destination: &str, archive: Vec<u8>) -> Result<SyncReport, SyncError> {
        let (callbacks, rx) = CompletionCallbacks::channel();
        self.coordinator
            .deploy(destination, std::io::Cursor::new(archive), callbacks)
            .await?;
        rx.await.unwrap()
    }

    /// Sorted file paths below `directory`.
    pub async fn files(&self, directory: &str) -> Vec<String> {
        let entries: Vec<DirEntry> = self.storage.enumerate(directory).try_collect().await.unwrap();
        let mut files: Vec<String> = entries
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .map(|entry| entry.path)
            .collect();
        files.sort();
        files
    }

    pub async fn dirs(&self, directory: &str) -> Vec<String> {
        let entries: Vec<DirEntry> = self.storage.enumerate(directory).try_collect().await.unwrap();
        let mut dirs: Vec<String> = entries
            .into_iter()
            .filter(|entry| entry.is_dir)
            .map(|entry| entry.path)
            .collect();
        dirs.sort();
        dirs
    }
}

/// Uncompressed tar with one regular file per `(name, content)` pair.
pub fn tar_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn archive(files: &[(&str, &str)]) -> Vec<u8> {
    gzip(&tar_bytes(files))
}

/// Shared, ordered log of callback events across jobs.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Callbacks that report when a job reaches extraction and then hold it
/// there until released.
pub struct GatedCallbacks {
    name: String,
    log: EventLog,
    refuse: bool,
    reached: Mutex<Option<oneshot::Sender<()>>>,
    gate: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    done: Mutex<Option<oneshot::Sender<Result<SyncReport, SyncError>>>>,
}

pub struct GatedJob {
    pub callbacks: Arc<GatedCallbacks>,
    pub reached: oneshot::Receiver<()>,
    pub release: oneshot::Sender<()>,
    pub done: oneshot::Receiver<Result<SyncReport, SyncError>>,
}

impl GatedJob {
    pub fn new(name: &str, log: &EventLog) -> Self {
        Self::build(name, log, false)
    }

    /// A job whose readiness check fails.
    pub fn refusing(name: &str, log: &EventLog) -> Self {
        Self::build(name, log, true)
    }

    fn build(name: &str, log: &EventLog, refuse: bool) -> Self {
        let (reached_tx, reached) = oneshot::channel();
        let (release, gate) = oneshot::channel();
        let (done_tx, done) = oneshot::channel();
        let callbacks = Arc::new(GatedCallbacks {
            name: name.to_string(),
            log: log.clone(),
            refuse,
            reached: Mutex::new(Some(reached_tx)),
            gate: tokio::sync::Mutex::new(Some(gate)),
            done: Mutex::new(Some(done_tx)),
        });
        Self {
            callbacks,
            reached,
            release,
            done,
        }
    }

    pub fn callbacks(&self) -> Arc<dyn JobCallbacks> {
        self.callbacks.clone()
    }
}

#[async_trait]
impl JobCallbacks for GatedCallbacks {
    async fn on_ready_to_extract(&self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("{} ready", self.name));
        if let Some(reached) = self.reached.lock().unwrap().take() {
            let _ = reached.send(());
        }
        if let Some(gate) = self.gate.lock().await.take() {
            let _ = gate.await;
        }
        if self.refuse {
            anyhow::bail!("{} is locked for maintenance", self.name);
        }
        Ok(())
    }

    async fn on_extraction_finished(&self, outcome: Result<SyncReport, SyncError>) {
        self.log.lock().unwrap().push(format!("{} finished", self.name));
        if let Some(done) = self.done.lock().unwrap().take() {
            let _ = done.send(outcome);
        }
    }
}
