use crate::services::storage::{StorageBackend, StorageError};
use crate::utils::path::is_within;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Deletes destination content that the latest archive no longer contains.
#[derive(Clone)]
pub struct ReconciliationEngine {
    storage: Arc<dyn StorageBackend>,
}

impl ReconciliationEngine {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Removes every file below `destination` whose relative path is not in
    /// `keep`, then every directory no kept file lives in. A directory still
    /// holding a file that failed to delete is left in place.
    ///
    /// The listing is read to the end before anything is deleted, so an
    /// enumeration error leaves the destination untouched. Individual delete
    /// failures are logged and reported, not fatal.
    pub async fn reconcile(
        &self,
        destination: &str,
        keep: &BTreeSet<String>,
    ) -> Result<ReconcileReport, StorageError> {
        let mut stale_files = Vec::new();
        let mut stale_dirs = Vec::new();

        let mut entries = self.storage.enumerate(destination);
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if entry.is_dir {
                if !keep.iter().any(|kept| is_within(kept, &entry.path)) {
                    stale_dirs.push(entry.path);
                }
            } else if !keep.contains(&entry.path) {
                stale_files.push(entry.path);
            }
        }
        drop(entries);

        let mut report = ReconcileReport::default();

        for relative in stale_files {
            let path = self.storage.join_path(&[destination, &relative]);
            match self.storage.delete_file(&path).await {
                Ok(()) => {
                    tracing::debug!("Removed stale file {}", path);
                    report.removed.push(relative);
                }
                Err(e) => {
                    tracing::warn!("Failed to remove stale file {}: {}", path, e);
                    report.failed.push(relative);
                }
            }
        }

        // Shallowest first; a removed directory takes its subdirectories along.
        stale_dirs.sort_by_key(|dir| dir.matches('/').count());
        let mut removed_dirs: Vec<String> = Vec::new();
        for relative in stale_dirs {
            if removed_dirs.iter().any(|done| is_within(&relative, done))
                || report.failed.iter().any(|failed| is_within(failed, &relative))
            {
                continue;
            }
            let path = self.storage.join_path(&[destination, &relative]);
            match self.storage.delete_directory(&path).await {
                Ok(()) => removed_dirs.push(relative),
                Err(e) => tracing::warn!("Failed to remove stale directory {}: {}", path, e),
            }
        }

        if !report.removed.is_empty() || !removed_dirs.is_empty() {
            tracing::info!(
                "🧹 Reconciled {}: removed {} file(s), {} dir(s), {} failure(s)",
                destination,
                report.removed.len(),
                removed_dirs.len(),
                report.failed.len()
            );
        }

        Ok(report)
    }
}
