use crate::services::storage::{ContentReader, StorageBackend, StorageError};
use crate::utils::path::{has_parent_segment, join_path};
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::collections::BTreeSet;
use std::io::{self, Read};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// Size of the chunks forwarded from the decoder to a backend write.
const PUMP_CHUNK_SIZE: usize = 64 * 1024;
/// Chunks buffered between the decoder thread and the backend write.
const PUMP_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to decode archive: {0}")]
    Decode(#[source] io::Error),

    #[error("Failed to encode archive: {0}")]
    Encode(#[source] io::Error),

    #[error("Malformed archive entry `{name}`: {reason}")]
    MalformedEntry { name: String, reason: &'static str },

    #[error("Failed to store `{path}`: {source}")]
    Storage {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("Archive task failed: {0}")]
    Task(String),
}

/// Extraction stopped at the first fatal error. `written` holds the entries
/// stored before that point; it is not the archive's full file set.
#[derive(Debug, Error)]
#[error("Extraction aborted after {} file(s): {source}", .written.len())]
pub struct ExtractError {
    pub written: BTreeSet<String>,
    #[source]
    pub source: ArchiveError,
}

/// Replays a gzip-compressed tar stream as writes against a storage backend.
#[derive(Clone)]
pub struct ArchiveExtractor {
    storage: Arc<dyn StorageBackend>,
}

impl ArchiveExtractor {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Writes every regular file of `archive` below `destination` and returns
    /// the relative names written. Directory entries are skipped, other entry
    /// types ignored.
    pub async fn extract<R>(
        &self,
        destination: &str,
        archive: R,
    ) -> Result<BTreeSet<String>, ExtractError>
    where
        R: Read + Send + 'static,
    {
        let handle = Handle::current();
        let storage = Arc::clone(&self.storage);
        let destination = destination.to_string();

        tokio::task::spawn_blocking(move || {
            let mut written = BTreeSet::new();
            match replay_entries(&handle, storage, &destination, archive, &mut written) {
                Ok(()) => Ok(written),
                Err(source) => Err(ExtractError { written, source }),
            }
        })
        .await
        .unwrap_or_else(|e| {
            Err(ExtractError {
                written: BTreeSet::new(),
                source: ArchiveError::Task(e.to_string()),
            })
        })
    }
}

fn replay_entries<R: Read>(
    handle: &Handle,
    storage: Arc<dyn StorageBackend>,
    destination: &str,
    archive: R,
    written: &mut BTreeSet<String>,
) -> Result<(), ArchiveError> {
    let mut archive = tar::Archive::new(GzDecoder::new(archive));

    for entry in archive.entries().map_err(ArchiveError::Decode)? {
        let mut entry = entry.map_err(ArchiveError::Decode)?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            continue;
        }
        if !entry_type.is_file() {
            tracing::debug!("Ignoring archive entry of type {:?}", entry_type);
            continue;
        }

        let name = entry_name(&entry)?;
        let size = entry.size();
        let target = storage.join_path(&[destination, &name]);

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(PUMP_DEPTH);
        let writer = {
            let storage = Arc::clone(&storage);
            let target = target.clone();
            handle.spawn(async move { storage.write(&target, size, channel_reader(rx)).await })
        };

        let pumped = pump(&mut entry, &tx);
        drop(tx);
        let stored = handle.block_on(writer);

        pumped.map_err(ArchiveError::Decode)?;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(ArchiveError::Storage { path: target, source }),
            Err(e) => return Err(ArchiveError::Task(e.to_string())),
        }

        tracing::debug!("Extracted {} ({} bytes)", name, size);
        written.insert(name);
    }

    Ok(())
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String, ArchiveError> {
    let raw = entry
        .path()
        .map_err(ArchiveError::Decode)?
        .to_string_lossy()
        .replace('\\', "/");

    if has_parent_segment(&raw) {
        return Err(ArchiveError::MalformedEntry {
            name: raw,
            reason: "path escapes the destination",
        });
    }

    let name = join_path(&[raw.trim_start_matches('/')]);
    if name.is_empty() {
        return Err(ArchiveError::MalformedEntry {
            name: raw,
            reason: "empty file name",
        });
    }
    Ok(name)
}

/// Forward-only reader over the chunks produced by `pump`.
fn channel_reader(rx: mpsc::Receiver<io::Result<Bytes>>) -> ContentReader {
    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Box::new(StreamReader::new(Box::pin(chunks)))
}

/// Copies one entry's content into the channel. A closed channel means the
/// backend write already gave up; its own error is reported instead.
fn pump(entry: &mut impl Read, tx: &mpsc::Sender<io::Result<Bytes>>) -> io::Result<()> {
    let mut buffer = vec![0u8; PUMP_CHUNK_SIZE];
    loop {
        let n = match entry.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
                return Err(e);
            }
        };
        if tx
            .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n])))
            .is_err()
        {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::LocalStorage;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[tokio::test]
    async fn test_extracts_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        let extractor = ArchiveExtractor::new(storage);

        let bytes = archive(&[("index.html", "<html/>"), ("./assets/app.js", "js")]);
        let written = extractor
            .extract("site", std::io::Cursor::new(bytes))
            .await
            .unwrap();

        assert_eq!(
            written.into_iter().collect::<Vec<_>>(),
            vec!["assets/app.js".to_string(), "index.html".to_string()]
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("site/assets/app.js")).unwrap(),
            "js"
        );
    }

    #[tokio::test]
    async fn test_skips_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        let extractor = ArchiveExtractor::new(storage);

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "empty/", std::io::empty())
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let written = extractor
            .extract("site", std::io::Cursor::new(bytes))
            .await
            .unwrap();
        assert!(written.is_empty());
        assert!(!dir.path().join("site/empty").exists());
    }

    #[tokio::test]
    async fn test_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        let extractor = ArchiveExtractor::new(storage);

        // The tar builder refuses `..`, so patch the name into the header directly.
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..13].copy_from_slice(b"../escape.txt");
        header.set_size(1);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"x"[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let err = extractor
            .extract("site", std::io::Cursor::new(bytes))
            .await
            .unwrap_err();
        assert!(matches!(err.source, ArchiveError::MalformedEntry { .. }));
        assert!(err.written.is_empty());
    }

    #[tokio::test]
    async fn test_not_gzip_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        let extractor = ArchiveExtractor::new(storage);

        let err = extractor
            .extract("site", std::io::Cursor::new(b"definitely not gzip".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err.source, ArchiveError::Decode(_)));
    }
}
