use crate::services::extractor::ArchiveError;
use crate::services::storage::{DirEntry, StorageBackend};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::TryStreamExt;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;

/// Streams `directory` as a gzip-compressed tar into `writer`, the inverse of
/// extraction. Entry names are relative to `directory`. Returns the number of
/// files archived.
pub async fn compress_dir<W>(
    storage: Arc<dyn StorageBackend>,
    directory: &str,
    writer: W,
) -> Result<usize, ArchiveError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut entries: Vec<DirEntry> = storage
        .enumerate(directory)
        .try_collect()
        .await
        .map_err(|source| ArchiveError::Storage {
            path: directory.to_string(),
            source,
        })?;
    entries.sort();

    let handle = Handle::current();
    let directory = directory.to_string();

    tokio::task::spawn_blocking(move || write_archive(&handle, storage, &directory, entries, writer))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
}

fn write_archive<W>(
    handle: &Handle,
    storage: Arc<dyn StorageBackend>,
    directory: &str,
    entries: Vec<DirEntry>,
    writer: W,
) -> Result<usize, ArchiveError>
where
    W: AsyncWrite + Unpin + Send,
{
    let sink = SyncIoBridge::new_with_handle(writer, handle.clone());
    let mut builder = tar::Builder::new(GzEncoder::new(sink, Compression::default()));
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;

    let mut files = 0;

    for entry in &entries {
        if entry.is_dir {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_mtime(mtime);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{}/", entry.path), std::io::empty())
                .map_err(ArchiveError::Encode)?;
            continue;
        }

        let path = storage.join_path(&[directory, &entry.path]);
        let storage_err = |source| ArchiveError::Storage {
            path: path.clone(),
            source,
        };

        let size = handle
            .block_on(storage.file_size(&path))
            .map_err(storage_err)?;
        let content = handle.block_on(storage.read(&path)).map_err(storage_err)?;

        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                &entry.path,
                SyncIoBridge::new_with_handle(content, handle.clone()),
            )
            .map_err(ArchiveError::Encode)?;
        files += 1;
    }

    let mut sink = builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(ArchiveError::Encode)?;
    sink.flush().map_err(ArchiveError::Encode)?;
    sink.shutdown().map_err(ArchiveError::Encode)?;

    tracing::debug!("Archived {} file(s) from {}", files, directory);
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::extractor::ArchiveExtractor;
    use crate::services::storage::{ContentReader, LocalStorage};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_backup_extracts_to_same_tree() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        for (path, content) in [("site/index.html", "<html/>"), ("site/a/b/c.txt", "deep")] {
            let reader: ContentReader = Box::new(std::io::Cursor::new(content.as_bytes().to_vec()));
            storage.write(path, content.len() as u64, reader).await.unwrap();
        }

        let (writer, mut reader) = tokio::io::duplex(4096);
        let backup = tokio::spawn(compress_dir(storage.clone(), "site", writer));
        let mut archive = Vec::new();
        reader.read_to_end(&mut archive).await.unwrap();
        assert_eq!(backup.await.unwrap().unwrap(), 2);

        let written = ArchiveExtractor::new(storage)
            .extract("copy", std::io::Cursor::new(archive))
            .await
            .unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("copy/a/b/c.txt")).unwrap(),
            "deep"
        );
    }

    #[tokio::test]
    async fn test_backup_of_missing_directory_is_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path()).await.unwrap());

        let (writer, mut reader) = tokio::io::duplex(4096);
        let backup = tokio::spawn(compress_dir(storage.clone(), "nothing", writer));
        let mut archive = Vec::new();
        reader.read_to_end(&mut archive).await.unwrap();
        assert_eq!(backup.await.unwrap().unwrap(), 0);

        let written = ArchiveExtractor::new(storage)
            .extract("copy", std::io::Cursor::new(archive))
            .await
            .unwrap();
        assert!(written.is_empty());
    }
}
