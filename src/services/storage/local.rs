use super::{ContentReader, DirEntry, EntryStream, StorageBackend, StorageError, io_err};
use crate::utils::path::{has_parent_segment, join_path};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Stores destination trees below a directory on the local disk.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the root directory if it does not exist yet.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let storage = Self::new(root);
        fs::create_dir_all(&storage.root)
            .await
            .map_err(|e| io_err(storage.root.display().to_string(), e))?;
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        if has_parent_segment(path) {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        let relative = join_path(&[path]);
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(relative))
        }
    }

    fn walk<'a>(
        &'a self,
        directory: &'a str,
    ) -> impl Stream<Item = Result<DirEntry, StorageError>> + Send + 'a {
        try_stream! {
            let base = self.resolve(directory)?;
            let mut pending = vec![base.clone()];

            while let Some(dir) = pending.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == ErrorKind::NotFound && dir == base => break,
                    Err(e) => Err(io_err(dir.display().to_string(), e))?,
                };

                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| io_err(dir.display().to_string(), e))?
                {
                    let path = entry.path();
                    let file_type = entry
                        .file_type()
                        .await
                        .map_err(|e| io_err(path.display().to_string(), e))?;

                    if file_type.is_dir() {
                        pending.push(path.clone());
                    } else if is_partial(&entry.file_name().to_string_lossy()) {
                        continue;
                    }

                    yield DirEntry {
                        path: relative_to(&base, &path),
                        is_dir: file_type.is_dir(),
                    };
                }
            }
        }
    }
}

const PARTIAL_SUFFIX: &str = ".partial";

/// In-flight writes live next to their target as `.<name>.<uuid>.partial`.
fn is_partial(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(PARTIAL_SUFFIX)
}

fn relative_to(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn write(
        &self,
        path: &str,
        size_hint: u64,
        mut reader: ContentReader,
    ) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent.display().to_string(), e))?;
        }

        // Stream into a sibling first so readers never observe a half-written file.
        let partial = target.with_file_name(format!(
            ".{}.{}{}",
            file_name,
            Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));
        let mut file = fs::File::create(&partial)
            .await
            .map_err(|e| io_err(partial.display().to_string(), e))?;

        let copied = match tokio::io::copy(&mut reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&partial).await;
                return Err(io_err(path, e));
            }
        };

        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = synced {
            let _ = fs::remove_file(&partial).await;
            return Err(io_err(path, e));
        }

        if let Err(e) = fs::rename(&partial, &target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(io_err(path, e));
        }

        tracing::debug!(path, bytes = copied, size_hint, "stored file");
        Ok(())
    }

    fn enumerate<'a>(&'a self, directory: &'a str) -> EntryStream<'a> {
        Box::pin(self.walk(directory))
    }

    async fn read(&self, path: &str) -> Result<ContentReader, StorageError> {
        let target = self.resolve(path)?;
        let file = fs::File::open(&target).await.map_err(|e| io_err(path, e))?;
        Ok(Box::new(file))
    }

    async fn file_size(&self, path: &str) -> Result<u64, StorageError> {
        let target = self.resolve(path)?;
        let metadata = fs::metadata(&target).await.map_err(|e| io_err(path, e))?;
        Ok(metadata.len())
    }

    async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        fs::remove_file(&target).await.map_err(|e| io_err(path, e))
    }

    async fn delete_directory(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match fs::remove_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tokio::io::AsyncReadExt;

    async fn write_text(storage: &LocalStorage, path: &str, text: &str) {
        let reader: ContentReader = Box::new(std::io::Cursor::new(text.as_bytes().to_vec()));
        storage
            .write(path, text.len() as u64, reader)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();

        write_text(&storage, "site/assets/app.js", "first").await;
        write_text(&storage, "site/assets/app.js", "second").await;

        let content = std::fs::read_to_string(dir.path().join("site/assets/app.js")).unwrap();
        assert_eq!(content, "second");
        assert_eq!(storage.file_size("site/assets/app.js").await.unwrap(), 6);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("site/assets"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["app.js".to_string()]);
    }

    #[tokio::test]
    async fn test_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();
        write_text(&storage, "/compressDir/test2.txt", "test2").await;

        let mut reader = storage.read("compressDir/test2.txt").await.unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "test2");
    }

    #[tokio::test]
    async fn test_enumerate_lists_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();
        write_text(&storage, "compressDir/test.txt", "test").await;
        write_text(&storage, "compressDir/subDir/test3.txt", "test3").await;
        write_text(&storage, "other/ignored.txt", "x").await;

        let mut entries: Vec<DirEntry> = storage
            .enumerate("compressDir")
            .try_collect()
            .await
            .unwrap();
        entries.sort();

        assert_eq!(
            entries,
            vec![
                DirEntry { path: "subDir".into(), is_dir: true },
                DirEntry { path: "subDir/test3.txt".into(), is_dir: false },
                DirEntry { path: "test.txt".into(), is_dir: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_enumerate_skips_in_flight_writes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();
        write_text(&storage, "site/app.js", "done").await;
        std::fs::write(
            dir.path().join("site/.index.html.0f8e2b7c.partial"),
            "half",
        )
        .unwrap();

        let entries: Vec<DirEntry> = storage.enumerate("site").try_collect().await.unwrap();
        assert_eq!(
            entries,
            vec![DirEntry { path: "app.js".into(), is_dir: false }]
        );
    }

    #[tokio::test]
    async fn test_enumerate_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();
        let entries: Vec<DirEntry> = storage.enumerate("nope").try_collect().await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();
        write_text(&storage, "a/b/c.txt", "c").await;
        write_text(&storage, "a/d.txt", "d").await;

        storage.delete_file("a/d.txt").await.unwrap();
        assert!(matches!(
            storage.delete_file("a/d.txt").await,
            Err(StorageError::NotFound(_))
        ));

        storage.delete_directory("a").await.unwrap();
        storage.delete_directory("a").await.unwrap();
        assert!(!dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_rejects_parent_segments() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();
        let reader: ContentReader = Box::new(std::io::Cursor::new(b"x".to_vec()));
        let result = storage.write("../escape.txt", 1, reader).await;
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));
    }
}
