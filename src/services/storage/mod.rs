use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod local;
pub mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

/// Forward-only content handed to and returned by a backend. It cannot be
/// rewound; backends that need random access buffer it themselves.
pub type ContentReader = Box<dyn AsyncRead + Unpin + Send>;

/// Lazy directory listing. Errors surface in-band so the entries produced
/// before a failure can still be consumed.
pub type EntryStream<'a> = BoxStream<'a, Result<DirEntry, StorageError>>;

/// One enumerated item, relative to the enumerated directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Remote storage error: {0}")]
    Remote(String),
}

pub(crate) fn io_err(path: impl Into<String>, source: std::io::Error) -> StorageError {
    let path = path.into();
    if source.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(path)
    } else {
        StorageError::Io { path, source }
    }
}

/// Capability set the synchronization engine needs from a storage medium.
/// Any implementation honoring it is interchangeable.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs and health output.
    fn kind(&self) -> &'static str;

    /// Create-or-replace `path`, creating missing parent directories.
    async fn write(
        &self,
        path: &str,
        size_hint: u64,
        reader: ContentReader,
    ) -> Result<(), StorageError>;

    /// Lists everything below `directory`. A missing directory is empty.
    fn enumerate<'a>(&'a self, directory: &'a str) -> EntryStream<'a>;

    async fn read(&self, path: &str) -> Result<ContentReader, StorageError>;

    async fn file_size(&self, path: &str) -> Result<u64, StorageError>;

    async fn delete_file(&self, path: &str) -> Result<(), StorageError>;

    /// Recursive. Deleting a missing directory succeeds.
    async fn delete_directory(&self, path: &str) -> Result<(), StorageError>;

    fn join_path(&self, parts: &[&str]) -> String {
        crate::utils::path::join_path(parts)
    }
}
