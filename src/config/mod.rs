use std::env;

/// Storage medium the destination trees live on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    S3,
}

impl StorageKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" | "fs" => Some(Self::Local),
            "s3" | "minio" => Some(Self::S3),
            _ => None,
        }
    }
}

/// Remote object storage settings (S3 / MinIO)
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub endpoint_url: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub region: String,
}

/// Configuration for the artifact synchronization engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Storage backend: "local" or "s3" (default: "local")
    pub storage_kind: StorageKind,

    /// Root directory of the local backend (default: "./data")
    pub local_root: String,

    pub s3: S3Config,

    /// Directory holding per-job staging artifacts (default: "./temps")
    pub staging_dir: String,

    /// Staging entries older than this are purged at startup (default: 24)
    pub staging_cleanup_age_hours: u64,

    /// Jobs allowed to extract at the same time (default: 4)
    pub max_concurrent_jobs: usize,

    /// Maximum size of an uploaded archive in bytes (default: 1 GB)
    pub max_archive_size: u64,

    /// Part size for remote multipart writes in bytes (default: 7 MB)
    pub chunk_size: usize,

    /// Storage directory served by the file handler (default: "")
    pub serve_root: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_kind: StorageKind::Local,
            local_root: "./data".to_string(),
            s3: S3Config {
                region: "us-east-1".to_string(),
                ..S3Config::default()
            },
            staging_dir: "./temps".to_string(),
            staging_cleanup_age_hours: 24,
            max_concurrent_jobs: 4,
            max_archive_size: 1024 * 1024 * 1024, // 1 GB
            chunk_size: 7 * 1024 * 1024,          // 7 MB
            serve_root: String::new(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_env_with(Self::default())
    }

    fn from_env_with(default: Self) -> Self {
        Self {
            storage_kind: env::var("STORAGE_BACKEND")
                .ok()
                .and_then(|v| StorageKind::parse(&v))
                .unwrap_or(default.storage_kind),

            local_root: env::var("LOCAL_STORAGE_ROOT").unwrap_or(default.local_root),

            s3: S3Config {
                endpoint_url: env::var("MINIO_ENDPOINT").ok().or(default.s3.endpoint_url),
                access_key: env::var("MINIO_ACCESS_KEY").ok().or(default.s3.access_key),
                secret_key: env::var("MINIO_SECRET_KEY").ok().or(default.s3.secret_key),
                bucket: env::var("MINIO_BUCKET").ok().or(default.s3.bucket),
                region: env::var("S3_REGION").unwrap_or(default.s3.region),
            },

            staging_dir: env::var("STAGING_DIR").unwrap_or(default.staging_dir),

            staging_cleanup_age_hours: env::var("STAGING_CLEANUP_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.staging_cleanup_age_hours),

            max_concurrent_jobs: env::var("MAX_CONCURRENT_JOBS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.max_concurrent_jobs),

            max_archive_size: env::var("MAX_ARCHIVE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_archive_size),

            chunk_size: env::var("CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.chunk_size),

            serve_root: env::var("SERVE_ROOT").unwrap_or(default.serve_root),
        }
    }

    /// Create config for development (local disk, relaxed limits)
    pub fn development() -> Self {
        Self {
            storage_kind: StorageKind::Local,
            local_root: "./data".to_string(),
            staging_dir: "./temps".to_string(),
            max_concurrent_jobs: 2,
            ..Self::default()
        }
    }

    /// Create config for production (remote storage, env overrides applied)
    pub fn production() -> Self {
        Self::from_env_with(Self {
            storage_kind: StorageKind::S3,
            max_concurrent_jobs: 8,
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.storage_kind, StorageKind::Local);
        assert_eq!(config.max_archive_size, 1024 * 1024 * 1024);
        assert_eq!(config.staging_cleanup_age_hours, 24);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.s3.region, "us-east-1");
    }

    #[test]
    fn test_development_config() {
        let config = SyncConfig::development();
        assert_eq!(config.storage_kind, StorageKind::Local);
        assert_eq!(config.max_concurrent_jobs, 2);
    }

    #[test]
    fn test_production_config() {
        unsafe { env::remove_var("STORAGE_BACKEND") };
        let config = SyncConfig::production();
        assert_eq!(config.storage_kind, StorageKind::S3);
    }

    #[test]
    fn test_storage_kind_parse() {
        assert_eq!(StorageKind::parse("S3"), Some(StorageKind::S3));
        assert_eq!(StorageKind::parse(" local "), Some(StorageKind::Local));
        assert_eq!(StorageKind::parse("azure"), None);
    }
}
