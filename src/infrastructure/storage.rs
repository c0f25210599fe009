use crate::config::{S3Config, StorageKind, SyncConfig};
use crate::services::storage::{LocalStorage, S3Storage, StorageBackend};
use anyhow::Context;
use aws_sdk_s3::config::Region;
use std::sync::Arc;
use tracing::info;

pub async fn setup_storage(config: &SyncConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.storage_kind {
        StorageKind::Local => {
            let storage = LocalStorage::open(&config.local_root)
                .await
                .with_context(|| format!("Failed to open local storage at {}", config.local_root))?;
            info!("💾 Local Storage: {}", storage.root().display());
            Ok(Arc::new(storage))
        }
        StorageKind::S3 => {
            let storage = setup_s3(&config.s3, config.chunk_size).await?;
            Ok(Arc::new(storage))
        }
    }
}

async fn setup_s3(config: &S3Config, part_size: usize) -> anyhow::Result<S3Storage> {
    let endpoint_url = config
        .endpoint_url
        .clone()
        .context("MINIO_ENDPOINT must be set")?;
    let access_key = config
        .access_key
        .clone()
        .context("MINIO_ACCESS_KEY must be set")?;
    let secret_key = config
        .secret_key
        .clone()
        .context("MINIO_SECRET_KEY must be set")?;
    let bucket = config.bucket.clone().context("MINIO_BUCKET must be set")?;

    info!("☁️  S3 Storage: {} (Bucket: {})", endpoint_url, bucket);

    let aws_config = aws_config::from_env()
        .endpoint_url(&endpoint_url)
        .region(Region::new(config.region.clone()))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);

    // Ensure bucket exists
    match s3_client.head_bucket().bucket(&bucket).send().await {
        Ok(_) => info!("✅ Bucket '{}' is ready", bucket),
        Err(_) => {
            info!("🪣 Bucket '{}' not found, creating...", bucket);
            if let Err(e) = s3_client.create_bucket().bucket(&bucket).send().await {
                tracing::error!("❌ Failed to create bucket '{}': {}", bucket, e);
            } else {
                info!("✅ Bucket '{}' created successfully", bucket);
            }
        }
    }

    Ok(S3Storage::new(s3_client, bucket, part_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_backend_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            local_root: dir.path().join("data").display().to_string(),
            ..SyncConfig::development()
        };
        let storage = setup_storage(&config).await.unwrap();
        assert_eq!(storage.kind(), "local");
        assert!(dir.path().join("data").is_dir());
    }

    #[tokio::test]
    async fn test_s3_requires_endpoint() {
        let config = SyncConfig {
            storage_kind: StorageKind::S3,
            ..SyncConfig::default()
        };
        let err = setup_storage(&config).await.err().unwrap();
        assert!(err.to_string().contains("MINIO_ENDPOINT"));
    }
}
