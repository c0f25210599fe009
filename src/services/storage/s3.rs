use super::{ContentReader, DirEntry, EntryStream, StorageBackend, StorageError, io_err};
use crate::utils::path::join_path;
use async_stream::try_stream;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use futures::{Stream, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

/// S3 rejects multipart parts below 5 MB (except the last one).
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub struct S3Storage {
    client: Client,
    bucket: String,
    part_size: usize,
}

fn remote(key: &str, error: impl std::error::Error) -> StorageError {
    StorageError::Remote(format!("{}: {}", key, DisplayErrorContext(error)))
}

/// Reads until `buffer` is full or the reader is exhausted.
async fn fill(reader: &mut (impl AsyncRead + Unpin), buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buffer.len() {
        let read = reader.read(&mut buffer[n..]).await?;
        if read == 0 {
            break;
        }
        n += read;
    }
    Ok(n)
}

impl S3Storage {
    pub fn new(client: Client, bucket: String, part_size: usize) -> Self {
        Self {
            client,
            bucket,
            part_size: part_size.max(MIN_PART_SIZE),
        }
    }

    fn key(path: &str) -> String {
        join_path(&[path]).trim_start_matches('/').to_string()
    }

    fn prefix(directory: &str) -> String {
        let key = Self::key(directory);
        if key.is_empty() { key } else { format!("{}/", key) }
    }

    fn listing<'a>(
        &'a self,
        directory: &'a str,
    ) -> impl Stream<Item = Result<DirEntry, StorageError>> + Send + 'a {
        try_stream! {
            let prefix = Self::prefix(directory);
            let mut continuation_token = None;

            loop {
                let res = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix)
                    .set_continuation_token(continuation_token.take())
                    .send()
                    .await
                    .map_err(|e| remote(&prefix, e))?;

                if let Some(contents) = res.contents {
                    for object in contents {
                        if let Some(key) = object.key {
                            let relative = key.strip_prefix(prefix.as_str()).unwrap_or(&key);
                            if relative.is_empty() {
                                continue;
                            }
                            yield DirEntry {
                                path: relative.to_string(),
                                is_dir: false,
                            };
                        }
                    }
                }

                if res.is_truncated.unwrap_or(false) && res.next_continuation_token.is_some() {
                    continuation_token = res.next_continuation_token;
                } else {
                    break;
                }
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut ContentReader,
        buffer: &mut [u8],
        first: usize,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut n = first;

        while n > 0 {
            let upload_part_res = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .part_number(part_number)
                .send()
                .await
                .map_err(|e| remote(key, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );

            part_number += 1;
            n = fill(reader, buffer).await.map_err(|e| io_err(key, e))?;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn write(
        &self,
        path: &str,
        size_hint: u64,
        mut reader: ContentReader,
    ) -> Result<(), StorageError> {
        let key = Self::key(path);
        let mut buffer = vec![0u8; self.part_size];
        let first = fill(&mut reader, &mut buffer)
            .await
            .map_err(|e| io_err(path, e))?;

        // Entries that fit in one part skip the multipart handshake.
        if first < self.part_size {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(buffer[..first].to_vec()))
                .send()
                .await
                .map_err(|e| remote(&key, e))?;
            tracing::debug!(key, bytes = first, "put object");
            return Ok(());
        }

        let multipart_upload_res = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| remote(&key, e))?;
        let upload_id = multipart_upload_res
            .upload_id()
            .ok_or_else(|| StorageError::Remote(format!("{}: no upload id", key)))?
            .to_string();

        let uploaded = self
            .upload_parts(&key, &upload_id, &mut reader, &mut buffer, first)
            .await;

        let completed_parts = match uploaded {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!("Failed to abort multipart upload {}: {}", key, abort);
                }
                return Err(e);
            }
        };

        let parts = completed_parts.len();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| remote(&key, e))?;

        tracing::debug!(key, parts, size_hint, "completed multipart upload");
        Ok(())
    }

    fn enumerate<'a>(&'a self, directory: &'a str) -> EntryStream<'a> {
        Box::pin(self.listing(directory))
    }

    async fn read(&self, path: &str) -> Result<ContentReader, StorageError> {
        let key = Self::key(path);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    StorageError::NotFound(path.to_string())
                } else {
                    remote(&key, service_error)
                }
            })?;
        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    async fn file_size(&self, path: &str) -> Result<u64, StorageError> {
        let key = Self::key(path);
        let res = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    StorageError::NotFound(path.to_string())
                } else {
                    remote(&key, service_error)
                }
            })?;
        Ok(res.content_length.unwrap_or(0).max(0) as u64)
    }

    async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        let key = Self::key(path);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| remote(&key, e))?;
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> Result<(), StorageError> {
        let entries: Vec<DirEntry> = self.listing(path).try_collect().await?;
        let prefix = Self::prefix(path);
        for entry in entries {
            self.delete_file(&format!("{}{}", prefix, entry.path))
                .await?;
        }
        Ok(())
    }
}
