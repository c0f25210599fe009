use crate::api::error::AppError;
use crate::services::backup::compress_dir;
use crate::utils::path::{has_parent_segment, scope_key};
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

/// Bytes buffered between the archiver and the response body.
const BACKUP_PIPE_SIZE: usize = 256 * 1024;

#[utoipa::path(
    get,
    path = "/backup/{directory}",
    params(
        ("directory" = String, Path, description = "Storage directory to archive")
    ),
    responses(
        (status = 200, description = "gzip-compressed tar stream of the directory"),
        (status = 400, description = "Invalid path")
    ),
    tag = "deploy"
)]
pub async fn download_backup(
    State(state): State<crate::AppState>,
    Path(directory): Path<String>,
) -> Result<Response, AppError> {
    if has_parent_segment(&directory) {
        return Err(AppError::BadRequest(format!(
            "Invalid directory: {}",
            directory
        )));
    }
    let directory = scope_key(&directory);

    let (writer, reader) = tokio::io::duplex(BACKUP_PIPE_SIZE);
    let storage = Arc::clone(&state.storage);
    let source = directory.clone();
    tokio::spawn(async move {
        match compress_dir(storage, &source, writer).await {
            Ok(files) => tracing::info!("📦 Backup of '{}' streamed {} file(s)", source, files),
            // The client sees a truncated body.
            Err(e) => tracing::error!("❌ Backup of '{}' failed: {}", source, e),
        }
    });

    let file_name = match directory.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "backup".to_string(),
    };

    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.tar.gz\"", file_name),
            ),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}
