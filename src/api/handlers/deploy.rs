use crate::api::error::AppError;
use crate::services::coordinator::ArchiveTooLarge;
use crate::services::job::{
    Admission, CompletionCallbacks, DetachedCallbacks, JobCallbacks, SyncReport,
};
use crate::utils::path::has_parent_segment;
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::StreamReader;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeployQuery {
    /// Wait for the job to finish and return its report
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeployResponse {
    pub job_id: String,
    pub destination: String,
    /// "started" or "queued"
    pub status: String,
    /// Destination the job waits behind when queued
    pub queued_behind: Option<String>,
}

fn staging_error(e: std::io::Error) -> AppError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<ArchiveTooLarge>()) {
        Some(too_large) => AppError::PayloadTooLarge(too_large.to_string()),
        None if e.to_string().contains("length limit exceeded") => AppError::PayloadTooLarge(
            "Request body exceeds the maximum allowed limit".to_string(),
        ),
        None => AppError::BadRequest(format!("Failed to receive archive: {}", e)),
    }
}

#[utoipa::path(
    post,
    path = "/deploy/{destination}",
    params(
        ("destination" = String, Path, description = "Destination directory to replace"),
        DeployQuery
    ),
    request_body(content = Multipart, description = "gzip-compressed tar archive in the `file` field"),
    responses(
        (status = 200, description = "Deployment finished (wait=true)", body = SyncReport),
        (status = 202, description = "Deployment accepted", body = DeployResponse),
        (status = 400, description = "Missing or invalid archive"),
        (status = 413, description = "Archive too large"),
        (status = 422, description = "Archive could not be extracted")
    ),
    tag = "deploy"
)]
pub async fn deploy_archive(
    State(state): State<crate::AppState>,
    Path(destination): Path<String>,
    Query(query): Query<DeployQuery>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    if has_parent_segment(&destination) {
        return Err(AppError::BadRequest(format!(
            "Invalid destination: {}",
            destination
        )));
    }

    let (callbacks, completion): (Arc<dyn JobCallbacks>, _) = if query.wait {
        let (callbacks, rx) = CompletionCallbacks::channel();
        (callbacks, Some(rx))
    } else {
        (Arc::new(DetachedCallbacks), None)
    };

    let result: Result<DeployResponse, AppError> = async {
        while let Some(field) = multipart.next_field().await.map_err(|e| {
            let err_msg = e.to_string();
            if err_msg.contains("length limit exceeded") {
                AppError::PayloadTooLarge(
                    "Request body exceeds the maximum allowed limit".to_string(),
                )
            } else {
                AppError::BadRequest(err_msg)
            }
        })? {
            if field.name() != Some("file") {
                continue;
            }

            let mut sink = state
                .coordinator
                .open_staging_sink(&destination, Arc::clone(&callbacks))
                .await?;

            let reader = StreamReader::new(field.map_err(std::io::Error::other));
            tokio::pin!(reader);
            if let Err(e) = tokio::io::copy(&mut reader, &mut sink).await {
                sink.abort().await;
                return Err(staging_error(e));
            }

            let job_id = sink.job_id().to_string();
            let destination = sink.destination().to_string();
            let admission = sink.commit().await?;

            let queued_behind = match &admission {
                Admission::Started => None,
                Admission::Queued { behind } => Some(behind.clone()),
            };
            return Ok(DeployResponse {
                job_id,
                destination,
                status: admission.as_str().to_string(),
                queued_behind,
            });
        }

        Err(AppError::BadRequest("No file provided".to_string()))
    }
    .await;

    let accepted = match result {
        Ok(accepted) => accepted,
        Err(e) => {
            // Drain the rest of the body so the client gets the response instead of a reset.
            tracing::warn!("Deployment rejected early: {}. Consuming remaining stream...", e);
            while let Ok(Some(mut field)) = multipart.next_field().await {
                while let Ok(Some(_)) = field.chunk().await {}
            }
            return Err(e);
        }
    };

    match completion {
        Some(rx) => {
            let report = rx.await.map_err(|_| {
                AppError::Internal(format!("Job {} ended without an outcome", accepted.job_id))
            })??;
            Ok(Json(report).into_response())
        }
        None => Ok((StatusCode::ACCEPTED, Json(accepted)).into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_limit_maps_to_payload_too_large() {
        let e = std::io::Error::other(ArchiveTooLarge { limit: 10 });
        assert!(matches!(staging_error(e), AppError::PayloadTooLarge(_)));

        let e = std::io::Error::other("connection reset");
        assert!(matches!(staging_error(e), AppError::BadRequest(_)));
    }
}
