use crate::api::error::AppError;
use crate::utils::path::{has_parent_segment, join_path};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use mime::Mime;
use tokio_util::io::ReaderStream;

const INDEX_DOCUMENT: &str = "index.html";

/// Picks the stored file a request maps to. Document navigations and
/// extension-less paths fall back to the single-page-app entry point.
fn resolve_route(path: &str, headers: &HeaderMap) -> String {
    let route = join_path(&[path]).trim_start_matches('/').to_string();
    let fetch_dest = headers
        .get("sec-fetch-dest")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let file_name = route.rsplit('/').next().unwrap_or("");
    let fallback = match fetch_dest {
        "document" => true,
        "" => !file_name.contains('.'),
        _ => route.is_empty(),
    };

    if fallback {
        INDEX_DOCUMENT.to_string()
    } else {
        route
    }
}

fn content_type(path: &str) -> Mime {
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "html" | "htm" => mime::TEXT_HTML_UTF_8,
        "css" => mime::TEXT_CSS_UTF_8,
        "js" | "mjs" => mime::APPLICATION_JAVASCRIPT_UTF_8,
        "json" | "map" => mime::APPLICATION_JSON,
        "txt" => mime::TEXT_PLAIN_UTF_8,
        "csv" => mime::TEXT_CSV_UTF_8,
        "xml" => mime::TEXT_XML,
        "svg" => mime::IMAGE_SVG,
        "png" => mime::IMAGE_PNG,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "gif" => mime::IMAGE_GIF,
        "bmp" => mime::IMAGE_BMP,
        "woff" => mime::FONT_WOFF,
        "woff2" => mime::FONT_WOFF2,
        "pdf" => mime::APPLICATION_PDF,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

#[utoipa::path(
    get,
    path = "/files/{path}",
    params(
        ("path" = String, Path, description = "File path below the served root")
    ),
    responses(
        (status = 200, description = "File content stream"),
        (status = 400, description = "Invalid path"),
        (status = 404, description = "File not found")
    ),
    tag = "files"
)]
pub async fn serve_file(
    State(state): State<crate::AppState>,
    path: Option<Path<String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let requested = path.map(|Path(p)| p).unwrap_or_default();
    if has_parent_segment(&requested) {
        return Err(AppError::BadRequest(format!(
            "Path escapes the served root: {}",
            requested
        )));
    }

    let route = resolve_route(&requested, &headers);
    let stored = join_path(&[&state.config.serve_root, &route]);

    let size = state.storage.file_size(&stored).await?;
    let reader = state.storage.read(&stored).await?;
    tracing::debug!("Serving {} ({} bytes)", stored, size);

    let body = Body::from_stream(ReaderStream::new(reader));
    Ok((
        [
            (header::CONTENT_TYPE, content_type(&route).to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        body,
    )
        .into_response())
}
