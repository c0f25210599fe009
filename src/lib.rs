pub mod api;
pub mod config;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::SyncConfig;
use crate::services::coordinator::UploadCoordinator;
use crate::services::storage::StorageBackend;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Extra room on top of `max_archive_size` for multipart framing.
const MULTIPART_OVERHEAD: usize = 10 * 1024 * 1024;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::deploy::deploy_archive,
        api::handlers::files::serve_file,
        api::handlers::backup::download_backup,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::deploy::DeployResponse,
            api::handlers::health::HealthResponse,
            services::job::SyncReport,
        )
    ),
    tags(
        (name = "deploy", description = "Archive deployment and backup endpoints"),
        (name = "files", description = "Static file serving"),
        (name = "system", description = "Service health")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: UploadCoordinator,
    pub storage: Arc<dyn StorageBackend>,
    pub config: SyncConfig,
}

pub fn create_app(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.config.max_archive_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/deploy/*destination",
            post(api::handlers::deploy::deploy_archive)
                .layer(axum::extract::DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files/", get(api::handlers::files::serve_file))
        .route("/files/*path", get(api::handlers::files::serve_file))
        .route(
            "/backup/*directory",
            get(api::handlers::backup::download_backup),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
        .with_state(state)
}
