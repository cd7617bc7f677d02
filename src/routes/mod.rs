use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod checkout;
pub mod health;
pub mod jobs;
pub mod sessions;
pub mod uploads;
pub mod webhooks;

/// Multipart framing on top of the largest accepted image.
const UPLOAD_BODY_LIMIT: usize = uploads::MAX_UPLOAD_BYTES + 64 * 1024;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(state.config.cors_allowed_origin.as_deref());

    let job_routes = Router::new()
        .route("/", get(jobs::find_job))
        .route("/:id", get(jobs::get_job))
        .route("/:id/events", get(jobs::job_events))
        .route("/:id/claim", post(jobs::claim_job))
        .route("/:id/downloaded", post(jobs::mark_downloaded));

    let file_routes = Router::new().route(
        "/:id",
        get(uploads::download_file).delete(uploads::delete_file),
    );

    let upload_routes = Router::new()
        .route("/", post(uploads::upload_file))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT));

    Router::new()
        .nest("/api/jobs", job_routes)
        .nest("/api/files", file_routes)
        .nest("/api/uploads", upload_routes)
        .route("/api/checkout", post(checkout::create_checkout))
        .route("/api/sessions/anonymous", post(sessions::create_anonymous_session))
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook))
        .route(
            "/api/internal/jobs/:id/status",
            post(jobs::processing_status_callback),
        )
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(allowed: Option<&str>) -> CorsLayer {
    let allow_origin = match allowed {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .filter_map(|origin| match origin.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}
