//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (applied in order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Adds X-Request-Id header and extension
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging, span carries request_id
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Body Limit     │ ← 413 if the publish body is too large
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `/`, `/health`, `/ready` - Greeting and health checks
//! - `/messages/{id}` - Publish (`POST`) and stream (`GET`)

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::Request;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

use crate::broker::Broker;
use crate::handlers;
use crate::middleware::{RequestId, RequestIdLayer};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router<B: Broker>(state: AppState<B>) -> Router {
    let config = &state.config;

    let cors = build_cors_layer(&config.cors_allowed_origins);

    let mut router = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check::<B>))
        .route("/ready", get(handlers::readiness_check::<B>))
        .route(
            "/messages/{id}",
            get(handlers::stream_messages::<B>).post(handlers::publish::<B>),
        );

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit
    info!(
        max_size_kb = config.max_request_body_size / 1024,
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. CORS
    router = router.layer(cors);

    // 3. Tracing
    router = router.layer(TraceLayer::new_for_http().make_span_with(
        |req: &Request<axum::body::Body>| {
            let request_id = req
                .extensions()
                .get::<RequestId>()
                .map(|id| id.to_string())
                .unwrap_or_default();
            info_span!(
                "http_request",
                method = %req.method(),
                uri = %req.uri(),
                request_id = %request_id,
            )
        },
    ));

    // 4. Request ID (outermost, so the trace span can see it)
    router = router.layer(RequestIdLayer::new());

    router.with_state(state)
}

/// Build CORS layer from configuration.
///
/// `*` allows any origin; otherwise only the listed origins are allowed.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
