//! Liveness and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /` - Plain greeting
//! - `GET /health` - Liveness with active stream count
//! - `GET /ready` - Readiness check, opens and closes a broker connection
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Always 200 while the process serves requests
//! - **Readiness** (`/ready`): 503 when no broker connection can be opened

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::broker::Broker;
use crate::models::{HealthResponse, ReadyResponse};
use crate::state::AppState;

pub async fn root() -> &'static str {
    "Hello, World!"
}

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "active_streams": 2,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check<B: Broker>(State(state): State<AppState<B>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        active_streams: state.active_streams(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for orchestrators.
#[instrument(skip(state))]
pub async fn readiness_check<B: Broker>(
    State(state): State<AppState<B>>,
) -> (StatusCode, Json<ReadyResponse>) {
    let broker_reachable = state.check_broker().await;
    let status = if broker_reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready: broker_reachable,
            broker_reachable,
        }),
    )
}
