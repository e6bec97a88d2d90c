//! Liveness probe endpoint.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// `GET /healthz` — always returns 200 OK with `{"status": "ok"}`.
///
/// Answered locally, never proxied, and never blocks — safe as a Docker /
/// Kubernetes liveness probe even while the key pool is saturated.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
