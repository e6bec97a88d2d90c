//! Client-facing routes — the surface upstream SDKs point at.
//!
//! This is intentionally a thin layer: the whole dispatch pipeline lives in
//! [`crate::proxy`]. Only `/healthz` and `/v1/models` are answered locally;
//! every other `/v1/…` request is proxied.

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};

use crate::proxy::{proxy_handler, ProxyState};

/// Build the client-facing axum router.
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/v1/models", get(list_models))
        .route("/v1/{*path}", any(proxy_handler))
        .with_state(state)
}

/// GET /v1/models — the routable model catalog as model objects.
///
/// Answered locally from the router's registry so clients can probe what
/// the proxy will dispatch to without spending an upstream call.
pub async fn list_models(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    let models: Vec<Value> = state
        .router
        .models()
        .iter()
        .map(|model| {
            json!({
                "id": model.name(),
                "object": "model",
                "owned_by": model.tier().as_str(),
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": models }))
}
