//! HTTP front-end: JSON-RPC endpoint, metrics exposition, liveness.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hangar_types::wire::RpcCall;
use serde_json::json;
use std::sync::Arc;

use crate::rpc;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/metrics", get(handle_metrics))
        .route("/healthz", get(handle_healthz))
        .with_state(state)
}

async fn handle_mcp(
    State(state): State<Arc<AppState>>,
    Json(call): Json<RpcCall>,
) -> impl IntoResponse {
    let reply = rpc::dispatch(&state, call).await;
    Json(reply)
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let provider_states = state.registry.provider_states();
    let body = state.metrics.render_prometheus(&provider_states);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

async fn handle_healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let providers = state.registry.list_providers(None);
    let ready = providers
        .iter()
        .filter(|p| p.state == hangar_core::ProviderState::Ready)
        .count();
    Json(json!({
        "status": "ok",
        "providers_total": providers.len(),
        "providers_ready": ready,
        "uptime_seconds": state.uptime_seconds(),
    }))
}

/// Bind and serve until the shutdown token fires.
pub async fn serve_http(state: Arc<AppState>, host: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "serving MCP over HTTP");

    let shutdown = state.shutting_down.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
