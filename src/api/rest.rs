// =============================================================================
// REST Endpoints — the arena command surface over Axum
// =============================================================================
//
// Everything lives under `/api/v1/arena/`. Health is public; the rest takes
// a Bearer token. The handlers are thin wrappers over the orchestrator's
// operations: a precondition violation comes back as 400 with the error text.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::api::ApiContext;
use crate::config::SessionConfig;
use crate::roster::generate_roster;

/// Build the full router with CORS and shared context.
pub fn router(context: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/arena/session", post(create_session))
        .route("/api/v1/arena/start", post(start))
        .route("/api/v1/arena/pause", post(pause))
        .route("/api/v1/arena/resume", post(resume))
        .route("/api/v1/arena/stop", post(stop))
        .route("/api/v1/arena/status", get(status))
        .route("/api/v1/arena/state", get(state))
        .route("/api/v1/arena/rankings", get(rankings))
        .route("/api/v1/arena/events", get(events))
        .route("/api/v1/arena/config", get(config))
        .route("/api/v1/arena/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(context)
}

fn bad_request(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("{e:#}") })),
    )
}

// ── Public ──────────────────────────────────────────────────────────────

async fn health(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "arena_status": ctx.orchestrator.status(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Session lifecycle ───────────────────────────────────────────────────

async fn create_session(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Json(config): Json<SessionConfig>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    config.validate().map_err(bad_request)?;

    let roster = generate_roster(&config, ctx.llm.as_deref()).await;
    let roster_cost = roster.cost_usd;
    let (session_id, agents) = ctx
        .orchestrator
        .create_session(config, roster)
        .await
        .map_err(bad_request)?;

    info!(session_id = %session_id, "session created via API");
    Ok(Json(json!({
        "session_id": session_id,
        "agents": agents,
        "roster_cost_usd": roster_cost,
    })))
}

async fn start(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    ctx.orchestrator.start().await.map_err(bad_request)?;
    Ok(Json(json!({ "status": ctx.orchestrator.status() })))
}

async fn pause(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    ctx.orchestrator.pause().await.map_err(bad_request)?;
    Ok(Json(json!({ "status": ctx.orchestrator.status() })))
}

async fn resume(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    ctx.orchestrator.resume().await.map_err(bad_request)?;
    Ok(Json(json!({ "status": ctx.orchestrator.status() })))
}

async fn stop(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let summary = ctx.orchestrator.stop().await.map_err(bad_request)?;
    Ok(Json(json!({ "summary": summary })))
}

// ── Read-only views ─────────────────────────────────────────────────────

async fn status(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    let orch = &ctx.orchestrator;
    Json(json!({
        "status": orch.status(),
        "session_id": orch.session_id(),
        "tick": orch.current_tick(),
        "elapsed_ms": orch.elapsed_ms(),
        "price": orch.current_price(),
        "subscribers": orch.subscriber_count(),
    }))
}

async fn state(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    Json(json!({ "agents": ctx.orchestrator.agent_states() }))
}

async fn rankings(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    Json(json!({ "rankings": ctx.orchestrator.rankings() }))
}

async fn events(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    Json(json!({ "events": ctx.orchestrator.event_buffer() }))
}

async fn config(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    Json(json!({ "config": ctx.orchestrator.config() }))
}
