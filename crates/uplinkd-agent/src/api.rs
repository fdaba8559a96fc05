//! Local HTTP surface for CLIs and the bus bridge.
//!
//! - `GET /api/status` — current primary plus per-member health
//! - `GET /api/members` — configured members and their flags
//! - `GET /api/metrics` — samples within a window, optionally by member
//! - `GET /api/events` — decision events, newest first
//! - `POST /api/action` — set_primary / force_recheck / pause / resume
//! - `GET /metrics` — Prometheus text exposition
//!
//! Failures cross this boundary as the `{ok, error_kind, message,
//! retryable}` envelope.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::RwLock;

use uplinkd_common::config::Config;
use uplinkd_common::envelope::{ErrorEnvelope, ErrorKind};
use uplinkd_common::metrics::render_prometheus;
use uplinkd_common::models::MemberHealth;
use uplinkd_core::controller::Controller;
use uplinkd_core::engine::EngineHandle;
use uplinkd_core::store::TelemetryStore;

pub struct ApiState {
    pub config: Arc<Config>,
    pub store: Arc<TelemetryStore>,
    pub controller: Arc<Controller>,
    pub engine: EngineHandle,
    pub status: Arc<RwLock<Vec<MemberHealth>>>,
}

type ApiError = (StatusCode, Json<ErrorEnvelope>);

fn api_error(kind: ErrorKind, message: impl Into<String>) -> ApiError {
    let status = match kind {
        ErrorKind::ConfigInvalid => StatusCode::BAD_REQUEST,
        ErrorKind::Busy => StatusCode::CONFLICT,
        ErrorKind::FatalInternal => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(ErrorEnvelope::new(kind, message)))
}

/// Start the HTTP server.
pub async fn run(state: Arc<ApiState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/api/status", get(api_status))
        .route("/api/members", get(api_members))
        .route("/api/metrics", get(api_metrics))
        .route("/api/events", get(api_events))
        .route("/api/action", post(api_action))
        .route("/metrics", get(api_prometheus))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    tracing::info!("api listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ── GET /api/status ─────────────────────────────────────────────────

async fn api_status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let members = state.status.read().await.clone();
    Json(serde_json::json!({
        "ok": true,
        "primary": state.controller.current_primary(),
        "members": members,
    }))
}

// ── GET /api/members ────────────────────────────────────────────────

async fn api_members(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let members: Vec<serde_json::Value> = state
        .config
        .members()
        .iter()
        .map(|m| {
            serde_json::json!({
                "name": m.name,
                "class": m.class,
                "detect": m.detect,
                "weight": m.weight,
                "metered": m.metered,
                "prefer_roaming": m.prefer_roaming,
                "interface": m.interface(),
            })
        })
        .collect();
    Json(serde_json::json!({ "ok": true, "members": members }))
}

// ── GET /api/metrics ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    /// Restrict to samples younger than this many seconds.
    window_s: Option<u64>,
    member: Option<String>,
}

async fn api_metrics(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<MetricsQuery>,
) -> Json<serde_json::Value> {
    let now = chrono::Utc::now();
    let cutoff = query
        .window_s
        .map(|s| now - chrono::Duration::seconds(s as i64));

    let names: Vec<String> = match &query.member {
        Some(member) => vec![member.clone()],
        None => state.config.members().iter().map(|m| m.name.clone()).collect(),
    };

    let mut samples = serde_json::Map::new();
    for name in names {
        let window: Vec<_> = state
            .store
            .window(&name, now)
            .into_iter()
            .filter(|s| cutoff.is_none_or(|c| s.t >= c))
            .collect();
        samples.insert(name, serde_json::json!(window));
    }
    Json(serde_json::json!({ "ok": true, "samples": samples }))
}

// ── GET /api/events ─────────────────────────────────────────────────

async fn api_events(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let mut events = state.store.events(chrono::Utc::now());
    events.reverse();
    Json(serde_json::json!({ "ok": true, "events": events }))
}

// ── POST /api/action ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ActionKind {
    SetPrimary,
    ForceRecheck,
    Pause,
    Resume,
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    kind: ActionKind,
    member: Option<String>,
}

async fn api_action(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ActionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match body.kind {
        ActionKind::SetPrimary => {
            let member = body.member.ok_or_else(|| {
                api_error(ErrorKind::ConfigInvalid, "set_primary requires a member")
            })?;
            let outcome = state.engine.set_primary(&member).await.ok_or_else(|| {
                api_error(ErrorKind::FatalInternal, "decision engine unavailable")
            })?;
            if let Some(kind) = outcome.error_kind {
                return Err(api_error(
                    kind,
                    outcome.error.unwrap_or_else(|| kind.to_string()),
                ));
            }
            Ok(Json(serde_json::json!({
                "ok": true,
                "applied": outcome.applied,
                "noop": outcome.noop,
                "primary": state.controller.current_primary(),
            })))
        }
        ActionKind::ForceRecheck => {
            if !state.engine.force_recheck().await {
                return Err(api_error(
                    ErrorKind::FatalInternal,
                    "decision engine unavailable",
                ));
            }
            Ok(Json(serde_json::json!({
                "ok": true,
                "primary": state.controller.current_primary(),
            })))
        }
        ActionKind::Pause => {
            if !state.engine.pause().await {
                return Err(api_error(
                    ErrorKind::FatalInternal,
                    "decision engine unavailable",
                ));
            }
            Ok(Json(serde_json::json!({ "ok": true, "paused": true })))
        }
        ActionKind::Resume => {
            if !state.engine.resume().await {
                return Err(api_error(
                    ErrorKind::FatalInternal,
                    "decision engine unavailable",
                ));
            }
            Ok(Json(serde_json::json!({ "ok": true, "paused": false })))
        }
    }
}

// ── GET /metrics ────────────────────────────────────────────────────

async fn api_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let members = state.status.read().await.clone();
    let body = render_prometheus(&members, &state.store.counters());
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}
