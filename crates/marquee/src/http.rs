//! HTTP surface: the music library, the log tail, and health.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use cantinaproto::ServiceState;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::state::BridgeState;
use crate::ws::client_session;

pub fn router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/music/library", get(library))
        .route("/api/logs", get(logs))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BridgeState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

#[derive(Debug, Serialize)]
struct LibraryTrack {
    id: String,
    title: String,
    artist: Option<String>,
    duration_seconds: Option<f64>,
    file: String,
}

#[derive(Debug, Serialize)]
struct LibraryResponse {
    tracks: Vec<LibraryTrack>,
}

async fn library(State(state): State<Arc<BridgeState>>) -> Json<LibraryResponse> {
    let tracks = state
        .library_snapshot()
        .into_iter()
        .map(|track| LibraryTrack {
            id: track.track_id,
            title: track.title,
            artist: track.artist,
            duration_seconds: track.duration_seconds,
            file: track.filepath.to_string_lossy().into_owned(),
        })
        .collect();
    Json(LibraryResponse { tracks })
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    100
}

async fn logs(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let entries = state.logs.tail(query.limit.min(1000));
    Json(serde_json::json!({ "entries": entries }))
}

#[derive(Debug, Serialize)]
struct Healthz {
    ok: bool,
    services: HashMap<String, ServiceState>,
}

async fn healthz(State(state): State<Arc<BridgeState>>) -> Json<Healthz> {
    let services = state.service_states();
    let ok = !services.is_empty()
        && services
            .values()
            .all(|s| matches!(s, ServiceState::Running | ServiceState::Degraded));
    Json(Healthz { ok, services })
}
