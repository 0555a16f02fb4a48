//! The peer ingress server: a worker's axum-based analogue of the teacher's
//! `cargo_router`, accepting steal requests, heartbeats, and peer address
//! registration.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use polybuild::peer::handle_steal_request;
use polybuild_wire::peer::{HeartBeat, PeerAddress, StealRequest, StealResponse};
use serde_json::{Value, json};
use tracing::info;

use crate::AppState;

pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v0/health", get(health))
        .route("/api/v0/register", post(register))
        .route("/api/v0/heartbeat", post(heartbeat))
        .route("/api/v0/steal", post(steal))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "ok": true, "worker_id": state.self_id.as_str() }))
}

async fn register(State(state): State<Arc<AppState>>, Json(address): Json<PeerAddress>) -> Json<Value> {
    state.idle.touch();
    state.peers.register(address, now_secs());
    Json(json!({ "ok": true }))
}

async fn heartbeat(State(state): State<Arc<AppState>>, Json(hb): Json<HeartBeat>) -> Json<Value> {
    state.idle.touch();
    state.peers.update_metrics(&hb.worker, &hb.metrics, hb.t);
    Json(json!({ "queue_depth": state.queue.len() }))
}

async fn steal(State(state): State<Arc<AppState>>, Json(req): Json<StealRequest>) -> Json<StealResponse> {
    state.idle.touch();
    info!(thief = %req.thief, victim = %req.victim, "handling steal request");
    Json(handle_steal_request(|| state.queue.pop()))
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
