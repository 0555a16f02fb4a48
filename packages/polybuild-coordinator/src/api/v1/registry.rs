//! Coordinator-side endpoints for the worker registry: workers heartbeat in
//! here, and whoever is dispatching a new action asks `/select` for the
//! least-loaded healthy worker.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use polybuild_wire::peer::{HeartBeat, WorkerId};
use serde::Serialize;

use crate::api::State as AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/select", get(select))
        .route("/workers/{id}", axum::routing::delete(remove))
}

async fn heartbeat(State(state): State<AppState>, Json(hb): Json<HeartBeat>) {
    state.registry.record_heartbeat(&hb, now_secs());
}

#[derive(Serialize)]
struct SelectResponse {
    worker: Option<WorkerId>,
}

async fn select(State(state): State<AppState>) -> Json<SelectResponse> {
    Json(SelectResponse {
        worker: state.registry.select_worker(now_secs()),
    })
}

async fn remove(State(state): State<AppState>, axum::extract::Path(id): axum::extract::Path<String>) {
    state.registry.remove(&WorkerId::new(id));
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use serde_json::{Value, json};

    use crate::api::test_helpers::test_server;

    #[tokio::test]
    async fn select_returns_least_loaded_worker() -> Result<()> {
        let (server, _tmp) = test_server().await?;

        let busy = json!({
            "worker": "busy",
            "seq": 1,
            "state": "idle",
            "metrics": { "queue_depth": 10, "cpu_usage": 50.0, "mem_usage": 0.0 },
            "t": 0,
        });
        let idle = json!({
            "worker": "idle",
            "seq": 1,
            "state": "idle",
            "metrics": { "queue_depth": 0, "cpu_usage": 0.0, "mem_usage": 0.0 },
            "t": 0,
        });

        server.post("/api/v1/registry/heartbeat").json(&busy).await.assert_status_ok();
        server.post("/api/v1/registry/heartbeat").json(&idle).await.assert_status_ok();

        let response = server.get("/api/v1/registry/select").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["worker"], "idle");

        Ok(())
    }

    #[tokio::test]
    async fn select_with_no_workers_returns_null() -> Result<()> {
        let (server, _tmp) = test_server().await?;

        let response = server.get("/api/v1/registry/select").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["worker"], Value::Null);

        Ok(())
    }
}
