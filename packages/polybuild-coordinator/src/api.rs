//! API endpoint handlers for the coordinator.
//!
//! ## Shared state
//!
//! Handlers reach the artifact store and worker registry through an
//! `Arc<`[`AppState`]`>` extracted via axum's `State`. Reference [`AppState`]
//! for the full list of what's available.
//!
//! ## Response types
//!
//! Most handlers return a response type that implements
//! [`IntoResponse`](axum::response::IntoResponse). This is a trait that
//! allows handlers to return a response without having to manually implement
//! the response type.
//!
//! We do it this way instead of just returning a more generic response type
//! because it supports better documentation and makes it easier to realize if
//! you're writing backwards-incompatible changes to the API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router, extract::DefaultBodyLimit, extract::Request, http::HeaderValue, middleware::Next,
    response::Response,
};
use polybuild::peer::Registry;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, decompression::RequestDecompressionLayer,
    limit::RequestBodyLimitLayer, timeout::TimeoutLayer,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::storage::Disk;

pub mod v1;

/// Request timeout is set to accommodate bulk operations transferring large
/// amounts of data. 30 minutes allows for 10GB transfers over slower
/// connections (~50 Mbps) while still protecting against indefinitely hanging
/// connections.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1800);

/// Body size limit for streaming operations (artifact uploads). A single
/// built artifact can be large, and bulk operations may transfer many
/// artifacts in one request.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024 * 1024; // 10GB

/// Body size limit for JSON deserialization (registry heartbeats, steal
/// requests).
const MAX_JSON_BODY_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Dependencies shared by every handler.
pub struct AppState {
    pub storage: Disk,
    pub registry: Registry,
}

pub type State = Arc<AppState>;

pub fn router(state: State) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .nest("/api/v1", v1::router())
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY_SIZE))
        .layer(middleware)
        .layer(axum::middleware::from_fn(trace_request))
        .with_state(state)
}

async fn trace_request(request: Request, next: Next) -> Response {
    const REQUEST_ID_HEADER: &str = "x-request-id";
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|id| id.to_str().map(|id| id.to_string()).ok())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let start = Instant::now();
    let url = request.uri().to_string();
    let method = request.method().to_string();

    let span = tracing::info_span!("http.request", %id, %url, %method);
    async move {
        let mut response = next.run(request).await;
        let status = response.status();
        let duration = start.elapsed();
        tracing::info!(%id, %url, %method, %status, ?duration, "http.request.response");

        if let Ok(id) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, id);
        }
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use axum_test::TestServer;
    use color_eyre::{Result, eyre::Context};
    use polybuild_wire::artifact::ArtifactId;
    use std::time::Duration as StdDuration;

    /// Compute the id of a blob of test content.
    pub fn test_blob(content: &[u8]) -> ArtifactId {
        ArtifactId::from_buffer(content)
    }

    /// Spin up an in-process test server backed by a temp artifact store.
    pub async fn test_server() -> Result<(TestServer, tempfile::TempDir)> {
        let (storage, temp) = Disk::new_temp().await.context("create temp storage")?;
        let state = Arc::new(AppState {
            storage,
            registry: Registry::new(StdDuration::from_secs(5)),
        });
        let router = router(state);
        let server = TestServer::new(router).context("build test server")?;
        Ok((server, temp))
    }

    /// Write a blob through the API, returning its id.
    pub async fn write_cas(server: &TestServer, content: &[u8]) -> Result<ArtifactId> {
        let id = test_blob(content);
        server
            .put(&format!("/api/v1/cas/{id}"))
            .bytes(content.to_vec().into())
            .await
            .assert_status_success();
        Ok(id)
    }
}
