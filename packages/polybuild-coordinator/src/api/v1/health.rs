use axum::{extract::State, http::StatusCode, response::IntoResponse};
use color_eyre::eyre::Report;
use tracing::{error, info};

use crate::api::State as AppState;

/// Health check endpoint.
///
/// Validates that the artifact store is accessible before responding.
#[tracing::instrument(skip(state))]
pub async fn handle(State(state): State<AppState>) -> PingResponse {
    match state.storage.ping().await {
        Ok(()) => {
            info!("health.ping.success");
            PingResponse::Success
        }
        Err(err) => {
            error!(?err, "health.ping.error");
            PingResponse::Error(err)
        }
    }
}

#[derive(Debug)]
pub enum PingResponse {
    Success,
    Error(Report),
}

impl IntoResponse for PingResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            PingResponse::Success => StatusCode::OK.into_response(),
            PingResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}
