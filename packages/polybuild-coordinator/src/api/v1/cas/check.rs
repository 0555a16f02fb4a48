use axum::{extract::Path, extract::State, http::StatusCode, response::IntoResponse};
use color_eyre::eyre::Report;
use polybuild_wire::artifact::ArtifactId;
use tracing::{error, info};

use crate::api::State as AppState;

/// Check whether the given id exists in the artifact store.
///
/// This handler implements the HEAD endpoint for checking blob existence
/// without downloading the full content.
///
/// ## TOCTOU (Time of Check Time of Use)
///
/// Normally, developers are advised to avoid "exists" checks since they are
/// prone to "TOCTOU" bugs: when you check if something exists, another
/// process or thread might alter the result before you act on it.
///
/// Here, it's safe because the store is content-addressed: writes are
/// idempotent, so a write racing an exists-check can never produce a
/// different outcome than the content already implies.
#[tracing::instrument(skip(state))]
pub async fn handle(State(state): State<AppState>, Path(id): Path<ArtifactId>) -> CasCheckResponse {
    match state.storage.exists(&id).await {
        Ok(true) => {
            info!("cas.check.found");
            CasCheckResponse::Found
        }
        Ok(false) => {
            info!("cas.check.not_found");
            CasCheckResponse::NotFound
        }
        Err(err) => {
            error!(?err, "cas.check.error");
            CasCheckResponse::Error(err)
        }
    }
}

#[derive(Debug)]
pub enum CasCheckResponse {
    Found,
    NotFound,
    Error(Report),
}

impl IntoResponse for CasCheckResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            CasCheckResponse::Found => StatusCode::OK.into_response(),
            CasCheckResponse::NotFound => StatusCode::NOT_FOUND.into_response(),
            CasCheckResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use color_eyre::Result;

    use crate::api::test_helpers::{test_blob, test_server, write_cas};

    #[tokio::test]
    async fn check_exists() -> Result<()> {
        const CONTENT: &[u8] = b"check exists test";
        let (server, _tmp) = test_server().await?;

        let id = write_cas(&server, CONTENT).await?;

        let response = server
            .method(axum::http::Method::HEAD, &format!("/api/v1/cas/{id}"))
            .await;

        response.assert_status_ok();

        Ok(())
    }

    #[tokio::test]
    async fn check_doesnt_exist() -> Result<()> {
        let (server, _tmp) = test_server().await?;

        let nonexistent_id = test_blob(b"never written");

        let response = server
            .method(axum::http::Method::HEAD, &format!("/api/v1/cas/{nonexistent_id}"))
            .await;

        response.assert_status(StatusCode::NOT_FOUND);

        Ok(())
    }

    #[tokio::test]
    async fn check_then_write_toctou_safety() -> Result<()> {
        const CONTENT: &[u8] = b"toctou test";
        let (server, _tmp) = test_server().await?;

        let id = test_blob(CONTENT);

        let check1 = server
            .method(axum::http::Method::HEAD, &format!("/api/v1/cas/{id}"))
            .await;
        check1.assert_status(StatusCode::NOT_FOUND);

        write_cas(&server, CONTENT).await?;

        let check2 = server
            .method(axum::http::Method::HEAD, &format!("/api/v1/cas/{id}"))
            .await;
        check2.assert_status_ok();

        Ok(())
    }
}
