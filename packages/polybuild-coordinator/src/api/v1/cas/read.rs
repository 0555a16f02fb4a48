use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use color_eyre::eyre::Report;
use polybuild_wire::artifact::ArtifactId;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::api::State as AppState;

const BUFFER_SIZE: usize = 64 * 1024;

/// Read the content from the artifact store for the given id.
///
/// This handler implements the GET endpoint for retrieving blob content. It
/// streams the content from disk, decompressing transparently.
#[tracing::instrument(skip(state))]
pub async fn handle(State(state): State<AppState>, Path(id): Path<ArtifactId>) -> CasReadResponse {
    match state.storage.read(&id).await {
        Ok(reader) => {
            info!("cas.read.success");
            let stream = ReaderStream::with_capacity(reader, BUFFER_SIZE);
            CasReadResponse::Found(Body::from_stream(stream))
        }
        Err(err) => {
            let is_not_found = err.chain().any(|cause| {
                cause
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
            });

            if is_not_found {
                info!("cas.read.not_found");
                CasReadResponse::NotFound
            } else {
                error!(?err, "cas.read.error");
                CasReadResponse::Error(err)
            }
        }
    }
}

#[derive(Debug)]
pub enum CasReadResponse {
    Found(Body),
    NotFound,
    Error(Report),
}

impl IntoResponse for CasReadResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            CasReadResponse::Found(body) => {
                (StatusCode::OK, [("content-type", "application/octet-stream")], body).into_response()
            }
            CasReadResponse::NotFound => StatusCode::NOT_FOUND.into_response(),
            CasReadResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use crate::api::test_helpers::{test_server, write_cas};

    #[tokio::test]
    async fn read_after_write_roundtrips() -> Result<()> {
        const CONTENT: &[u8] = b"read roundtrip test content";
        let (server, _tmp) = test_server().await?;

        let id = write_cas(&server, CONTENT).await?;

        let response = server.get(&format!("/api/v1/cas/{id}")).await;
        response.assert_status_ok();
        pretty_assert_eq!(response.as_bytes().as_ref(), CONTENT);

        Ok(())
    }

    #[tokio::test]
    async fn read_missing_returns_not_found() -> Result<()> {
        let (server, _tmp) = test_server().await?;
        let id = crate::api::test_helpers::test_blob(b"never written");

        let response = server.get(&format!("/api/v1/cas/{id}")).await;
        response.assert_status(axum::http::StatusCode::NOT_FOUND);

        Ok(())
    }
}
