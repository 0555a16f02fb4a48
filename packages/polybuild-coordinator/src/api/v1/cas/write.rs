use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use color_eyre::eyre::Report;
use futures::{StreamExt, TryStreamExt};
use polybuild_wire::artifact::ArtifactId;
use tap::Pipe;
use tokio_util::io::StreamReader;
use tracing::{error, info};

use crate::api::State as AppState;

/// Write the content to the artifact store for the given id.
///
/// This handler implements the PUT endpoint for storing blob content. It
/// streams the request body to disk (compressing with zstd) and validates
/// that the hash of the body matches the id in the path.
///
/// ## Idempotency
///
/// If the id already exists, the body is drained and discarded without
/// writing again: the store is content-addressed, so a matching id means the
/// content must already be identical.
///
/// ## Id validation
///
/// Although the client supplies the id in the path, the store recomputes it
/// from the streamed content and rejects the write if they don't match. This
/// protects against corrupted uploads and colocates the temp file with its
/// final destination.
#[tracing::instrument(skip(state, body))]
pub async fn handle(
    State(state): State<AppState>,
    Path(id): Path<ArtifactId>,
    body: Body,
) -> CasWriteResponse {
    let exists = match state.storage.exists(&id).await {
        Ok(exists) => exists,
        Err(err) => {
            error!(?err, "cas.write.exists.error");
            return CasWriteResponse::Error(err);
        }
    };

    if exists {
        // Drain the body so the client doesn't see a connection reset, even
        // though we're discarding it.
        body.into_data_stream().for_each(|_| async {}).await;
        info!("cas.write.exists");
        return CasWriteResponse::Created;
    }

    let stream = body
        .into_data_stream()
        .map_err(std::io::Error::other)
        .pipe(StreamReader::new);

    match state.storage.write(&id, stream).await {
        Ok(()) => {
            info!("cas.write.success");
            CasWriteResponse::Created
        }
        Err(err) => {
            error!(?err, "cas.write.error");
            CasWriteResponse::Error(err)
        }
    }
}

#[derive(Debug)]
pub enum CasWriteResponse {
    Created,
    Error(Report),
}

impl IntoResponse for CasWriteResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            CasWriteResponse::Created => StatusCode::CREATED.into_response(),
            CasWriteResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Bytes;
    use axum::http::StatusCode;
    use color_eyre::Result;

    use crate::api::test_helpers::{test_blob, test_server};

    #[tokio::test]
    async fn write_then_exists() -> Result<()> {
        const CONTENT: &[u8] = b"some content to write";
        let (server, _tmp) = test_server().await?;
        let id = test_blob(CONTENT);

        let response = server
            .put(&format!("/api/v1/cas/{id}"))
            .bytes(Bytes::from_static(CONTENT))
            .await;
        response.assert_status(StatusCode::CREATED);

        let check = server
            .method(axum::http::Method::HEAD, &format!("/api/v1/cas/{id}"))
            .await;
        check.assert_status_ok();

        Ok(())
    }

    #[tokio::test]
    async fn write_is_idempotent() -> Result<()> {
        const CONTENT: &[u8] = b"written twice";
        let (server, _tmp) = test_server().await?;
        let id = test_blob(CONTENT);

        for _ in 0..2 {
            let response = server
                .put(&format!("/api/v1/cas/{id}"))
                .bytes(Bytes::from_static(CONTENT))
                .await;
            response.assert_status(StatusCode::CREATED);
        }

        Ok(())
    }
}
