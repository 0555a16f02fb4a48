use axum::{Router, routing::get};

use crate::api::State;

pub mod cas;
pub mod health;
pub mod registry;

pub fn router() -> Router<State> {
    Router::new()
        .nest("/cas", cas::router())
        .nest("/registry", registry::router())
        .route("/health", get(health::handle))
}

#[cfg(test)]
mod tests {
    use axum::body::Bytes;
    use axum::http::StatusCode;
    use color_eyre::Result;
    use pretty_assertions::{assert_eq as pretty_assert_eq, assert_ne as pretty_assert_ne};

    use crate::api::test_helpers::{test_blob, test_server};

    #[tokio::test]
    async fn full_client_workflow() -> Result<()> {
        let (server, _tmp) = test_server().await?;

        let blob1_content = b"first blob content";
        let blob2_content = b"second blob content with more data";
        let blob3_content = vec![0xFF; 1024];

        let blob1_id = test_blob(blob1_content);
        let blob2_id = test_blob(blob2_content);
        let blob3_id = test_blob(&blob3_content);

        for (id, content) in [
            (&blob1_id, Bytes::from_static(blob1_content)),
            (&blob2_id, Bytes::from_static(blob2_content)),
            (&blob3_id, Bytes::copy_from_slice(&blob3_content)),
        ] {
            let write_response = server.put(&format!("/api/v1/cas/{id}")).bytes(content).await;
            write_response.assert_status(StatusCode::CREATED);
        }

        let read1 = server.get(&format!("/api/v1/cas/{blob1_id}")).await;
        read1.assert_status_ok();
        pretty_assert_eq!(read1.as_bytes().as_ref(), blob1_content);

        let read2 = server.get(&format!("/api/v1/cas/{blob2_id}")).await;
        read2.assert_status_ok();
        pretty_assert_eq!(read2.as_bytes().as_ref(), blob2_content);

        let read3 = server.get(&format!("/api/v1/cas/{blob3_id}")).await;
        read3.assert_status_ok();
        pretty_assert_eq!(read3.as_bytes().as_ref(), blob3_content.as_slice());

        let new_blob_content = b"blob that doesn't exist yet";
        let new_blob_id = test_blob(new_blob_content);

        let read_nonexistent = server.get(&format!("/api/v1/cas/{new_blob_id}")).await;
        read_nonexistent.assert_status(StatusCode::NOT_FOUND);

        let check_nonexistent = server
            .method(axum::http::Method::HEAD, &format!("/api/v1/cas/{new_blob_id}"))
            .await;
        check_nonexistent.assert_status(StatusCode::NOT_FOUND);

        let write_new = server
            .put(&format!("/api/v1/cas/{new_blob_id}"))
            .bytes(Bytes::from_static(new_blob_content))
            .await;
        write_new.assert_status(StatusCode::CREATED);

        let check_exists = server
            .method(axum::http::Method::HEAD, &format!("/api/v1/cas/{new_blob_id}"))
            .await;
        check_exists.assert_status_ok();

        let read_new = server.get(&format!("/api/v1/cas/{new_blob_id}")).await;
        read_new.assert_status_ok();
        pretty_assert_eq!(read_new.as_bytes().as_ref(), new_blob_content);

        Ok(())
    }

    #[tokio::test]
    async fn request_id_echoed_when_provided() -> Result<()> {
        let (server, _tmp) = test_server().await?;

        let client_request_id = "client-provided-12345";

        let response = server
            .get("/api/v1/health")
            .add_header("x-request-id", client_request_id)
            .await;

        response.assert_status_ok();
        let response_request_id = response
            .headers()
            .get("x-request-id")
            .expect("x-request-id header should be present")
            .to_str()
            .expect("x-request-id should be valid UTF-8");

        pretty_assert_eq!(response_request_id, client_request_id);

        Ok(())
    }

    #[tokio::test]
    async fn request_id_generated_when_not_provided() -> Result<()> {
        let (server, _tmp) = test_server().await?;

        let response1 = server.get("/api/v1/health").await;
        response1.assert_status_ok();
        let request_id1 = response1
            .headers()
            .get("x-request-id")
            .expect("x-request-id header should be present")
            .to_str()
            .expect("x-request-id should be valid UTF-8")
            .to_string();

        let response2 = server.get("/api/v1/health").await;
        response2.assert_status_ok();
        let request_id2 = response2
            .headers()
            .get("x-request-id")
            .expect("x-request-id header should be present")
            .to_str()
            .expect("x-request-id should be valid UTF-8")
            .to_string();

        assert!(
            uuid::Uuid::parse_str(&request_id1).is_ok(),
            "request_id1 should be a valid UUID: {request_id1}"
        );
        assert!(
            uuid::Uuid::parse_str(&request_id2).is_ok(),
            "request_id2 should be a valid UUID: {request_id2}"
        );

        pretty_assert_ne!(
            request_id1,
            request_id2,
            "different requests should get different request ids"
        );

        Ok(())
    }
}
