//! HTTP client for the artifact store's `api/v1/cas` routes.

use std::sync::Arc;

use async_compression::{
    Level,
    tokio::bufread::{ZstdDecoder, ZstdEncoder},
};
use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, eyre},
};
use derive_more::{Debug, Display};
use futures::TryStreamExt;
use reqwest::{Response, StatusCode};
use tap::Pipe;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::instrument;
use url::Url;

use crate::{ArtifactId, ContentType, NETWORK_BUFFER_SIZE, Token};

/// Maximum decompressed size for a single blob (1 GiB).
const MAX_DECOMPRESSED_SIZE: usize = 1024 * 1024 * 1024;

/// Client for the artifact store API.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
#[derive(Clone, Debug, Display)]
#[display("{base}")]
pub struct Client {
    #[debug("{:?}", base.as_str())]
    base: Arc<Url>,

    #[debug(skip)]
    http: reqwest::Client,

    token: Token,
}

impl Client {
    /// Create a new client with the given base URL and authentication token.
    pub fn new(base: Url, token: Token) -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .context("build http client")?;

        Ok(Self {
            base: Arc::new(base),
            http,
            token,
        })
    }

    /// Check that the service is reachable.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        let url = self.base.join("api/v1/health")?;
        let response = self.http.get(url).send().await.context("request")?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Check if an artifact exists.
    #[instrument(skip(self))]
    pub async fn exists(&self, id: &ArtifactId) -> Result<bool> {
        let url = self.base.join(&format!("api/v1/cas/{id}"))?;
        let response = self
            .http
            .head(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Read an artifact as a stream.
    #[instrument(skip(self))]
    pub async fn read(&self, id: &ArtifactId) -> Result<Option<impl AsyncRead + Unpin>> {
        let url = self.base.join(&format!("api/v1/cas/{id}"))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .header(ContentType::ACCEPT, ContentType::BytesZstd.value())
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => response
                .bytes_stream()
                .map_err(std::io::Error::other)
                .pipe(StreamReader::new)
                .pipe(BufReader::new)
                .pipe(ZstdDecoder::new)
                .pipe(Some)
                .pipe(Ok),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Read an artifact into a byte vector.
    #[instrument(skip(self))]
    pub async fn read_bytes(&self, id: &ArtifactId) -> Result<Option<Vec<u8>>> {
        let url = self.base.join(&format!("api/v1/cas/{id}"))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .header(ContentType::ACCEPT, ContentType::BytesZstd.value())
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => {
                let compressed = response.bytes().await.context("read body")?;
                let decompressed = zstd::bulk::decompress(&compressed, MAX_DECOMPRESSED_SIZE)
                    .context("decompress body")?;
                Ok(Some(decompressed))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Write an artifact from a stream.
    #[instrument(skip(self, content))]
    pub async fn write(
        &self,
        id: &ArtifactId,
        content: impl AsyncRead + Unpin + Send + 'static,
    ) -> Result<()> {
        let url = self.base.join(&format!("api/v1/cas/{id}"))?;
        let content = BufReader::new(content);
        let encoder = ZstdEncoder::with_quality(content, Level::Default);
        let stream = ReaderStream::with_capacity(encoder, NETWORK_BUFFER_SIZE);
        let body = reqwest::Body::wrap_stream(stream);

        let response = self
            .http
            .put(url)
            .bearer_auth(self.token.expose())
            .header(ContentType::HEADER, ContentType::BytesZstd.value())
            .body(body)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Write an artifact from bytes already in memory.
    #[instrument(name = "Client::write_bytes", skip(body), fields(body = body.len()))]
    pub async fn write_bytes(&self, id: &ArtifactId, body: Vec<u8>) -> Result<()> {
        let url = self.base.join(&format!("api/v1/cas/{id}"))?;
        let compressed = zstd::bulk::compress(&body, 0).context("compress body")?;
        let response = self
            .http
            .put(url)
            .bearer_auth(self.token.expose())
            .header(ContentType::HEADER, ContentType::BytesZstd.value())
            .body(compressed)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }
}

async fn unexpected_status(status: StatusCode, response: Response) -> color_eyre::Report {
    let url = response.url().to_string();
    let request_id = request_id(&response);
    let body = response.text().await.unwrap_or_default();
    eyre!("unexpected status code: {status}")
        .with_section(|| url.header("Url:"))
        .with_section(|| body.header("Body:"))
        .with_section(|| request_id.header("Request ID:"))
}

fn request_id(response: &Response) -> String {
    response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| String::from("<not set>"))
}
