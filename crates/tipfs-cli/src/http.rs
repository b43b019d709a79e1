//! Smart HTTP transport.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::{Client, Response};
use std::io;
use std::time::Duration;
use tipfs_tree::{ByteStream, Transport, TransportError};
use tokio_util::io::StreamReader;
use tracing::debug;

const UPLOAD_PACK_REQUEST: &str = "application/x-git-upload-pack-request";
const UPLOAD_PACK_RESULT: &str = "application/x-git-upload-pack-result";

/// Speaks the git smart HTTP protocol to one repository URL.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Creates a transport for `url`.
    pub fn new(url: &str, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

async fn into_stream(response: Response) -> Result<ByteStream, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let url = response.url().clone();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("{url} returned {status}: {}", body.trim()).into());
    }
    let stream = response.bytes_stream().map_err(io::Error::other);
    Ok(Box::new(StreamReader::new(Box::pin(stream))))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn info_refs(&self) -> Result<ByteStream, TransportError> {
        let url = self.url("info/refs?service=git-upload-pack");
        debug!(%url, "fetching refs");
        let response = self.client.get(&url).send().await?;
        into_stream(response).await
    }

    async fn upload_pack(&self, request: Bytes) -> Result<ByteStream, TransportError> {
        let url = self.url("git-upload-pack");
        debug!(%url, bytes = request.len(), "posting upload-pack request");
        let response = self
            .client
            .post(&url)
            .header("Content-Type", UPLOAD_PACK_REQUEST)
            .header("Accept", UPLOAD_PACK_RESULT)
            .body(request)
            .send()
            .await?;
        into_stream(response).await
    }
}
