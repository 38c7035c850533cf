//! Multipart HTTP binding.

use std::path::PathBuf;

use chunkferry_protocol::constants::{ROUTE_CANCEL, ROUTE_CHUNK, ROUTE_START};
use chunkferry_protocol::{CancelResponse, CancelUploadRequest, ChunkResponse, StartUploadRequest};
use chunkferry_transfer::{ChunkDescriptor, MergedArtifact};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};

use crate::transport::{ChunkAck, Transport, TransportError, TransportFuture};

/// Posts each chunk as a multipart form to `{base_url}/api/upload/chunk`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Creates a transport for a receiver at `base_url`, e.g.
    /// `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.base_url)
    }

    async fn post_chunk(
        &self,
        file_name: &str,
        chunk: &ChunkDescriptor,
    ) -> Result<ChunkAck, TransportError> {
        let data = Part::bytes(chunk.payload.clone()).file_name("blob");
        let form = Form::new()
            .text("fileName", file_name.to_string())
            .text("chunkIndex", chunk.index().to_string())
            .text("totalChunks", chunk.total().to_string())
            .text("chunkChecksum", chunk.checksum.clone())
            .part("chunkData", data);

        let resp = self.client.post(self.url(ROUTE_CHUNK)).multipart(form).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        let body: Option<ChunkResponse> = serde_json::from_str(&text).ok();

        if status.is_success() {
            let body = body.ok_or_else(|| TransportError::Status {
                status: status.as_u16(),
                message: format!("unexpected body: {text}"),
            })?;
            return Ok(if body.completed {
                ChunkAck::Completed(MergedArtifact {
                    file_name: body.file_name.unwrap_or_else(|| file_name.to_string()),
                    size: body.file_size.unwrap_or_default(),
                    content_hash: body.hash.unwrap_or_default(),
                    path: PathBuf::new(),
                })
            } else {
                ChunkAck::Accepted
            });
        }

        let (message, terminal) = match body {
            Some(b) => (b.error.unwrap_or_default(), b.terminal),
            None => (text, false),
        };
        if terminal {
            return Ok(if status == StatusCode::GONE {
                ChunkAck::Cancelled
            } else {
                ChunkAck::Failed(message)
            });
        }
        Err(TransportError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

impl Transport for HttpTransport {
    fn send_chunk<'a>(
        &'a self,
        file_name: &'a str,
        chunk: &'a ChunkDescriptor,
    ) -> TransportFuture<'a, Result<ChunkAck, TransportError>> {
        Box::pin(self.post_chunk(file_name, chunk))
    }

    fn announce<'a>(
        &'a self,
        request: &'a StartUploadRequest,
    ) -> TransportFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(self.url(ROUTE_START))
                .json(request)
                .send()
                .await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ChunkResponse>(&text)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or(text);
            Err(TransportError::Status {
                status: status.as_u16(),
                message,
            })
        })
    }

    fn cancel<'a>(&'a self, file_name: &'a str) -> TransportFuture<'a, Result<bool, TransportError>> {
        Box::pin(async move {
            let request = CancelUploadRequest {
                file_name: file_name.to_string(),
            };
            let resp = self
                .client
                .post(self.url(ROUTE_CANCEL))
                .json(&request)
                .send()
                .await?
                .error_for_status()?;
            let body: CancelResponse = resp.json().await?;
            Ok(body.cancelled)
        })
    }
}
