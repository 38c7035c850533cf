//! Multipart HTTP binding.
//!
//! The session id is the file name itself, so two clients uploading the
//! same name at once share a session.

use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chunkferry_protocol::constants::{ROUTE_CANCEL, ROUTE_CHUNK, ROUTE_START, WS_MAX_MESSAGE_SIZE};
use chunkferry_protocol::{
    CancelResponse, CancelUploadRequest, ChunkResponse, StartUploadRequest, UploadStartedEvent,
};
use chunkferry_receiver::{CancelOutcome, Expectation, IncomingChunk, ReceiveError, SessionRegistry};
use chunkferry_transfer::UploadOutcome;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::EndpointError;

/// Builds the upload routes on top of `registry`.
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route(ROUTE_CHUNK, post(upload_chunk))
        .route(ROUTE_START, post(start_upload))
        .route(ROUTE_CANCEL, post(cancel_upload))
        .layer(DefaultBodyLimit::max(WS_MAX_MESSAGE_SIZE))
        .with_state(registry)
}

/// Serves [`router`] on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) -> Result<(), EndpointError> {
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "http endpoint listening");

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("http endpoint stopped");
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// A rejected request, rendered as a [`ChunkResponse`] error body.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    terminal: bool,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            terminal: false,
        }
    }

    fn terminal(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            terminal: true,
        }
    }
}

impl From<ReceiveError> for ApiError {
    fn from(err: ReceiveError) -> Self {
        let status = match &err {
            ReceiveError::InconsistentTotal { .. } | ReceiveError::SessionClosed(_) => {
                StatusCode::CONFLICT
            }
            ReceiveError::SessionFailed(_) | ReceiveError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ReceiveError::InvalidIndex { .. }
            | ReceiveError::InvalidTotal
            | ReceiveError::ChecksumMismatch { .. }
            | ReceiveError::InvalidFileName(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            terminal: err.is_terminal(),
            message: err.to_string(),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::bad_request(format!("malformed form: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "upload request failed");
        } else {
            debug!(status = %self.status, error = %self.message, "upload request rejected");
        }
        let body = Json(ChunkResponse::rejected(self.message, self.terminal));
        (self.status, body).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/upload/chunk
async fn upload_chunk(
    State(registry): State<Arc<SessionRegistry>>,
    multipart: Multipart,
) -> Result<Json<ChunkResponse>, ApiError> {
    let chunk = read_chunk_form(multipart).await?;

    match registry.on_chunk_received(chunk).await? {
        UploadOutcome::ChunkAcknowledged(_) => Ok(Json(ChunkResponse::acknowledged())),
        UploadOutcome::Completed(artifact) => Ok(Json(ChunkResponse::completed(
            artifact.file_name,
            artifact.size,
            artifact.content_hash,
        ))),
        UploadOutcome::Cancelled => Err(ApiError::terminal(StatusCode::GONE, "upload cancelled")),
        UploadOutcome::Failed(reason) => {
            Err(ApiError::terminal(StatusCode::INTERNAL_SERVER_ERROR, reason))
        }
    }
}

/// POST /api/upload/start
async fn start_upload(
    State(registry): State<Arc<SessionRegistry>>,
    Json(request): Json<StartUploadRequest>,
) -> Result<Json<UploadStartedEvent>, ApiError> {
    let expect = Expectation {
        size: Some(request.size),
        sha256: request.sha256,
    };
    registry
        .announce(&request.file_name, &request.file_name, request.total_chunks, expect)
        .await?;
    Ok(Json(UploadStartedEvent {
        file_id: request.file_name,
    }))
}

/// POST /api/upload/cancel
async fn cancel_upload(
    State(registry): State<Arc<SessionRegistry>>,
    Json(request): Json<CancelUploadRequest>,
) -> Json<CancelResponse> {
    let outcome = registry.cancel(&request.file_name).await;
    debug!(file_name = %request.file_name, ?outcome, "cancel requested over http");
    Json(CancelResponse {
        cancelled: outcome == CancelOutcome::Cancelled,
    })
}

// ============================================================================
// Form parsing
// ============================================================================

async fn read_chunk_form(mut multipart: Multipart) -> Result<IncomingChunk, ApiError> {
    let mut file_name = None;
    let mut index = None;
    let mut total = None;
    let mut payload = None;
    let mut checksum = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "fileName" => file_name = Some(field.text().await?),
            "chunkIndex" => index = Some(int_field(&name, field).await?),
            "totalChunks" => total = Some(int_field(&name, field).await?),
            "chunkChecksum" => checksum = Some(field.text().await?).filter(|c| !c.is_empty()),
            "chunkData" => payload = Some(field.bytes().await?.to_vec()),
            _ => debug!(field = %name, "ignoring unknown form field"),
        }
    }

    let file_name = file_name.ok_or_else(|| missing("fileName"))?;
    let index = index.ok_or_else(|| missing("chunkIndex"))?;
    let total = total.ok_or_else(|| missing("totalChunks"))?;
    let payload = payload.ok_or_else(|| missing("chunkData"))?;

    if total <= 0 {
        return Err(ReceiveError::InvalidTotal.into());
    }
    let total = u32::try_from(total)
        .map_err(|_| ApiError::bad_request(format!("totalChunks {total} is too large")))?;
    let index = u32::try_from(index).map_err(|_| ReceiveError::InvalidIndex { index, total })?;

    Ok(IncomingChunk {
        file_id: file_name.clone(),
        file_name,
        index,
        total,
        payload,
        checksum,
    })
}

async fn int_field(name: &str, field: Field<'_>) -> Result<i64, ApiError> {
    let text = field.text().await?;
    text.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{name} is not an integer: {text:?}")))
}

fn missing(name: &str) -> ApiError {
    ApiError::bad_request(format!("missing form field {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkferry_receiver::ReceiverConfig;
    use chunkferry_transfer::{ChunkDescriptor, ChunkRange, MemorySource, checksum_bytes};
    use chunkferry_uploader::{
        ChunkAck, HttpTransport, RetryPolicy, Transport, UploadClient, UploaderConfig,
    };
    use reqwest::multipart::{Form, Part};
    use tempfile::TempDir;

    struct TestServer {
        base_url: String,
        registry: Arc<SessionRegistry>,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<Result<(), EndpointError>>,
    }

    impl TestServer {
        async fn start(tmp: &TempDir) -> Self {
            let registry = Arc::new(SessionRegistry::new(ReceiverConfig::new(
                tmp.path().join("work"),
                tmp.path().join("out"),
            )));
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let shutdown = CancellationToken::new();
            let handle = tokio::spawn(serve(listener, Arc::clone(&registry), shutdown.clone()));
            Self {
                base_url: format!("http://127.0.0.1:{port}"),
                registry,
                shutdown,
                handle,
            }
        }

        async fn stop(self) {
            self.shutdown.cancel();
            self.handle.await.unwrap().unwrap();
        }

        async fn post_form(&self, form: Form) -> (StatusCode, ChunkResponse) {
            let resp = reqwest::Client::new()
                .post(format!("{}{ROUTE_CHUNK}", self.base_url))
                .multipart(form)
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap())
        }
    }

    fn chunk_form(name: &str, index: &str, total: &str, data: &[u8]) -> Form {
        Form::new()
            .text("fileName", name.to_string())
            .text("chunkIndex", index.to_string())
            .text("totalChunks", total.to_string())
            .part("chunkData", Part::bytes(data.to_vec()).file_name("blob"))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn client_uploads_over_http() {
        let tmp = TempDir::new().unwrap();
        let server = TestServer::start(&tmp).await;

        let transport = Arc::new(HttpTransport::new(&server.base_url).unwrap());
        let config = UploaderConfig {
            chunk_size: 64 * 1024,
            announce: true,
            verify_hash: true,
            retry: RetryPolicy {
                base_delay_ms: 1,
                ..RetryPolicy::default()
            },
            ..UploaderConfig::default()
        };
        let client = UploadClient::new(transport, config);

        let data = pattern(300 * 1024);
        let outcome = client
            .upload(Arc::new(MemorySource::new(data.clone())), "disk.img")
            .await;

        let UploadOutcome::Completed(artifact) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(artifact.size, data.len() as u64);
        assert_eq!(artifact.content_hash, checksum_bytes(&data));

        let stored = server
            .registry
            .config()
            .artifact_dir("disk.img")
            .join("disk.img");
        assert_eq!(std::fs::read(stored).unwrap(), data);
        assert!(server.registry.active_sessions().is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn out_of_order_chunks_complete_on_last_arrival() {
        let tmp = TempDir::new().unwrap();
        let server = TestServer::start(&tmp).await;

        let (status, body) = server.post_form(chunk_form("a.txt", "1", "2", b"world")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.completed);

        let (status, body) = server.post_form(chunk_form("a.txt", "0", "2", b"hello ")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.completed);
        assert_eq!(body.file_name.as_deref(), Some("a.txt"));
        assert_eq!(body.file_size, Some(11));
        assert_eq!(body.hash, Some(checksum_bytes(b"hello world")));

        server.stop().await;
    }

    #[tokio::test]
    async fn rejects_bad_index_and_total() {
        let tmp = TempDir::new().unwrap();
        let server = TestServer::start(&tmp).await;

        let (status, body) = server.post_form(chunk_form("a.bin", "-1", "2", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.terminal);
        assert!(body.error.unwrap().contains("out of range"));

        let (status, _) = server.post_form(chunk_form("a.bin", "2", "2", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = server.post_form(chunk_form("a.bin", "0", "0", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = server.post_form(chunk_form("a.bin", "zero", "2", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = server.post_form(chunk_form("../a.bin", "0", "2", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Nothing above may have created a session.
        assert!(server.registry.active_sessions().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn missing_field_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let server = TestServer::start(&tmp).await;

        let form = Form::new()
            .text("fileName", "a.bin")
            .text("chunkIndex", "0")
            .text("totalChunks", "1");
        let (status, body) = server.post_form(form).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.error.unwrap().contains("chunkData"));

        server.stop().await;
    }

    #[tokio::test]
    async fn checksum_mismatch_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let server = TestServer::start(&tmp).await;

        let form = chunk_form("a.bin", "0", "1", b"payload")
            .text("chunkChecksum", checksum_bytes(b"other"));
        let (status, _) = server.post_form(form).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        server.stop().await;
    }

    #[tokio::test]
    async fn conflicting_total_is_conflict() {
        let tmp = TempDir::new().unwrap();
        let server = TestServer::start(&tmp).await;

        let (status, _) = server.post_form(chunk_form("a.bin", "0", "3", b"x")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = server.post_form(chunk_form("a.bin", "1", "4", b"x")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!body.terminal);

        server.stop().await;
    }

    #[tokio::test]
    async fn announced_size_mismatch_fails_terminally() {
        let tmp = TempDir::new().unwrap();
        let server = TestServer::start(&tmp).await;

        let resp = reqwest::Client::new()
            .post(format!("{}{ROUTE_START}", server.base_url))
            .json(&StartUploadRequest {
                file_name: "a.bin".into(),
                size: 99,
                total_chunks: 1,
                sha256: None,
            })
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let started: UploadStartedEvent = resp.json().await.unwrap();
        assert_eq!(started.file_id, "a.bin");

        let (status, body) = server.post_form(chunk_form("a.bin", "0", "1", b"short")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.terminal);
        assert!(body.error.unwrap().contains("size mismatch"));

        server.stop().await;
    }

    #[test]
    fn closed_sessions_are_terminal_failures() {
        let failed = ApiError::from(ReceiveError::SessionFailed("a.bin".into()));
        assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(failed.terminal);

        let closed = ApiError::from(ReceiveError::SessionClosed("a.bin".into()));
        assert_eq!(closed.status, StatusCode::CONFLICT);
        assert!(closed.terminal);

        let io = ApiError::from(ReceiveError::Io(std::io::Error::other("disk")));
        assert_eq!(io.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!io.terminal);
    }

    #[tokio::test]
    async fn failed_merge_reaches_the_client_as_failed() {
        let tmp = TempDir::new().unwrap();
        let server = TestServer::start(&tmp).await;
        let transport = HttpTransport::new(&server.base_url).unwrap();

        transport
            .announce(&StartUploadRequest {
                file_name: "f.bin".into(),
                size: 99,
                total_chunks: 1,
                sha256: None,
            })
            .await
            .unwrap();
        let chunk = ChunkDescriptor {
            range: ChunkRange {
                index: 0,
                total: 1,
                offset: 0,
                length: 5,
            },
            payload: b"short".to_vec(),
            checksum: checksum_bytes(b"short"),
        };
        let ack = transport.send_chunk("f.bin", &chunk).await.unwrap();
        assert!(matches!(ack, ChunkAck::Failed(reason) if reason.contains("size mismatch")));

        server.stop().await;
    }

    #[tokio::test]
    async fn cancel_route_reports_whether_anything_was_cancelled() {
        let tmp = TempDir::new().unwrap();
        let server = TestServer::start(&tmp).await;

        let (status, _) = server.post_form(chunk_form("a.bin", "0", "2", b"x")).await;
        assert_eq!(status, StatusCode::OK);

        let cancel = |name: &str| {
            reqwest::Client::new()
                .post(format!("{}{ROUTE_CANCEL}", server.base_url))
                .json(&CancelUploadRequest {
                    file_name: name.to_string(),
                })
                .send()
        };
        let first: CancelResponse = cancel("a.bin").await.unwrap().json().await.unwrap();
        assert!(first.cancelled);
        let second: CancelResponse = cancel("a.bin").await.unwrap().json().await.unwrap();
        assert!(!second.cancelled);
        assert!(server.registry.active_sessions().is_empty());

        server.stop().await;
    }
}
