use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Chunks in flight per upload.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Attempts per chunk before the upload fails.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base of the linear backoff: attempt `k` waits `k * base` before retrying.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Timeout for a single chunk round trip.
///
/// Generous because the final chunk's round trip includes the merge.
pub const CHUNK_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for text request/response operations.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum WebSocket message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// How often the server pings each connection.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// A connection with no traffic for this long is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Multipart chunk upload route.
pub const ROUTE_CHUNK: &str = "/api/upload/chunk";

/// Optional pre-announcement route.
pub const ROUTE_START: &str = "/api/upload/start";

/// Cancellation route.
pub const ROUTE_CANCEL: &str = "/api/upload/cancel";

/// WebSocket message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Client to server
    #[serde(rename = "start_upload")]
    StartUpload,
    #[serde(rename = "cancel_upload")]
    CancelUpload,

    // Server to client
    #[serde(rename = "upload_started")]
    UploadStarted,
    #[serde(rename = "chunk_uploaded")]
    ChunkUploaded,
    #[serde(rename = "upload_complete")]
    UploadComplete,
    #[serde(rename = "upload_error")]
    UploadError,
    #[serde(rename = "upload_cancelled")]
    UploadCancelled,

    #[serde(rename = "error")]
    Error,
}
