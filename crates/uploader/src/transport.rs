//! Transport abstraction between the scheduler and the wire.
//!
//! Keeping the scheduler behind a trait lets it be driven by HTTP, by the
//! WebSocket channel, or by an in-process mock in tests.

use std::future::Future;
use std::pin::Pin;

use chunkferry_protocol::StartUploadRequest;
use chunkferry_transfer::{ChunkDescriptor, MergedArtifact};

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The receiver's verdict on one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// Stored; the upload is not complete yet.
    Accepted,
    /// This chunk completed the upload and the merge succeeded.
    Completed(MergedArtifact),
    /// The merge failed. Retrying is pointless.
    Failed(String),
    /// The receiver cancelled the upload.
    Cancelled,
}

/// A failed attempt. Every variant is retried by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("receiver returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

/// Delivers chunks to a receiver.
pub trait Transport: Send + Sync {
    /// Sends one chunk of `file_name` and waits for the receiver's answer.
    fn send_chunk<'a>(
        &'a self,
        file_name: &'a str,
        chunk: &'a ChunkDescriptor,
    ) -> TransportFuture<'a, Result<ChunkAck, TransportError>>;

    /// Announces an upload before its first chunk.
    fn announce<'a>(
        &'a self,
        request: &'a StartUploadRequest,
    ) -> TransportFuture<'a, Result<(), TransportError>> {
        let _ = request;
        Box::pin(async { Ok(()) })
    }

    /// Asks the receiver to drop a partial upload. Returns whether a live
    /// session was cancelled.
    fn cancel<'a>(&'a self, file_name: &'a str) -> TransportFuture<'a, Result<bool, TransportError>> {
        let _ = file_name;
        Box::pin(async { Ok(false) })
    }
}
