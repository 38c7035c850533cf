//! Persistent WebSocket binding.
//!
//! Chunks travel as binary frames, control requests as JSON text. Every
//! request carries a fresh UUID and the reply is matched by that id, so
//! many chunks can be in flight on one connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chunkferry_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT};
use chunkferry_protocol::{
    CancelUploadRequest, ChunkFrameHeader, Message, MessageType, StartUploadRequest,
    UploadCompleteEvent, UploadErrorEvent, encode_chunk_frame,
};
use chunkferry_transfer::{ChunkDescriptor, MergedArtifact};
use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pumps::{PendingMap, read_pump, write_pump};
use crate::transport::{ChunkAck, Transport, TransportError, TransportFuture};

/// HTTP-style status carried in `error` replies for unknown uploads.
const NOT_FOUND: i32 = 404;

/// A connection to a receiver's channel endpoint.
///
/// The receiver scopes uploads to the connection: dropping it cancels every
/// upload that has not completed.
pub struct ChannelTransport {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl ChannelTransport {
    /// Connects to `url`, e.g. `ws://127.0.0.1:8081`.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(read_pump(
            read,
            Arc::clone(&pending),
            write_tx.clone(),
            cancel.clone(),
        ));

        debug!(url, "channel connected");
        Ok(Self {
            write_tx,
            pending,
            cancel,
            read_handle,
            write_handle,
        })
    }

    /// Sends `frame` and waits for the reply to `id`, for at most `timeout`
    /// when one is given.
    ///
    /// The reply slot is released however the wait ends, including when the
    /// caller drops this future.
    async fn round_trip(
        &self,
        id: String,
        frame: tungstenite::Message,
        timeout: Option<Duration>,
    ) -> Result<Message, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        let _slot = PendingSlot {
            pending: Arc::clone(&self.pending),
            id,
        };

        if self.write_tx.send(frame).await.is_err() {
            return Err(TransportError::Closed);
        }

        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => rx.await,
        };
        reply.map_err(|_| TransportError::Closed)
    }

    async fn request<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Message, TransportError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, Some(payload))?;
        let json = serde_json::to_string(&msg)?;
        self.round_trip(
            id,
            tungstenite::Message::Text(json.into()),
            Some(WS_REQUEST_TIMEOUT),
        )
        .await
    }

    async fn upload_chunk(
        &self,
        file_name: &str,
        chunk: &ChunkDescriptor,
    ) -> Result<ChunkAck, TransportError> {
        let id = uuid::Uuid::new_v4().to_string();
        let header = ChunkFrameHeader {
            id: id.clone(),
            file_name: file_name.to_string(),
            chunk_index: chunk.index(),
            total_chunks: chunk.total(),
            checksum: Some(chunk.checksum.clone()),
        };
        let frame = encode_chunk_frame(&header, &chunk.payload)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        // The scheduler bounds each attempt.
        let reply = self
            .round_trip(id, tungstenite::Message::Binary(frame.into()), None)
            .await?;
        chunk_ack(reply)
    }

    /// Closes the connection. The receiver cancels unfinished uploads.
    pub async fn close(&self) {
        self.cancel.cancel();
    }
}

/// A registered reply slot, removed from the map on drop.
struct PendingSlot {
    pending: PendingMap,
    id: String,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.try_lock() {
            map.remove(&self.id);
            return;
        }
        // The read pump holds the lock; remove once it lets go.
        let pending = Arc::clone(&self.pending);
        let id = std::mem::take(&mut self.id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                pending.lock().await.remove(&id);
            });
        }
    }
}

/// Interprets the reply to a chunk frame.
fn chunk_ack(reply: Message) -> Result<ChunkAck, TransportError> {
    match reply.msg_type {
        MessageType::ChunkUploaded => Ok(ChunkAck::Accepted),
        MessageType::UploadComplete => {
            let done: UploadCompleteEvent = reply.payload_as()?;
            Ok(ChunkAck::Completed(MergedArtifact {
                file_name: done.file_name,
                size: done.file_size,
                content_hash: done.hash,
                path: PathBuf::new(),
            }))
        }
        MessageType::UploadCancelled => Ok(ChunkAck::Cancelled),
        MessageType::UploadError => {
            let err: UploadErrorEvent = reply.payload_as()?;
            if err.terminal {
                Ok(ChunkAck::Failed(err.message))
            } else {
                Err(TransportError::Rejected(err.message))
            }
        }
        _ => Err(rejection(&reply)),
    }
}

fn rejection(reply: &Message) -> TransportError {
    match &reply.error {
        Some(err) => TransportError::Rejected(format!("{} ({})", err.message, err.code)),
        None => TransportError::Rejected(format!("unexpected reply {:?}", reply.msg_type)),
    }
}

impl Transport for ChannelTransport {
    fn send_chunk<'a>(
        &'a self,
        file_name: &'a str,
        chunk: &'a ChunkDescriptor,
    ) -> TransportFuture<'a, Result<ChunkAck, TransportError>> {
        Box::pin(self.upload_chunk(file_name, chunk))
    }

    fn announce<'a>(
        &'a self,
        request: &'a StartUploadRequest,
    ) -> TransportFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let reply = self.request(MessageType::StartUpload, request).await?;
            match reply.msg_type {
                MessageType::UploadStarted => Ok(()),
                _ => Err(rejection(&reply)),
            }
        })
    }

    fn cancel<'a>(&'a self, file_name: &'a str) -> TransportFuture<'a, Result<bool, TransportError>> {
        Box::pin(async move {
            let request = CancelUploadRequest {
                file_name: file_name.to_string(),
            };
            let reply = self.request(MessageType::CancelUpload, &request).await?;
            match (&reply.msg_type, &reply.error) {
                (MessageType::UploadCancelled, _) => Ok(true),
                (MessageType::Error, Some(err)) if err.code == NOT_FOUND => Ok(false),
                _ => Err(rejection(&reply)),
            }
        })
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
    }
}
