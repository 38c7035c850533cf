//! Persistent WebSocket binding.
//!
//! Every connection gets a random token and its sessions are registered as
//! `{token}_{fileName}`. Text messages carry control requests, binary
//! frames carry chunks; each reply echoes the request id. When the
//! connection ends, whatever it left unfinished is cancelled.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use chunkferry_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT};
use chunkferry_protocol::{
    CancelUploadRequest, ChunkFrameHeader, ChunkUploadedEvent, Message, MessageType,
    StartUploadRequest, UploadCancelledEvent, UploadCompleteEvent, UploadErrorEvent,
    UploadStartedEvent, parse_chunk_frame,
};
use chunkferry_receiver::{CancelOutcome, Expectation, IncomingChunk, ReceiveError, SessionRegistry};
use chunkferry_transfer::UploadOutcome;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::token::generate_connection_token;
use crate::{EndpointError, SEND_BUFFER_SIZE};

/// The channel endpoint. Accepts any number of concurrent connections.
pub struct ChannelServer {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ChannelServer {
    pub fn new(addr: SocketAddr, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            registry,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the bound address. Only available after [`run`](Self::run)
    /// binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), EndpointError> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!(%local_addr, "channel endpoint listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("channel endpoint shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => error!("accept error: {e}"),
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), EndpointError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let token = generate_connection_token();
        info!(%peer_addr, %token, "channel connection established");

        let (sink, stream) = ws_stream.split();
        let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
        let cancel = self.cancel.child_token();
        let write_handle = tokio::spawn(write_pump(sink, rx, cancel.clone()));

        let mut conn = Connection {
            token,
            registry: Arc::clone(&self.registry),
            sender: Sender { tx },
            sessions: HashSet::new(),
            tasks: JoinSet::new(),
        };
        conn.read_pump(stream, &cancel).await;
        cancel.cancel();
        conn.close().await;
        let _ = write_handle.await;

        info!(%peer_addr, "channel connection closed");
        Ok(())
    }
}

// ============================================================================
// Sending
// ============================================================================

/// Cloneable handle to a connection's write pump.
#[derive(Clone)]
struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    fn reply<T: Serialize>(
        &self,
        req: &Message,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<(), SendError> {
        let msg = req.reply(msg_type, payload).map_err(|_| SendError)?;
        self.send_msg(msg)
    }

    fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
struct SendError;

/// Drains the send channel and pings the client every [`WS_PING_PERIOD`].
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(ws_msg) = msg else { break };
                if let Err(e) = sink.send(ws_msg).await {
                    error!("write pump send error: {e}");
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

// ============================================================================
// Connection
// ============================================================================

/// Per-connection state, owned by the read pump.
struct Connection {
    token: String,
    registry: Arc<SessionRegistry>,
    sender: Sender,
    /// Session ids this connection may still have to cancel.
    sessions: HashSet<String>,
    /// In-flight chunk handlers. Each yields the session id when its chunk
    /// ended the upload.
    tasks: JoinSet<Option<String>>,
}

impl Connection {
    fn file_id(&self, file_name: &str) -> String {
        format!("{}_{file_name}", self.token)
    }

    async fn read_pump<S>(&mut self, mut stream: S, cancel: &CancellationToken)
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
        pong_deadline.reset();
        let mut heard = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.reap(joined);
                }

                _ = pong_deadline.tick() => {
                    if !heard {
                        warn!(token = %self.token, "pong timeout, closing connection");
                        break;
                    }
                    heard = false;
                }

                frame = stream.next() => {
                    let ws_msg = match frame {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            warn!(token = %self.token, "read pump error: {e}");
                            break;
                        }
                        None => break,
                    };
                    heard = true;
                    match ws_msg {
                        WsMessage::Text(text) => self.dispatch_text(&text).await,
                        WsMessage::Binary(data) => self.dispatch_binary(&data),
                        WsMessage::Ping(data) => {
                            let _ = self.sender.tx.try_send(WsMessage::Pong(data));
                        }
                        WsMessage::Pong(_) => pong_deadline.reset(),
                        WsMessage::Close(_) => {
                            debug!(token = %self.token, "received close frame");
                            break;
                        }
                        WsMessage::Frame(_) => {}
                    }
                }
            }
        }
    }

    async fn dispatch_text(&mut self, text: &str) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                error!("invalid message JSON: {e}");
                return;
            }
        };

        match msg.msg_type {
            MessageType::StartUpload => self.start_upload(&msg).await,
            MessageType::CancelUpload => self.cancel_upload(&msg).await,
            other => {
                warn!(msg_type = ?other, "unhandled message type");
                let _ = self.sender.send_error(&msg, 501, "unknown message type");
            }
        }
    }

    async fn start_upload(&mut self, msg: &Message) {
        let req: StartUploadRequest = match msg.payload_as() {
            Ok(r) => r,
            Err(e) => {
                let _ = self.sender.send_error(msg, 400, &format!("invalid payload: {e}"));
                return;
            }
        };

        let file_id = self.file_id(&req.file_name);
        self.sessions.insert(file_id.clone());
        let expect = Expectation {
            size: Some(req.size),
            sha256: req.sha256,
        };
        match self
            .registry
            .announce(&file_id, &req.file_name, req.total_chunks, expect)
            .await
        {
            Ok(()) => {
                let _ = self
                    .sender
                    .reply(msg, MessageType::UploadStarted, &UploadStartedEvent { file_id });
            }
            Err(e) => {
                warn!(file_id, "start_upload rejected: {e}");
                let _ = self.sender.send_error(msg, error_code(&e), &e.to_string());
            }
        }
    }

    async fn cancel_upload(&mut self, msg: &Message) {
        let req: CancelUploadRequest = match msg.payload_as() {
            Ok(r) => r,
            Err(e) => {
                let _ = self.sender.send_error(msg, 400, &format!("invalid payload: {e}"));
                return;
            }
        };

        let file_id = self.file_id(&req.file_name);
        let _ = match self.registry.cancel(&file_id).await {
            CancelOutcome::Cancelled => {
                self.sessions.remove(&file_id);
                self.sender.reply(
                    msg,
                    MessageType::UploadCancelled,
                    &UploadCancelledEvent {
                        file_name: req.file_name,
                    },
                )
            }
            CancelOutcome::NotFound => self.sender.send_error(msg, 404, "upload not found"),
            CancelOutcome::AlreadyCompleted => {
                self.sender.send_error(msg, 409, "upload already completed")
            }
        };
    }

    /// Hands a chunk frame to the registry on its own task so a merge does
    /// not stall the read pump.
    fn dispatch_binary(&mut self, data: &[u8]) {
        let (header, payload) = match parse_chunk_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                error!(token = %self.token, "failed to parse chunk frame: {e}");
                return;
            }
        };

        let file_id = self.file_id(&header.file_name);
        self.sessions.insert(file_id.clone());
        let chunk = IncomingChunk {
            file_id: file_id.clone(),
            file_name: header.file_name.clone(),
            index: header.chunk_index,
            total: header.total_chunks,
            payload,
            checksum: header.checksum.clone(),
        };

        let registry = Arc::clone(&self.registry);
        let sender = self.sender.clone();
        self.tasks.spawn(async move {
            let result = registry.on_chunk_received(chunk).await;
            if let Err(e) = &result {
                warn!(file_name = %header.file_name, index = header.chunk_index, "chunk rejected: {e}");
            }
            let finished = match &result {
                Ok(outcome) => outcome.is_terminal(),
                Err(e) => e.is_terminal(),
            };
            match chunk_reply(&header, result) {
                Ok(reply) => {
                    let _ = sender.send_msg(reply);
                }
                Err(e) => error!("failed to encode chunk reply: {e}"),
            }
            finished.then_some(file_id)
        });
    }

    /// Forgets a session once one of its chunks ended the upload.
    fn reap(&mut self, joined: Result<Option<String>, JoinError>) {
        match joined {
            Ok(Some(file_id)) => {
                self.sessions.remove(&file_id);
            }
            Ok(None) => {}
            Err(e) => error!(token = %self.token, "chunk handler failed: {e}"),
        }
    }

    /// Waits for in-flight chunks, then cancels every session this
    /// connection left unfinished.
    async fn close(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            self.reap(joined);
        }
        let cancelled = self
            .registry
            .cancel_all(&self.sessions, "connection closed")
            .await;
        if cancelled > 0 {
            info!(token = %self.token, cancelled, "cancelled unfinished uploads");
        }
    }
}

/// Builds the reply to a chunk frame.
fn chunk_reply(
    header: &ChunkFrameHeader,
    result: Result<UploadOutcome, ReceiveError>,
) -> Result<Message, serde_json::Error> {
    let id = header.id.as_str();
    match result {
        Ok(UploadOutcome::ChunkAcknowledged(chunk_index)) => Message::new(
            id,
            MessageType::ChunkUploaded,
            Some(&ChunkUploadedEvent { chunk_index }),
        ),
        Ok(UploadOutcome::Completed(artifact)) => Message::new(
            id,
            MessageType::UploadComplete,
            Some(&UploadCompleteEvent {
                file_name: artifact.file_name,
                file_size: artifact.size,
                hash: artifact.content_hash,
            }),
        ),
        Ok(UploadOutcome::Cancelled) => Message::new(
            id,
            MessageType::UploadCancelled,
            Some(&UploadCancelledEvent {
                file_name: header.file_name.clone(),
            }),
        ),
        Ok(UploadOutcome::Failed(message)) => upload_error(id, message, true),
        Err(e) => upload_error(id, e.to_string(), e.is_terminal()),
    }
}

fn upload_error(id: &str, message: String, terminal: bool) -> Result<Message, serde_json::Error> {
    Message::new(
        id,
        MessageType::UploadError,
        Some(&UploadErrorEvent { message, terminal }),
    )
}

/// HTTP-style code for an `error` reply to a control request.
fn error_code(err: &ReceiveError) -> i32 {
    match err {
        ReceiveError::InconsistentTotal { .. } | ReceiveError::SessionClosed(_) => 409,
        ReceiveError::SessionFailed(_) | ReceiveError::Io(_) => 500,
        _ => 400,
    }
}
