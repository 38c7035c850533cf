//! Network front ends for a [`SessionRegistry`](chunkferry_receiver::SessionRegistry).
//!
//! Two bindings feed the same registry: a multipart HTTP API served by
//! axum, and a persistent WebSocket channel where chunks travel as binary
//! frames. Channel sessions are namespaced by a per-connection token and
//! cancelled when the connection goes away.

mod channel;
mod http;
mod token;

pub use channel::ChannelServer;
pub use http::{router, serve};
pub use token::generate_connection_token;

/// Outgoing message buffer per channel connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
