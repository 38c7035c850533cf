//! Sending side of a chunked upload.
//!
//! [`UploadClient`] slices a file, hands the chunks to an
//! [`UploadScheduler`] that keeps at most `concurrency` of them in flight,
//! and retries each chunk with linear backoff. The wire is abstracted by
//! [`Transport`]; [`HttpTransport`] and [`ChannelTransport`] are the two
//! bindings.

pub mod channel;
pub mod client;
pub mod config;
pub mod events;
pub mod http;
mod pumps;
pub mod retry;
pub mod scheduler;
pub mod transport;

pub use channel::ChannelTransport;
pub use client::UploadClient;
pub use config::UploaderConfig;
pub use events::UploadEvent;
pub use http::HttpTransport;
pub use retry::RetryPolicy;
pub use scheduler::{UploadError, UploadScheduler};
pub use transport::{ChunkAck, Transport, TransportError, TransportFuture};
