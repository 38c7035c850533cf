//! Receiving side of a chunked upload.
//!
//! Chunks may arrive in any order, more than once, and from many concurrent
//! callers. The [`SessionRegistry`] records each chunk under its session's
//! lock, and the caller whose chunk completes the set runs the
//! [`MergeEngine`] exactly once. Sessions that are cancelled, go idle, or
//! are left behind by a crash are cleaned up by the lifecycle operations.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod merge;
pub mod registry;
pub mod session;
pub mod store;

pub use config::ReceiverConfig;
pub use error::{MergeError, ReceiveError};
pub use lifecycle::{CancelOutcome, spawn_sweeper};
pub use merge::{Expectation, MergeEngine};
pub use registry::{IncomingChunk, SessionRegistry};
pub use session::{SessionSnapshot, SessionStatus, UploadSession};
pub use store::ChunkStore;
