pub mod constants;
pub mod envelope;
pub mod frame;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use frame::{ChunkFrameHeader, FrameError, encode_chunk_frame, parse_chunk_frame};
pub use messages::{
    CancelResponse, CancelUploadRequest, ChunkResponse, ChunkUploadedEvent, StartUploadRequest,
    UploadCancelledEvent, UploadCompleteEvent, UploadErrorEvent, UploadStartedEvent,
};
