//! Error types for the receiver.

/// Why a chunk was rejected.
///
/// Terminal errors end the upload. The rest describe the request itself or
/// a local I/O failure, and the sender may try the chunk again.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("chunk index {index} out of range for {total} chunks")]
    InvalidIndex { index: i64, total: u32 },

    #[error("total chunk count must be positive")]
    InvalidTotal,

    #[error("total chunk count {got} conflicts with {expected} already recorded")]
    InconsistentTotal { expected: u32, got: u32 },

    #[error("checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("session {0} failed")]
    SessionFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReceiveError {
    /// Whether the whole upload is over.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReceiveError::SessionClosed(_) | ReceiveError::SessionFailed(_)
        )
    }
}

/// Reassembly failures. Reported to the uploader as a failed outcome.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("I/O error during merge: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk {0} missing from store")]
    MissingChunk(u32),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("merge cancelled")]
    Cancelled,
}
