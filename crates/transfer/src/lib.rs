//! Chunk slicing, file sources and checksums.
//!
//! Shared by the uploader (which slices and reads) and the receiver (which
//! verifies and reassembles). Nothing here performs network I/O.

mod chunked;
mod slicer;
mod source;
mod types;
mod validation;

pub use chunked::{StreamingChecksum, checksum_bytes, checksum_source, read_chunk};
pub use slicer::slice;
pub use source::{FileSource, LocalFile, MemorySource};
pub use types::{ChunkDescriptor, ChunkRange, MergedArtifact, UploadOutcome};
pub use validation::validate_file_name;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },
}
