use chunkferry_protocol::constants::DEFAULT_CONCURRENCY;
use chunkferry_transfer::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Settings for [`UploadClient`](crate::UploadClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Chunks in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Send size and SHA-256 ahead of the first chunk so the receiver can
    /// verify the merge.
    pub announce: bool,
    /// Compare the receiver's reported hash with a locally computed one.
    pub verify_hash: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            announce: false,
            verify_hash: false,
        }
    }
}

impl UploaderConfig {
    /// Whether the whole file must be hashed before uploading.
    pub(crate) fn needs_local_hash(&self) -> bool {
        self.announce || self.verify_hash
    }
}
