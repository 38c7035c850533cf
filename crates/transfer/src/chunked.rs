use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::source::FileSource;
use crate::types::{ChunkDescriptor, ChunkRange};

/// Block size used when hashing a whole source.
const HASH_BLOCK: u64 = 1024 * 1024;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 over an entire [`FileSource`], reading it in blocks.
pub fn checksum_source(source: &dyn FileSource) -> Result<String, TransferError> {
    let mut checksum = StreamingChecksum::new();
    let size = source.size();
    let mut offset = 0;
    while offset < size {
        let len = HASH_BLOCK.min(size - offset);
        checksum.update(&source.read_range(offset, len)?);
        offset += len;
    }
    Ok(checksum.finish())
}

/// Incremental SHA-256 that also counts the bytes fed to it.
#[derive(Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consumes the hasher and returns the lowercase hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Reads the bytes of `range` from `source` and checksums them.
pub fn read_chunk(
    source: &dyn FileSource,
    range: ChunkRange,
) -> Result<ChunkDescriptor, TransferError> {
    let payload = source.read_range(range.offset, range.length)?;
    let checksum = checksum_bytes(&payload);
    Ok(ChunkDescriptor {
        range,
        payload,
        checksum,
    })
}
