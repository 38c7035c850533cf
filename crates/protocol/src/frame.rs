//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw payload.

use serde::{Deserialize, Serialize};

/// Header preceding the chunk bytes in a binary frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrameHeader {
    /// Request id echoed back in the reply.
    pub id: String,
    pub file_name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Encodes a chunk frame.
pub fn encode_chunk_frame(
    header: &ChunkFrameHeader,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let header_json =
        serde_json::to_vec(header).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let header_len = u32::try_from(header_json.len()).map_err(|_| FrameError::HeaderTooLarge)?;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Splits a binary frame into its header and payload.
pub fn parse_chunk_frame(data: &[u8]) -> Result<(ChunkFrameHeader, Vec<u8>), FrameError> {
    let Some((len_bytes, rest)) = data.split_first_chunk::<4>() else {
        return Err(FrameError::TooShort);
    };
    let header_len = u32::from_be_bytes(*len_bytes) as usize;

    if rest.len() < header_len {
        return Err(FrameError::HeaderTruncated {
            expected: header_len,
            got: rest.len(),
        });
    }

    let (header_bytes, payload) = rest.split_at(header_len);
    let header: ChunkFrameHeader =
        serde_json::from_slice(header_bytes).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    Ok((header, payload.to_vec()))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("header too large")]
    HeaderTooLarge,

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}
