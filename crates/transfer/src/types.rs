use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Byte range of one chunk within its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Zero-based chunk index, `index < total`.
    pub index: u32,
    /// Number of chunks in the upload.
    pub total: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Length of this chunk in bytes.
    pub length: u64,
}

/// A chunk read from its source, ready for transmission.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub range: ChunkRange,
    /// Raw chunk data.
    pub payload: Vec<u8>,
    /// SHA-256 hex checksum of `payload`.
    pub checksum: String,
}

impl ChunkDescriptor {
    pub fn index(&self) -> u32 {
        self.range.index
    }

    pub fn total(&self) -> u32 {
        self.range.total
    }
}

/// The reassembled file produced once every chunk has arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedArtifact {
    pub file_name: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the full content.
    pub content_hash: String,
    /// Where the receiver stored the artifact. Empty when reported by a
    /// remote receiver.
    #[serde(default, skip_serializing_if = "is_empty_path")]
    pub path: PathBuf,
}

fn is_empty_path(p: &PathBuf) -> bool {
    p.as_os_str().is_empty()
}

/// Result of an upload, or of a single chunk on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed(MergedArtifact),
    ChunkAcknowledged(u32),
    Failed(String),
    Cancelled,
}

impl UploadOutcome {
    /// Returns `true` for outcomes that end the upload.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadOutcome::ChunkAcknowledged(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_json_omits_empty_path() {
        let artifact = MergedArtifact {
            file_name: "report.pdf".into(),
            size: 42,
            content_hash: "ab".repeat(32),
            path: PathBuf::new(),
        };
        let json = serde_json::to_string(&artifact).unwrap();
        assert!(json.contains("\"fileName\":\"report.pdf\""));
        assert!(json.contains("\"contentHash\""));
        assert!(!json.contains("path"));

        let parsed: MergedArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, artifact);
    }

    #[test]
    fn terminal_outcomes() {
        assert!(!UploadOutcome::ChunkAcknowledged(3).is_terminal());
        assert!(UploadOutcome::Cancelled.is_terminal());
        assert!(UploadOutcome::Failed("disk full".into()).is_terminal());
    }
}
