//! On-disk chunk store for one session.
//!
//! Layout: `{sessions_dir}/{file_id}.{nonce}/{index}.tmp`. The nonce makes
//! every session instance own a distinct directory, so removing a cancelled
//! session's files can never touch a newer session with the same id.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Random suffix length in bytes (8 hex characters).
const NONCE_BYTES: usize = 4;

#[derive(Debug)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    /// Picks a fresh directory for `file_id`. Nothing is created on disk
    /// until the first chunk is written.
    pub fn new(sessions_dir: &Path, file_id: &str) -> Self {
        let nonce: [u8; NONCE_BYTES] = rand::random();
        Self {
            dir: sessions_dir.join(format!("{file_id}.{}", hex::encode(nonce))),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{index}.tmp"))
    }

    /// Merge output before promotion.
    pub fn partial_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(format!("{file_name}.partial"))
    }

    /// Stores a chunk, replacing any earlier copy of the same index.
    ///
    /// Data goes to `{index}.tmp.part` first and is renamed into place, so a
    /// crash mid-write never leaves a truncated `{index}.tmp` behind.
    pub async fn write_chunk(&self, index: u32, data: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let final_path = self.chunk_path(index);
        let part_path = self.dir.join(format!("{index}.tmp.part"));

        let mut file = tokio::fs::File::create(&part_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part_path, &final_path).await
    }

    /// Removes the directory and everything in it. Missing is fine.
    pub async fn destroy(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
