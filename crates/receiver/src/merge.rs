//! Reassembly of a completed session into its final artifact.

use std::io;
use std::path::{Path, PathBuf};

use chunkferry_transfer::{MergedArtifact, StreamingChecksum};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::error::MergeError;
use crate::session::UploadSession;

/// Copy buffer for streaming chunk files into the output.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Properties the merged output must have, when the upload was announced.
#[derive(Debug, Clone, Default)]
pub struct Expectation {
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

/// Concatenates chunk files in index order and promotes the result.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    output_dir: PathBuf,
    write_hash_sidecar: bool,
}

impl MergeEngine {
    pub fn new(config: &ReceiverConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            write_hash_sidecar: config.write_hash_sidecar,
        }
    }

    /// Merges chunks `0..total` of `session`.
    ///
    /// The output is written to `{fileName}.partial` inside the chunk store
    /// and only renamed to its final name once it is complete and verified.
    /// On success the chunk store is removed. On failure the partial file is
    /// removed and the chunk store is left for the caller to destroy.
    pub async fn merge(
        &self,
        session: &UploadSession,
        total: u32,
        expect: &Expectation,
    ) -> Result<MergedArtifact, MergeError> {
        let partial = session.store.partial_path(&session.file_name);

        let artifact = match self.run(session, total, expect, &partial).await {
            Ok(artifact) => artifact,
            Err(e) => {
                remove_if_exists(&partial).await;
                return Err(e);
            }
        };

        if let Err(e) = session.store.destroy().await {
            warn!(file_id = %session.id, error = %e, "failed to remove chunk store after merge");
        }

        info!(
            file_id = %session.id,
            size = artifact.size,
            hash = %artifact.content_hash,
            path = %artifact.path.display(),
            "upload merged"
        );
        Ok(artifact)
    }

    async fn run(
        &self,
        session: &UploadSession,
        total: u32,
        expect: &Expectation,
        partial: &Path,
    ) -> Result<MergedArtifact, MergeError> {
        let (size, hash) = assemble(session, total, partial).await?;

        if let Some(expected) = expect.size {
            if expected != size {
                return Err(MergeError::SizeMismatch {
                    expected,
                    actual: size,
                });
            }
        }
        if let Some(expected) = &expect.sha256 {
            if !expected.eq_ignore_ascii_case(&hash) {
                return Err(MergeError::HashMismatch {
                    expected: expected.clone(),
                    actual: hash,
                });
            }
        }

        if session.cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }

        let path = self.promote(session, partial, &hash).await?;
        Ok(MergedArtifact {
            file_name: session.file_name.clone(),
            size,
            content_hash: hash,
            path,
        })
    }

    async fn promote(
        &self,
        session: &UploadSession,
        partial: &Path,
        hash: &str,
    ) -> io::Result<PathBuf> {
        let dir = self.output_dir.join(&session.id);
        tokio::fs::create_dir_all(&dir).await?;

        let target = dir.join(&session.file_name);
        if let Err(e) = tokio::fs::rename(partial, &target).await {
            // Output on another filesystem.
            debug!(error = %e, "rename failed, copying artifact instead");
            tokio::fs::copy(partial, &target).await?;
            tokio::fs::remove_file(partial).await?;
        }

        if self.write_hash_sidecar {
            tokio::fs::write(sidecar_path(&target), hash).await?;
        }
        Ok(target)
    }

    /// Deletes a promoted artifact and its sidecar.
    ///
    /// Used when a cancellation wins the race against a merge that had
    /// already promoted its output.
    pub async fn discard(&self, artifact: &MergedArtifact) {
        remove_if_exists(&artifact.path).await;
        remove_if_exists(&sidecar_path(&artifact.path)).await;
        if let Some(dir) = artifact.path.parent() {
            let _ = tokio::fs::remove_dir(dir).await;
        }
    }
}

async fn assemble(
    session: &UploadSession,
    total: u32,
    partial: &Path,
) -> Result<(u64, String), MergeError> {
    let mut out = tokio::fs::File::create(partial).await?;
    let mut checksum = StreamingChecksum::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    for index in 0..total {
        let mut chunk = match tokio::fs::File::open(session.store.chunk_path(index)).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MergeError::MissingChunk(index));
            }
            Err(e) => return Err(e.into()),
        };

        loop {
            if session.cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
            let n = chunk.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            checksum.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
        }
    }

    out.flush().await?;
    out.sync_all().await?;

    let size = checksum.bytes();
    Ok((size, checksum.finish()))
}

fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".hash");
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}
