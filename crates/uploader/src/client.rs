//! Caller-facing upload service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkferry_protocol::StartUploadRequest;
use chunkferry_protocol::constants::WS_REQUEST_TIMEOUT;
use chunkferry_transfer::{
    FileSource, LocalFile, MergedArtifact, UploadOutcome, checksum_source, slice,
    validate_file_name,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::UploaderConfig;
use crate::events::UploadEvent;
use crate::scheduler::{UploadError, UploadScheduler};
use crate::transport::Transport;

/// Uploads files to one receiver.
///
/// Construct once and share; each call to [`upload`](Self::upload) is an
/// independent upload. Only upload-level outcomes are returned; chunk
/// retries are logged and reported as progress.
pub struct UploadClient {
    transport: Arc<dyn Transport>,
    config: UploaderConfig,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    cancel: CancellationToken,
}

impl UploadClient {
    pub fn new(transport: Arc<dyn Transport>, config: UploaderConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            transport,
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Token that cancels every upload of this client, current and future.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Opens `path` and uploads it under its file name.
    pub async fn upload_path(&self, path: &Path) -> UploadOutcome {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return self
                .fail("", format!("no usable file name in {}", path.display()))
                .await;
        };

        let owned = path.to_path_buf();
        let source = match tokio::task::spawn_blocking(move || LocalFile::open(&owned)).await {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => return self.fail(file_name, e.to_string()).await,
            Err(e) => return self.fail(file_name, e.to_string()).await,
        };
        self.upload(Arc::new(source), file_name).await
    }

    /// Uploads several files one after another.
    pub async fn upload_many(&self, paths: &[PathBuf]) -> Vec<UploadOutcome> {
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            outcomes.push(self.upload_path(path).await);
        }
        outcomes
    }

    /// Uploads `source` as `file_name`.
    pub async fn upload(&self, source: Arc<dyn FileSource>, file_name: &str) -> UploadOutcome {
        if let Err(e) = validate_file_name(file_name) {
            return self.fail(file_name, e.to_string()).await;
        }

        let size = source.size();
        let ranges = match slice(size, self.config.chunk_size) {
            Ok(r) => r,
            Err(e) => return self.fail(file_name, e.to_string()).await,
        };
        let total_chunks = ranges.len() as u32;

        let local_hash = if self.config.needs_local_hash() {
            let source = Arc::clone(&source);
            match tokio::task::spawn_blocking(move || checksum_source(source.as_ref())).await {
                Ok(Ok(hash)) => Some(hash),
                Ok(Err(e)) => return self.fail(file_name, e.to_string()).await,
                Err(e) => return self.fail(file_name, e.to_string()).await,
            }
        } else {
            None
        };

        if self.config.announce {
            let request = StartUploadRequest {
                file_name: file_name.to_string(),
                size,
                total_chunks,
                sha256: local_hash.clone(),
            };
            if let Err(e) = self.transport.announce(&request).await {
                return self
                    .fail(file_name, format!("announce failed: {e}"))
                    .await;
            }
        }

        info!(
            file_name,
            size,
            chunks = total_chunks,
            concurrency = self.config.concurrency,
            "upload started"
        );
        let _ = self.events_tx.try_send(UploadEvent::Started {
            file_name: file_name.to_string(),
            size,
            total_chunks,
        });

        let scheduler = UploadScheduler::new(
            Arc::clone(&self.transport),
            self.config.concurrency,
            self.config.retry.clone(),
            self.cancel.clone(),
        );
        let result = scheduler
            .run(file_name, source, ranges, Some(&self.events_tx))
            .await;

        match result {
            Ok(Some(artifact)) => self.complete(file_name, artifact, local_hash.as_deref()).await,
            Ok(None) => {
                self.fail(
                    file_name,
                    "all chunks acknowledged but the receiver never reported completion".into(),
                )
                .await
            }
            Err(UploadError::Cancelled) => self.cancelled(file_name).await,
            Err(e) => self.fail(file_name, e.to_string()).await,
        }
    }

    async fn complete(
        &self,
        file_name: &str,
        artifact: MergedArtifact,
        local_hash: Option<&str>,
    ) -> UploadOutcome {
        if self.config.verify_hash {
            if let Some(local) = local_hash {
                if !local.eq_ignore_ascii_case(&artifact.content_hash) {
                    return self
                        .fail(
                            file_name,
                            format!(
                                "hash mismatch: local {local}, receiver {}",
                                artifact.content_hash
                            ),
                        )
                        .await;
                }
            }
        }

        info!(file_name, size = artifact.size, hash = %artifact.content_hash, "upload completed");
        let _ = self.events_tx.try_send(UploadEvent::Completed {
            file_name: file_name.to_string(),
            hash: artifact.content_hash.clone(),
        });
        UploadOutcome::Completed(artifact)
    }

    async fn cancelled(&self, file_name: &str) -> UploadOutcome {
        if self.cancel.is_cancelled() {
            // Tell the receiver so it can drop the partial upload now rather
            // than at idle eviction.
            match tokio::time::timeout(WS_REQUEST_TIMEOUT, self.transport.cancel(file_name)).await
            {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(file_name, error = %e, "failed to notify receiver of cancel"),
                Err(_) => warn!(file_name, "timed out notifying receiver of cancel"),
            }
        }

        info!(file_name, "upload cancelled");
        let _ = self.events_tx.try_send(UploadEvent::Cancelled {
            file_name: file_name.to_string(),
        });
        UploadOutcome::Cancelled
    }

    async fn fail(&self, file_name: &str, reason: String) -> UploadOutcome {
        error!(file_name, error = %reason, "upload failed");
        let _ = self.events_tx.try_send(UploadEvent::Failed {
            file_name: file_name.to_string(),
            error: reason.clone(),
        });
        UploadOutcome::Failed(reason)
    }
}
