//! Cancellation, idle eviction and orphan cleanup.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{SessionRegistry, destroy_store};
use crate::session::{SessionStatus, UploadSession};

/// Result of [`SessionRegistry::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    AlreadyCompleted,
}

impl SessionRegistry {
    /// Cancels the live session registered under `file_id`.
    ///
    /// The session is removed immediately, so a later upload with the same
    /// id starts fresh. Chunk files are deleted here when the session is
    /// still receiving; a running merge notices the token and cleans up
    /// after itself. An upload that already completed is left alone.
    pub async fn cancel(&self, file_id: &str) -> CancelOutcome {
        let Some(session) = self.get(file_id) else {
            if self.is_completed(file_id) {
                return CancelOutcome::AlreadyCompleted;
            }
            return CancelOutcome::NotFound;
        };
        self.cancel_session(&session, "cancel requested").await
    }

    async fn cancel_session(&self, session: &Arc<UploadSession>, reason: &str) -> CancelOutcome {
        let mut state = session.state.lock().await;
        let outcome = match state.status {
            SessionStatus::Completed => CancelOutcome::AlreadyCompleted,
            SessionStatus::Failed | SessionStatus::Cancelled => CancelOutcome::NotFound,
            SessionStatus::Merging => {
                state.status = SessionStatus::Cancelled;
                session.cancel.cancel();
                CancelOutcome::Cancelled
            }
            SessionStatus::Created | SessionStatus::Receiving => {
                state.status = SessionStatus::Cancelled;
                session.cancel.cancel();
                destroy_store(session).await;
                CancelOutcome::Cancelled
            }
        };

        if outcome == CancelOutcome::Cancelled {
            info!(
                file_id = %session.id,
                received = state.received.len(),
                total = state.total,
                reason,
                "upload session cancelled"
            );
            self.remove(session);
        }
        outcome
    }

    /// Cancels every open session idle for at least the configured timeout.
    ///
    /// Returns how many were evicted.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.config().idle_timeout;
        let mut evicted = 0;

        for session in self.sessions() {
            let idle = {
                let state = session.state.lock().await;
                state.status.is_open() && state.last_activity.elapsed() >= idle_timeout
            };
            if idle
                && self.cancel_session(&session, "idle timeout").await == CancelOutcome::Cancelled
            {
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, "idle sessions evicted");
        }
        evicted
    }

    /// Cancels the given sessions, e.g. those owned by a closed connection.
    pub async fn cancel_all<I>(&self, file_ids: I, reason: &str) -> usize
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut cancelled = 0;
        for id in file_ids {
            if let Some(session) = self.get(id.as_ref()) {
                if self.cancel_session(&session, reason).await == CancelOutcome::Cancelled {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    /// Removes entries under the sessions directory that no live session
    /// owns, such as leftovers from a previous run.
    pub async fn purge_orphans(&self) -> io::Result<usize> {
        let sessions_dir = self.config().sessions_dir();
        let mut entries = match tokio::fs::read_dir(&sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        // List first, then snapshot the live set: a session registered after
        // the snapshot cannot own a directory that was already listed.
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            found.push(entry);
        }
        let live: HashSet<_> = self
            .sessions()
            .iter()
            .map(|s| s.store.dir().to_path_buf())
            .collect();

        let mut purged = 0;
        for entry in found {
            let path = entry.path();
            if live.contains(&path) {
                continue;
            }
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => {
                    debug!(path = %path.display(), "removed orphaned upload data");
                    purged += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphan"),
            }
        }

        if purged > 0 {
            info!(purged, "orphaned session directories purged");
        }
        Ok(purged)
    }
}

/// Runs [`SessionRegistry::sweep_idle`],
/// [`SessionRegistry::expire_completed`] and
/// [`SessionRegistry::purge_orphans`] every `sweep_interval` until `shutdown`
/// fires.
pub fn spawn_sweeper(registry: Arc<SessionRegistry>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(registry.config().sweep_interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    registry.sweep_idle().await;
                    registry.expire_completed();
                    if let Err(e) = registry.purge_orphans().await {
                        warn!(error = %e, "orphan purge failed");
                    }
                }
            }
        }
        debug!("session sweeper stopped");
    })
}
