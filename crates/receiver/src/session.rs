use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chunkferry_transfer::UploadOutcome;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::store::ChunkStore;

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Announced, no chunk yet.
    Created,
    Receiving,
    /// Every chunk is in; one caller is reassembling.
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Still accepting new chunks.
    pub fn is_open(self) -> bool {
        matches!(self, SessionStatus::Created | SessionStatus::Receiving)
    }
}

/// Mutable part of a session, guarded by [`UploadSession::state`].
#[derive(Debug)]
pub struct SessionState {
    /// Authoritative chunk count, fixed by the first chunk or announcement.
    pub total: u32,
    /// Stored chunks, index to SHA-256 hex of the payload.
    pub received: BTreeMap<u32, String>,
    pub status: SessionStatus,
    pub expected_size: Option<u64>,
    pub expected_hash: Option<String>,
    pub last_activity: Instant,
    /// Index of the chunk that completed the set.
    pub final_index: Option<u32>,
}

impl SessionState {
    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total as usize
    }
}

/// One in-progress upload on the receiver.
#[derive(Debug)]
pub struct UploadSession {
    pub id: String,
    pub file_name: String,
    pub store: ChunkStore,
    pub created_at: DateTime<Utc>,
    /// Fired on cancellation; checked before each chunk write and merge step.
    pub cancel: CancellationToken,
    pub state: Mutex<SessionState>,
    /// Outcome of the merge, published once the session settles.
    pub settled: watch::Sender<Option<UploadOutcome>>,
}

impl UploadSession {
    pub fn new(id: String, file_name: String, total: u32, store: ChunkStore) -> Self {
        Self {
            id,
            file_name,
            store,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState {
                total,
                received: BTreeMap::new(),
                status: SessionStatus::Created,
                expected_size: None,
                expected_hash: None,
                last_activity: Instant::now(),
                final_index: None,
            }),
            settled: watch::Sender::new(None),
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            total_chunks: state.total,
            received_chunks: state.received.len(),
            status: state.status,
            created_at: self.created_at,
            idle_for: state.last_activity.elapsed(),
        }
    }
}

/// Point-in-time view of a session for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub received_chunks: usize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub idle_for: Duration,
}
