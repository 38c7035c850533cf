use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chunkferry_transfer::{MergedArtifact, UploadOutcome, checksum_bytes, validate_file_name};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ReceiverConfig;
use crate::error::{MergeError, ReceiveError};
use crate::merge::{Expectation, MergeEngine};
use crate::session::{SessionSnapshot, SessionStatus, UploadSession};
use crate::store::ChunkStore;

/// Upper bound on remembered completions; the oldest is forgotten first.
const MAX_COMPLETED_UPLOADS: usize = 1024;

/// A chunk as delivered by either binding.
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    /// Session key. The HTTP binding uses the file name, the channel
    /// binding prefixes it with the connection token.
    pub file_id: String,
    pub file_name: String,
    pub index: u32,
    pub total: u32,
    pub payload: Vec<u8>,
    /// Optional SHA-256 hex of `payload`.
    pub checksum: Option<String>,
}

/// What is left of a session after a successful merge.
///
/// A sender whose acknowledgement was lost resends the chunk after the
/// session is gone. The record recognises such a resend by its digest and
/// answers it instead of opening a new session.
#[derive(Debug, Clone)]
struct CompletedUpload {
    artifact: MergedArtifact,
    total: u32,
    final_index: u32,
    digests: BTreeMap<u32, String>,
    settled_at: Instant,
}

impl CompletedUpload {
    fn answer(&self, index: u32, total: u32, digest: &str) -> Option<UploadOutcome> {
        if self.total != total || self.digests.get(&index).map(String::as_str) != Some(digest) {
            return None;
        }
        Some(if index == self.final_index {
            UploadOutcome::Completed(self.artifact.clone())
        } else {
            UploadOutcome::ChunkAcknowledged(index)
        })
    }
}

enum Lookup {
    Live(Arc<UploadSession>),
    Settled(UploadOutcome),
}

/// All live upload sessions, keyed by file id.
///
/// The map lock is only held to look up, insert or remove a session. All
/// per-chunk work happens under the session's own mutex, so uploads never
/// contend with each other.
///
/// Lock order: `sessions` before `completed`.
pub struct SessionRegistry {
    config: ReceiverConfig,
    merge: MergeEngine,
    sessions: RwLock<HashMap<String, Arc<UploadSession>>>,
    completed: Mutex<HashMap<String, CompletedUpload>>,
}

impl SessionRegistry {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            merge: MergeEngine::new(&config),
            config,
            sessions: RwLock::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Records the expected shape of an upload before its first chunk.
    ///
    /// Creates the session if needed. An existing open session keeps its
    /// chunks but takes the announced size and hash.
    pub async fn announce(
        &self,
        file_id: &str,
        file_name: &str,
        total: u32,
        expect: Expectation,
    ) -> Result<(), ReceiveError> {
        validate_file_name(file_name)
            .map_err(|e| ReceiveError::InvalidFileName(e.to_string()))?;
        if total == 0 {
            return Err(ReceiveError::InvalidTotal);
        }

        let session = {
            let mut map = self.write_map();
            // A new announcement starts a new upload under this id.
            self.completed_map().remove(file_id);
            self.get_or_insert(&mut map, file_id, file_name, total)
        };
        let mut state = session.state.lock().await;
        match state.status {
            SessionStatus::Created | SessionStatus::Receiving => {}
            SessionStatus::Failed => return Err(ReceiveError::SessionFailed(file_id.to_string())),
            SessionStatus::Merging | SessionStatus::Completed | SessionStatus::Cancelled => {
                return Err(ReceiveError::SessionClosed(file_id.to_string()));
            }
        }
        if state.total != total {
            return Err(ReceiveError::InconsistentTotal {
                expected: state.total,
                got: total,
            });
        }

        state.expected_size = expect.size;
        state.expected_hash = expect.sha256;
        state.last_activity = Instant::now();
        info!(file_id, total, size = ?state.expected_size, "upload announced");
        Ok(())
    }

    /// Stores one chunk and, if it completes the set, merges the upload.
    ///
    /// The merge runs once per session. The chunk that completed the set gets
    /// the merge outcome, and so does a resend of that same chunk, whether it
    /// arrives during the merge or after the session was retired. Requests
    /// that are malformed are rejected before any state changes.
    pub async fn on_chunk_received(
        &self,
        chunk: IncomingChunk,
    ) -> Result<UploadOutcome, ReceiveError> {
        let IncomingChunk {
            file_id,
            file_name,
            index,
            total,
            payload,
            checksum,
        } = chunk;

        validate_file_name(&file_name)
            .map_err(|e| ReceiveError::InvalidFileName(e.to_string()))?;
        if total == 0 {
            return Err(ReceiveError::InvalidTotal);
        }
        if index >= total {
            return Err(ReceiveError::InvalidIndex {
                index: index.into(),
                total,
            });
        }
        let digest = checksum_bytes(&payload);
        if let Some(expected) = &checksum {
            if !expected.eq_ignore_ascii_case(&digest) {
                warn!(file_id, index, "chunk checksum mismatch");
                return Err(ReceiveError::ChecksumMismatch { index });
            }
        }

        let session = match self.lookup(&file_id, &file_name, index, total, &digest) {
            Lookup::Live(session) => session,
            Lookup::Settled(outcome) => {
                debug!(file_id, index, "chunk resent after completion");
                return Ok(outcome);
            }
        };
        let mut state = session.state.lock().await;

        match state.status {
            SessionStatus::Created | SessionStatus::Receiving => {}
            SessionStatus::Cancelled => return Ok(UploadOutcome::Cancelled),
            SessionStatus::Merging | SessionStatus::Completed | SessionStatus::Failed
                if state.final_index == Some(index) =>
            {
                let mut settled = session.settled.subscribe();
                drop(state);
                debug!(file_id, index, "final chunk resent, waiting for merge outcome");
                return settled
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|outcome| (*outcome).clone())
                    .ok_or(ReceiveError::SessionClosed(file_id));
            }
            SessionStatus::Merging | SessionStatus::Completed
                if state.received.contains_key(&index) =>
            {
                debug!(file_id, index, "late duplicate chunk");
                return Ok(UploadOutcome::ChunkAcknowledged(index));
            }
            SessionStatus::Failed => return Err(ReceiveError::SessionFailed(file_id)),
            SessionStatus::Merging | SessionStatus::Completed => {
                return Err(ReceiveError::SessionClosed(file_id));
            }
        }

        if state.total != total {
            warn!(file_id, expected = state.total, got = total, "inconsistent chunk total");
            return Err(ReceiveError::InconsistentTotal {
                expected: state.total,
                got: total,
            });
        }
        if session.cancel.is_cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }

        session.store.write_chunk(index, &payload).await?;
        state.received.insert(index, digest);
        state.status = SessionStatus::Receiving;
        state.last_activity = Instant::now();
        debug!(
            file_id,
            index,
            received = state.received.len(),
            total,
            "chunk stored"
        );

        if !state.is_complete() {
            return Ok(UploadOutcome::ChunkAcknowledged(index));
        }

        state.status = SessionStatus::Merging;
        state.final_index = Some(index);
        let expect = Expectation {
            size: state.expected_size,
            sha256: state.expected_hash.clone(),
        };
        drop(state);

        info!(file_id, total, "all chunks received, merging");
        let result = self.merge.merge(&session, total, &expect).await;
        Ok(self.finish(&session, result).await)
    }

    /// Settles a session after its merge and drops it from the registry.
    ///
    /// A successful merge leaves a [`CompletedUpload`] behind, swapped in
    /// under the same map lock that removes the session.
    async fn finish(
        &self,
        session: &Arc<UploadSession>,
        result: Result<MergedArtifact, MergeError>,
    ) -> UploadOutcome {
        let mut state = session.state.lock().await;
        let outcome = match result {
            Ok(artifact) if state.status == SessionStatus::Cancelled => {
                info!(file_id = %session.id, "cancelled during promotion, discarding artifact");
                self.merge.discard(&artifact).await;
                UploadOutcome::Cancelled
            }
            Ok(artifact) => {
                state.status = SessionStatus::Completed;
                UploadOutcome::Completed(artifact)
            }
            Err(MergeError::Cancelled) => {
                state.status = SessionStatus::Cancelled;
                destroy_store(session).await;
                info!(file_id = %session.id, "merge cancelled");
                UploadOutcome::Cancelled
            }
            Err(e) => {
                state.status = SessionStatus::Failed;
                destroy_store(session).await;
                error!(file_id = %session.id, error = %e, "merge failed");
                UploadOutcome::Failed(e.to_string())
            }
        };

        let record = match (&outcome, state.final_index) {
            (UploadOutcome::Completed(artifact), Some(final_index)) => Some(CompletedUpload {
                artifact: artifact.clone(),
                total: state.total,
                final_index,
                digests: state.received.clone(),
                settled_at: Instant::now(),
            }),
            _ => None,
        };
        session.settled.send_replace(Some(outcome.clone()));
        drop(state);

        self.retire(session, record);
        outcome
    }

    /// Finds the session a chunk belongs to.
    ///
    /// With no live session, a chunk identical to one of a remembered
    /// completion is answered from the record. Anything else opens a new
    /// session.
    fn lookup(
        &self,
        file_id: &str,
        file_name: &str,
        index: u32,
        total: u32,
        digest: &str,
    ) -> Lookup {
        if let Some(session) = self.read_map().get(file_id) {
            return Lookup::Live(Arc::clone(session));
        }

        let mut map = self.write_map();
        if !map.contains_key(file_id) {
            if let Some(record) = self.completed_map().get(file_id) {
                if let Some(outcome) = record.answer(index, total, digest) {
                    return Lookup::Settled(outcome);
                }
            }
        }
        Lookup::Live(self.get_or_insert(&mut map, file_id, file_name, total))
    }

    fn get_or_insert(
        &self,
        map: &mut HashMap<String, Arc<UploadSession>>,
        file_id: &str,
        file_name: &str,
        total: u32,
    ) -> Arc<UploadSession> {
        let session = map.entry(file_id.to_string()).or_insert_with(|| {
            let store = ChunkStore::new(&self.config.sessions_dir(), file_id);
            info!(file_id, file_name, total, dir = %store.dir().display(), "upload session created");
            Arc::new(UploadSession::new(
                file_id.to_string(),
                file_name.to_string(),
                total,
                store,
            ))
        });
        Arc::clone(session)
    }

    pub fn get(&self, file_id: &str) -> Option<Arc<UploadSession>> {
        self.read_map().get(file_id).cloned()
    }

    /// Removes `session` if it is still the one registered under its id.
    pub(crate) fn remove(&self, session: &Arc<UploadSession>) {
        self.retire(session, None);
    }

    fn retire(&self, session: &Arc<UploadSession>, record: Option<CompletedUpload>) {
        let mut map = self.write_map();
        if let Some(record) = record {
            let mut completed = self.completed_map();
            completed.insert(session.id.clone(), record);
            if completed.len() > MAX_COMPLETED_UPLOADS {
                let oldest = completed
                    .iter()
                    .min_by_key(|(_, r)| r.settled_at)
                    .map(|(id, _)| id.clone());
                if let Some(id) = oldest {
                    completed.remove(&id);
                }
            }
        }
        if map
            .get(&session.id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            map.remove(&session.id);
        }
    }

    /// Whether `file_id` completed recently enough to still be remembered.
    pub fn is_completed(&self, file_id: &str) -> bool {
        self.completed_map().contains_key(file_id)
    }

    /// Forgets completions older than the configured retention.
    ///
    /// Returns how many were dropped.
    pub fn expire_completed(&self) -> usize {
        let ttl = self.config.completion_ttl;
        let mut completed = self.completed_map();
        let before = completed.len();
        completed.retain(|_, r| r.settled_at.elapsed() < ttl);
        let expired = before - completed.len();
        if expired > 0 {
            debug!(expired, "completed upload records expired");
        }
        expired
    }

    pub async fn snapshot(&self, file_id: &str) -> Option<SessionSnapshot> {
        let session = self.get(file_id)?;
        Some(session.snapshot().await)
    }

    /// Ids of every registered session.
    pub fn active_sessions(&self) -> Vec<String> {
        self.read_map().keys().cloned().collect()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<UploadSession>> {
        self.read_map().values().cloned().collect()
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<UploadSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<UploadSession>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn completed_map(&self) -> MutexGuard<'_, HashMap<String, CompletedUpload>> {
        self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) async fn destroy_store(session: &UploadSession) {
    if let Err(e) = session.store.destroy().await {
        warn!(file_id = %session.id, error = %e, "failed to remove chunk store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkferry_transfer::slice;
    use tempfile::TempDir;

    fn registry(tmp: &TempDir) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(ReceiverConfig::new(
            tmp.path().join("work"),
            tmp.path().join("out"),
        )))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Splits `data` into incoming chunks for `file_name`.
    fn chunks(file_name: &str, data: &[u8], chunk_size: u64) -> Vec<IncomingChunk> {
        slice(data.len() as u64, chunk_size)
            .unwrap()
            .into_iter()
            .map(|r| IncomingChunk {
                file_id: file_name.to_string(),
                file_name: file_name.to_string(),
                index: r.index,
                total: r.total,
                payload: data[r.offset as usize..(r.offset + r.length) as usize].to_vec(),
                checksum: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn completes_regardless_of_arrival_order() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let data = pattern(5_000);
        let parts = chunks("order.bin", &data, 1_000);

        for i in [3, 0, 4, 1] {
            let outcome = reg.on_chunk_received(parts[i].clone()).await.unwrap();
            assert_eq!(outcome, UploadOutcome::ChunkAcknowledged(i as u32));
        }

        let UploadOutcome::Completed(artifact) =
            reg.on_chunk_received(parts[2].clone()).await.unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(artifact.content_hash, checksum_bytes(&data));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), data);
        assert!(reg.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn duplicate_chunk_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let data = pattern(300);
        let parts = chunks("dup.bin", &data, 100);

        reg.on_chunk_received(parts[0].clone()).await.unwrap();
        reg.on_chunk_received(parts[0].clone()).await.unwrap();

        let snap = reg.snapshot("dup.bin").await.unwrap();
        assert_eq!(snap.received_chunks, 1);
        assert_eq!(snap.status, SessionStatus::Receiving);

        reg.on_chunk_received(parts[1].clone()).await.unwrap();
        let outcome = reg.on_chunk_received(parts[2].clone()).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Completed(a) if a.size == 300));
    }

    #[tokio::test]
    async fn concurrent_final_chunks_complete_once() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let data = pattern(8 * 64);
        let parts = chunks("race.bin", &data, 64);

        for part in &parts[..6] {
            reg.on_chunk_received(part.clone()).await.unwrap();
        }

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            for part in &parts[6..] {
                let reg = Arc::clone(&reg);
                let part = part.clone();
                tasks.spawn(async move { reg.on_chunk_received(part).await });
            }
        }

        // Every copy of the chunk that completed the set reports the one
        // merge; copies of the other chunk are plain acknowledgements.
        let mut artifacts = Vec::new();
        let mut acked = 0;
        while let Some(res) = tasks.join_next().await {
            match res.unwrap().unwrap() {
                UploadOutcome::Completed(artifact) => artifacts.push(artifact),
                UploadOutcome::ChunkAcknowledged(_) => acked += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(artifacts.len(), 4);
        assert_eq!(acked, 4);
        assert!(artifacts.iter().all(|a| a == &artifacts[0]));
        assert_eq!(artifacts[0].content_hash, checksum_bytes(&data));
        assert!(reg.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn resent_final_chunk_gets_the_same_completion() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let part = chunks("one.bin", b"single chunk", 1024).remove(0);
        assert_eq!(part.total, 1);

        let UploadOutcome::Completed(first) = reg.on_chunk_received(part.clone()).await.unwrap()
        else {
            panic!("expected completion");
        };
        assert!(reg.is_completed("one.bin"));

        // A second merge would recreate the file.
        std::fs::remove_file(&first.path).unwrap();

        let again = reg.on_chunk_received(part).await.unwrap();
        assert_eq!(again, UploadOutcome::Completed(first.clone()));
        assert!(!first.path.exists());
        assert!(reg.active_sessions().is_empty());
        assert_eq!(
            std::fs::read_dir(reg.config().sessions_dir()).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn different_content_under_a_completed_name_uploads_again() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let old = chunks("v.bin", b"version one", 1024).remove(0);
        let new = chunks("v.bin", b"version two", 1024).remove(0);

        reg.on_chunk_received(old).await.unwrap();
        let UploadOutcome::Completed(artifact) = reg.on_chunk_received(new).await.unwrap() else {
            panic!("expected a fresh completion");
        };
        assert_eq!(artifact.content_hash, checksum_bytes(b"version two"));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"version two");
    }

    #[tokio::test]
    async fn announce_forgets_previous_completion() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let parts = chunks("r.bin", b"abcdef", 3);
        for part in &parts {
            reg.on_chunk_received(part.clone()).await.unwrap();
        }
        assert!(reg.is_completed("r.bin"));

        reg.announce("r.bin", "r.bin", 2, Expectation::default())
            .await
            .unwrap();
        assert!(!reg.is_completed("r.bin"));
        assert_eq!(
            reg.on_chunk_received(parts[1].clone()).await.unwrap(),
            UploadOutcome::ChunkAcknowledged(1)
        );
    }

    #[tokio::test]
    async fn completion_records_expire() {
        let tmp = TempDir::new().unwrap();
        let mut config = ReceiverConfig::new(tmp.path().join("work"), tmp.path().join("out"));
        config.completion_ttl = std::time::Duration::from_millis(20);
        let reg = SessionRegistry::new(config);
        let part = chunks("e.bin", b"x", 1024).remove(0);

        reg.on_chunk_received(part.clone()).await.unwrap();
        assert_eq!(reg.expire_completed(), 0);
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert_eq!(reg.expire_completed(), 1);
        assert!(!reg.is_completed("e.bin"));

        // Without the record the chunk opens a new session and merges again.
        let outcome = reg.on_chunk_received(part).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn rejects_malformed_chunks_without_state_change() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let mut chunk = chunks("bad.bin", b"abcd", 2).remove(0);

        let mut out_of_range = chunk.clone();
        out_of_range.index = 2;
        assert!(matches!(
            reg.on_chunk_received(out_of_range).await,
            Err(ReceiveError::InvalidIndex { index: 2, total: 2 })
        ));

        let mut zero_total = chunk.clone();
        zero_total.total = 0;
        assert!(matches!(
            reg.on_chunk_received(zero_total).await,
            Err(ReceiveError::InvalidTotal)
        ));

        let mut traversal = chunk.clone();
        traversal.file_name = "../etc/passwd".into();
        assert!(matches!(
            reg.on_chunk_received(traversal).await,
            Err(ReceiveError::InvalidFileName(_))
        ));

        chunk.checksum = Some(checksum_bytes(b"not the payload"));
        assert!(matches!(
            reg.on_chunk_received(chunk).await,
            Err(ReceiveError::ChecksumMismatch { index: 0 })
        ));

        assert!(reg.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn first_total_is_authoritative() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let parts = chunks("t.bin", b"abcdef", 2);
        reg.on_chunk_received(parts[0].clone()).await.unwrap();

        let mut conflicting = parts[1].clone();
        conflicting.total = 4;
        assert!(matches!(
            reg.on_chunk_received(conflicting).await,
            Err(ReceiveError::InconsistentTotal {
                expected: 3,
                got: 4
            })
        ));
        assert_eq!(reg.snapshot("t.bin").await.unwrap().received_chunks, 1);
    }

    #[tokio::test]
    async fn matching_chunk_checksum_is_accepted() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let mut chunk = chunks("sum.bin", b"payload", 1024).remove(0);
        chunk.checksum = Some(checksum_bytes(b"payload").to_uppercase());

        let outcome = reg.on_chunk_received(chunk).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn ten_megabytes_in_reverse_order() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let data = pattern(10 * 1024 * 1024);
        let parts = chunks("big.bin", &data, 2 * 1024 * 1024);
        assert_eq!(parts.len(), 5);

        for i in (1..5).rev() {
            assert_eq!(
                reg.on_chunk_received(parts[i].clone()).await.unwrap(),
                UploadOutcome::ChunkAcknowledged(i as u32)
            );
        }

        let UploadOutcome::Completed(artifact) =
            reg.on_chunk_received(parts[0].clone()).await.unwrap()
        else {
            panic!("chunk 0 should complete the upload");
        };
        assert_eq!(artifact.file_name, "big.bin");
        assert_eq!(artifact.size, 10 * 1024 * 1024);
        assert_eq!(artifact.content_hash, checksum_bytes(&data));
    }

    #[tokio::test]
    async fn announced_hash_mismatch_fails_upload() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let parts = chunks("a.bin", b"0123456789", 4);

        reg.announce(
            "a.bin",
            "a.bin",
            3,
            Expectation {
                size: Some(10),
                sha256: Some(checksum_bytes(b"other")),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            reg.snapshot("a.bin").await.unwrap().status,
            SessionStatus::Created
        );

        let mut last = None;
        for part in parts {
            last = Some(reg.on_chunk_received(part).await.unwrap());
        }
        assert!(matches!(last, Some(UploadOutcome::Failed(reason)) if reason.contains("hash mismatch")));
        assert!(reg.active_sessions().is_empty());

        let sessions_dir = reg.config().sessions_dir();
        assert_eq!(std::fs::read_dir(sessions_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn announce_rejects_conflicting_total() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        reg.announce("x.bin", "x.bin", 2, Expectation::default())
            .await
            .unwrap();
        assert!(matches!(
            reg.announce("x.bin", "x.bin", 3, Expectation::default()).await,
            Err(ReceiveError::InconsistentTotal { .. })
        ));
        assert!(matches!(
            reg.announce("y.bin", "y.bin", 0, Expectation::default()).await,
            Err(ReceiveError::InvalidTotal)
        ));
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let a = chunks("a.bin", b"aaaa", 2);
        let b = chunks("b.bin", b"bbbbbb", 2);

        reg.on_chunk_received(a[0].clone()).await.unwrap();
        reg.on_chunk_received(b[0].clone()).await.unwrap();
        let mut ids = reg.active_sessions();
        ids.sort();
        assert_eq!(ids, vec!["a.bin", "b.bin"]);

        assert!(matches!(
            reg.on_chunk_received(a[1].clone()).await.unwrap(),
            UploadOutcome::Completed(_)
        ));
        assert_eq!(reg.active_sessions(), vec!["b.bin"]);
    }
}
