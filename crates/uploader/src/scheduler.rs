//! Bounded-concurrency chunk dispatch with per-chunk retry.

use std::sync::Arc;

use chunkferry_transfer::{ChunkRange, FileSource, MergedArtifact, read_chunk};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::UploadEvent;
use crate::retry::RetryPolicy;
use crate::transport::{ChunkAck, Transport, TransportError};

/// Why an upload did not complete.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("chunk {index} failed after {attempts} attempts: {reason}")]
    Exhausted {
        index: u32,
        attempts: u32,
        reason: String,
    },

    #[error("receiver rejected the upload: {0}")]
    Terminated(String),

    #[error("upload cancelled")]
    Cancelled,

    #[error("failed to read source: {0}")]
    Source(String),

    #[error("upload incomplete: {acknowledged} of {total} chunks acknowledged")]
    Incomplete { acknowledged: u32, total: u32 },
}

/// Dispatches chunks in ascending index order, never more than
/// `concurrency` at a time.
///
/// A chunk that exhausts its attempts, or a terminal rejection from the
/// receiver, stops further dispatch; chunks already in flight are allowed to
/// finish. Cancellation aborts everything in flight.
pub struct UploadScheduler {
    transport: Arc<dyn Transport>,
    concurrency: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl UploadScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        concurrency: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            concurrency: concurrency.max(1),
            retry,
            cancel,
        }
    }

    /// Uploads `ranges` of `source` as `file_name`.
    ///
    /// Returns the merged artifact reported by whichever chunk completed
    /// the upload, or `None` if every chunk was acknowledged without one.
    pub async fn run(
        &self,
        file_name: &str,
        source: Arc<dyn FileSource>,
        ranges: Vec<ChunkRange>,
        events: Option<&mpsc::Sender<UploadEvent>>,
    ) -> Result<Option<MergedArtifact>, UploadError> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let total = ranges.len() as u32;
        let file_name: Arc<str> = Arc::from(file_name);
        let mut queue = ranges.into_iter();
        let mut in_flight = JoinSet::new();

        let mut acknowledged = 0u32;
        let mut artifact = None;
        let mut failure: Option<UploadError> = None;

        loop {
            while failure.is_none() && in_flight.len() < self.concurrency {
                let Some(range) = queue.next() else { break };
                in_flight.spawn(send_with_retry(
                    Arc::clone(&self.transport),
                    Arc::clone(&source),
                    Arc::clone(&file_name),
                    range,
                    self.retry.clone(),
                ));
            }

            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    in_flight.abort_all();
                    while in_flight.join_next().await.is_some() {}
                    return Err(UploadError::Cancelled);
                }
                joined = in_flight.join_next() => joined,
            };
            // Empty set: nothing left to dispatch or wait for.
            let Some(joined) = joined else { break };

            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(UploadError::Source(format!("chunk task failed: {e}"))),
            };

            match result {
                Ok((index, ack)) => match ack {
                    ChunkAck::Accepted | ChunkAck::Completed(_) => {
                        acknowledged += 1;
                        if let ChunkAck::Completed(a) = ack {
                            artifact = Some(a);
                        }
                        debug!(file_name = %file_name, index, acknowledged, total, "chunk acknowledged");
                        if let Some(tx) = events {
                            let _ = tx.try_send(UploadEvent::Progress {
                                file_name: file_name.to_string(),
                                acknowledged,
                                total_chunks: total,
                            });
                        }
                    }
                    ChunkAck::Failed(reason) => {
                        warn!(file_name = %file_name, index, %reason, "receiver failed the upload");
                        failure.get_or_insert(UploadError::Terminated(reason));
                    }
                    ChunkAck::Cancelled => {
                        warn!(file_name = %file_name, index, "receiver cancelled the upload");
                        failure.get_or_insert(UploadError::Cancelled);
                    }
                },
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if acknowledged < total {
            return Err(UploadError::Incomplete {
                acknowledged,
                total,
            });
        }
        Ok(artifact)
    }
}

/// Reads one chunk and sends it until it is acknowledged or out of attempts.
async fn send_with_retry(
    transport: Arc<dyn Transport>,
    source: Arc<dyn FileSource>,
    file_name: Arc<str>,
    range: ChunkRange,
    retry: RetryPolicy,
) -> Result<(u32, ChunkAck), UploadError> {
    let chunk = tokio::task::spawn_blocking(move || read_chunk(source.as_ref(), range))
        .await
        .map_err(|e| UploadError::Source(e.to_string()))?
        .map_err(|e| UploadError::Source(e.to_string()))?;
    let index = chunk.index();
    let attempts = retry.attempts();

    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let result = tokio::time::timeout(
            retry.attempt_timeout(),
            transport.send_chunk(&file_name, &chunk),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));

        match result {
            Ok(ack) => return Ok((index, ack)),
            Err(e) => last_error = e.to_string(),
        }

        if attempt < attempts {
            let delay = retry.delay_after(attempt);
            warn!(
                file_name = %file_name,
                index,
                attempt,
                ?delay,
                error = %last_error,
                "chunk attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    warn!(file_name = %file_name, index, attempts, error = %last_error, "chunk out of attempts");
    Err(UploadError::Exhausted {
        index,
        attempts,
        reason: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportFuture;
    use chunkferry_transfer::{ChunkDescriptor, MemorySource, slice};
    use std::collections::{BTreeSet, HashMap};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records concurrency and attempts; fails as configured.
    #[derive(Default)]
    struct MockTransport {
        delay: Duration,
        /// Fail this many attempts of every chunk before succeeding.
        fail_first: u32,
        always_fail: bool,
        /// Index whose first attempt gets a terminal `Failed` ack.
        terminal_on: Option<u32>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        attempts: Mutex<HashMap<u32, u32>>,
        dispatch_order: Mutex<Vec<u32>>,
        acked: Mutex<BTreeSet<u32>>,
    }

    impl MockTransport {
        fn attempts_for(&self, index: u32) -> u32 {
            self.attempts.lock().unwrap().get(&index).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> u32 {
            self.attempts.lock().unwrap().values().sum()
        }
    }

    impl Transport for MockTransport {
        fn send_chunk<'a>(
            &'a self,
            file_name: &'a str,
            chunk: &'a ChunkDescriptor,
        ) -> TransportFuture<'a, Result<ChunkAck, TransportError>> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);

                let attempt = {
                    let mut attempts = self.attempts.lock().unwrap();
                    let n = attempts.entry(chunk.index()).or_insert(0);
                    *n += 1;
                    *n
                };
                if attempt == 1 {
                    self.dispatch_order.lock().unwrap().push(chunk.index());
                }

                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if self.terminal_on == Some(chunk.index()) {
                    return Ok(ChunkAck::Failed("merge exploded".into()));
                }
                if self.always_fail || attempt <= self.fail_first {
                    return Err(TransportError::Status {
                        status: 500,
                        message: "flaky".into(),
                    });
                }

                let mut acked = self.acked.lock().unwrap();
                acked.insert(chunk.index());
                if acked.len() == chunk.total() as usize {
                    Ok(ChunkAck::Completed(MergedArtifact {
                        file_name: file_name.to_string(),
                        size: 0,
                        content_hash: "done".into(),
                        path: PathBuf::new(),
                    }))
                } else {
                    Ok(ChunkAck::Accepted)
                }
            })
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            attempt_timeout_secs: 5,
        }
    }

    fn source(len: usize) -> (Arc<dyn FileSource>, Vec<ChunkRange>) {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let ranges = slice(len as u64, 10).unwrap();
        (Arc::new(MemorySource::new(data)), ranges)
    }

    fn scheduler(mock: &Arc<MockTransport>, concurrency: usize) -> UploadScheduler {
        UploadScheduler::new(
            Arc::clone(mock) as Arc<dyn Transport>,
            concurrency,
            fast_retry(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let mock = Arc::new(MockTransport {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let (src, ranges) = source(100);

        let artifact = scheduler(&mock, 3)
            .run("f.bin", src, ranges, None)
            .await
            .unwrap();

        assert!(artifact.is_some());
        assert_eq!(mock.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(mock.total_calls(), 10);
    }

    #[tokio::test]
    async fn dispatches_in_ascending_order() {
        let mock = Arc::new(MockTransport::default());
        let (src, ranges) = source(55);

        scheduler(&mock, 1)
            .run("f.bin", src, ranges, None)
            .await
            .unwrap();
        assert_eq!(*mock.dispatch_order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let mock = Arc::new(MockTransport {
            fail_first: 2,
            ..Default::default()
        });
        let (src, ranges) = source(30);

        let result = scheduler(&mock, 3).run("f.bin", src, ranges, None).await;
        assert!(result.unwrap().is_some());
        for index in 0..3 {
            assert_eq!(mock.attempts_for(index), 3);
        }
    }

    #[tokio::test]
    async fn fails_after_exactly_max_attempts() {
        let mock = Arc::new(MockTransport {
            always_fail: true,
            ..Default::default()
        });
        let (src, ranges) = source(100);

        let err = scheduler(&mock, 3)
            .run("f.bin", src, ranges, None)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Exhausted { attempts: 3, .. }));
        // Dispatch stops after the first exhaustion; the other in-flight
        // chunks run out their own attempts.
        assert_eq!(mock.total_calls(), 9);
        for index in 0..3 {
            assert_eq!(mock.attempts_for(index), 3);
        }
        assert_eq!(mock.attempts_for(3), 0);
    }

    #[tokio::test]
    async fn terminal_rejection_is_not_retried() {
        let mock = Arc::new(MockTransport {
            terminal_on: Some(0),
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let (src, ranges) = source(100);

        let err = scheduler(&mock, 2)
            .run("f.bin", src, ranges, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Terminated(ref r) if r == "merge exploded"));
        assert_eq!(mock.attempts_for(0), 1);
        assert!(mock.total_calls() < 10);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight() {
        let mock = Arc::new(MockTransport {
            delay: Duration::from_secs(30),
            ..Default::default()
        });
        let (src, ranges) = source(100);
        let cancel = CancellationToken::new();
        let sched = UploadScheduler::new(
            Arc::clone(&mock) as Arc<dyn Transport>,
            3,
            fast_retry(),
            cancel.clone(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            sched.run("f.bin", src, ranges, None),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
        assert_eq!(mock.total_calls(), 3);
    }

    #[tokio::test]
    async fn progress_events_count_up() {
        let mock = Arc::new(MockTransport::default());
        let (src, ranges) = source(40);
        let (tx, mut rx) = mpsc::channel(16);

        scheduler(&mock, 2)
            .run("f.bin", src, ranges, Some(&tx))
            .await
            .unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let UploadEvent::Progress { acknowledged, .. } = ev {
                seen.push(acknowledged);
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn attempt_timeout_counts_as_failure() {
        let mock = Arc::new(MockTransport {
            delay: Duration::from_secs(3),
            ..Default::default()
        });
        let (src, ranges) = source(5);
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            attempt_timeout_secs: 1,
        };
        let sched = UploadScheduler::new(
            Arc::clone(&mock) as Arc<dyn Transport>,
            1,
            retry,
            CancellationToken::new(),
        );

        let err = sched.run("f.bin", src, ranges, None).await.unwrap_err();
        assert!(
            matches!(err, UploadError::Exhausted { attempts: 2, ref reason, .. } if reason == "request timed out")
        );
    }
}
