use std::path::PathBuf;
use std::time::Duration;

/// Sessions with no chunk for this long are evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How long a completed upload still answers a resent final chunk.
pub const DEFAULT_COMPLETION_TTL: Duration = Duration::from_secs(10 * 60);

/// How often the background sweeper runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Where the receiver keeps its files and how long sessions may idle.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Working directory; chunk stores live under `{root_dir}/sessions`.
    pub root_dir: PathBuf,
    /// Merged artifacts land in `{output_dir}/{file_id}/{file_name}`.
    pub output_dir: PathBuf,
    /// Write `{file_name}.hash` next to each artifact.
    pub write_hash_sidecar: bool,
    pub idle_timeout: Duration,
    /// Retention of completed-upload records, see [`DEFAULT_COMPLETION_TTL`].
    pub completion_ttl: Duration,
    pub sweep_interval: Duration,
}

impl ReceiverConfig {
    pub fn new(root_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            output_dir: output_dir.into(),
            write_hash_sidecar: true,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            completion_ttl: DEFAULT_COMPLETION_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Parent directory of every session's chunk store.
    pub fn sessions_dir(&self) -> PathBuf {
        self.root_dir.join("sessions")
    }

    /// Directory a completed upload is promoted into.
    pub fn artifact_dir(&self, file_id: &str) -> PathBuf {
        self.output_dir.join(file_id)
    }
}
