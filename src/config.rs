use std::path::PathBuf;

/// Transfer tuning for downloads.
///
/// Responses above this size are streamed instead of buffered; buffering
/// very large files risks memory pressure, while streaming has per-request
/// overhead that is wasted on small files.
pub const STREAM_THRESHOLD_BYTES: u64 = 100_000_000;

/// Read buffer used when streaming file contents or composing archives.
pub const STREAM_BUF_SIZE: usize = 64 * 1024;

/// How often the orphaned-upload sweep runs.
pub const UPLOAD_SWEEP_INTERVAL_SECS: u64 = 300;

/// Runtime configuration, built from CLI arguments in main and passed
/// explicitly into each component at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for task storage and the registry snapshot.
    pub data_dir: PathBuf,
    /// Shared temporary area for chunked-upload session files.
    pub upload_tmp_dir: PathBuf,
    /// Abandoned chunked-upload sessions older than this are deleted.
    pub upload_session_ttl_secs: u64,
    /// Seconds between registry snapshots.
    pub snapshot_interval_secs: u64,
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let upload_tmp_dir = data_dir.join("tmp");
        Self {
            data_dir,
            upload_tmp_dir,
            upload_session_ttl_secs: 24 * 3600,
            snapshot_interval_secs: 60,
        }
    }

    /// Storage root for a single task. Task ids are the sole key here:
    /// no two tasks ever share a root.
    pub fn task_dir(&self, task_id: &uuid::Uuid) -> PathBuf {
        self.data_dir.join("tasks").join(task_id.to_string())
    }

    pub fn images_dir(&self, task_id: &uuid::Uuid) -> PathBuf {
        self.task_dir(task_id).join("images")
    }

    pub fn assets_dir(&self, task_id: &uuid::Uuid) -> PathBuf {
        self.task_dir(task_id).join("assets")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }
}

/// Project ids are opaque scoping keys, but they end up in storage paths
/// and log lines, so restrict them to a sane character set.
pub fn validate_project_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
