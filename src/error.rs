use std::path::PathBuf;

/// Errors surfaced by the indexing and retrieval engine.
///
/// Per-file variants (`FileVanished`, `FileTooLarge`, `FileBinary`) are
/// recorded and skipped; they never abort a sync pass. Flush and schema
/// failures abort the pass with the underlying cause.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("index lock is held by pid {pid} on {host}")]
    LockHeld { pid: u32, host: String },

    #[error("stale index lock from pid {pid} overwritten")]
    LockStale { pid: u32 },

    #[error("file vanished during sync: {0}")]
    FileVanished(PathBuf),

    #[error("file exceeds size limit ({size} bytes): {path}")]
    FileTooLarge { path: PathBuf, size: u64 },

    #[error("binary content: {0}")]
    FileBinary(PathBuf),

    #[error("parse fallback to line windows: {0}")]
    ParseFallback(String),

    #[error("worker {index} restarted while request was in flight")]
    WorkerRestart { index: usize },

    #[error("no embedding worker became ready within {waited_ms} ms")]
    NoWorker { waited_ms: u64 },

    #[error("worker {index} task exceeded {timeout_ms} ms")]
    WorkerTimeout { index: usize, timeout_ms: u64 },

    #[error("worker protocol error: {0}")]
    WorkerProtocol(String),

    #[error("record rejected, field `{field}`: {reason} (a reset may be required: delete the .osgrep directory and re-index)")]
    SchemaMismatch { field: &'static str, reason: String },

    #[error("storage and metadata cache disagree; index was dropped and rebuilt")]
    StorageCorruption,

    #[error("operation cancelled")]
    Cancelled,

    #[error("search failed: {0}")]
    SearchFailed(String),

    #[error("storage error: {0}")]
    Storage(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for per-file conditions that a sync pass records and skips.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            Error::FileVanished(_) | Error::FileTooLarge { .. } | Error::FileBinary(_)
        )
    }
}
