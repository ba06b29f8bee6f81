use serde::{Deserialize, Serialize};

/// Width of the dense sentence embedding.
pub const VECTOR_DIM: usize = 768;
/// Width of each late-interaction token embedding.
pub const COLBERT_DIM: usize = 48;

/// Files larger than this are rejected outright.
pub const MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Chunk records accumulated before a flush is forced.
pub const EMBED_BATCH_SIZE: usize = 256;
/// Pending deletes / metadata entries accumulated before a flush is forced.
pub const BATCH_LIMIT: usize = 64;
/// Metadata cache is snapshotted to disk every this many committed files.
pub const META_SAVE_INTERVAL: usize = 25;

/// Candidate fanout before late-interaction reranking: `max(40, 4·k)`.
pub fn pre_rerank_k(k: usize) -> usize {
    (4 * k).max(40)
}

/// Weight of the MaxSim score in the final blend.
pub const RERANK_ALPHA: f32 = 0.7;
/// Reciprocal-rank-fusion constant.
pub const RRF_K: f32 = 60.0;

/// Hard cap on worker processes regardless of environment overrides.
pub const WORKER_HARD_CAP: usize = 4;
/// A worker whose resident set exceeds this is restarted.
pub const MAX_WORKER_RSS: u64 = 6 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of embedding worker processes. The inference runtime is not
    /// thread-safe across sibling threads, so parallelism is process-level.
    pub worker_count: usize,
    /// How long a request waits for any worker to become ready.
    pub worker_startup_ms: u64,
    /// Per-request timeout; exceeding it forces a worker restart.
    pub task_timeout_ms: u64,
    /// Maximum in-flight embedding tasks during a sync pass.
    pub worker_threads: usize,
    /// Maximum vector rows kept in memory (0 = unlimited).
    pub vector_cache_max: usize,
    /// Store (table) name under the project data directory.
    pub store_name: String,
    /// Embedding model identifier under `~/.osgrep/models/`.
    pub model_id: String,
    /// Prefix prepended to queries before dense encoding.
    pub query_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 1,
            worker_startup_ms: 5_000,
            task_timeout_ms: 60_000,
            worker_threads: 4,
            vector_cache_max: 0,
            store_name: "chunks".to_string(),
            model_id: "mxbai-embed-hybrid".to_string(),
            query_prefix: "Represent this sentence for searching relevant passages: ".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("OSGREP_WORKER_COUNT") {
            if let Ok(v) = val.parse::<usize>() {
                config.worker_count = v.clamp(1, WORKER_HARD_CAP);
            }
        }
        if std::env::var("OSGREP_SINGLE_WORKER").is_ok_and(|v| v == "1" || v == "true") {
            config.worker_count = 1;
        }
        if let Ok(val) = std::env::var("OSGREP_WORKER_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                config.worker_startup_ms = v;
            }
        }
        if let Ok(val) = std::env::var("OSGREP_WORKER_TASK_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                config.task_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("OSGREP_VECTOR_CACHE_MAX") {
            if let Ok(v) = val.parse() {
                config.vector_cache_max = v;
            }
        }
        if let Ok(name) = std::env::var("MXBAI_STORE") {
            if !name.is_empty() {
                config.store_name = name;
            }
        }

        config
    }
}
