//! Embedding inference: the worker-side model runtime, the wire protocol,
//! and the parent-side process pool.
//!
//! Inference runs in separate OS processes so a native fault or OOM in the
//! runtime never takes the host down. The pool implements [`Embedder`]; the
//! syncer and retriever depend only on that trait, which keeps them testable
//! with a deterministic stub.

pub mod maxsim;
pub mod model;
pub mod pool;
pub mod protocol;
pub mod worker;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::ChunkRecord;

/// Document-side output of the hybrid encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridEmbedding {
    /// L2-normalized dense vector, length `VECTOR_DIM`.
    pub dense: Vec<f32>,
    /// Int8 token grid, row-major `[tokens, COLBERT_DIM]`.
    pub colbert: Vec<i8>,
    /// Dequantization factor: true value = `colbert * scale`.
    pub scale: f32,
    /// L2-normalized mean of the dequantized grid.
    pub pooled: Vec<f32>,
}

/// Query-side output: full-precision, un-pooled token rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEmbedding {
    pub dense: Vec<f32>,
    /// One L2-normalized row per query token.
    pub colbert: Vec<Vec<f32>>,
    /// Tokenizer ids matching `colbert` rows; rows whose id is in the
    /// skiplist are excluded from MaxSim.
    pub token_ids: Vec<u32>,
}

/// A stored grid handed back to the pool for reranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateGrid {
    pub colbert: Vec<i8>,
    pub scale: f32,
}

/// The inference seam between orchestration and the worker processes.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Embed document texts: dense + quantized grid + pooled grid each.
    async fn compute_hybrid(&self, texts: &[String]) -> Result<Vec<HybridEmbedding>>;

    /// Encode a query (dense with the configured prefix, f32 token matrix).
    async fn encode_query(&self, text: &str) -> Result<QueryEmbedding>;

    /// MaxSim-score candidate grids against the query matrix.
    async fn rerank(&self, query: &QueryEmbedding, candidates: &[CandidateGrid])
        -> Result<Vec<f32>>;

    /// Chunk and embed one file inside a worker (chunker and encoder stay in
    /// the same process for locality).
    async fn process_file(
        &self,
        path: &str,
        content: &str,
        hash: &str,
    ) -> Result<Vec<ChunkRecord>>;
}
