use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{COLBERT_DIM, VECTOR_DIM};
use crate::error::Error;

/// Structural category assigned by the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Function,
    Class,
    Method,
    Module,
    Anchor,
    Block,
    Fallback,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Class => "class",
            ChunkKind::Method => "method",
            ChunkKind::Module => "module",
            ChunkKind::Anchor => "anchor",
            ChunkKind::Block => "block",
            ChunkKind::Fallback => "fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(ChunkKind::Function),
            "class" => Some(ChunkKind::Class),
            "method" => Some(ChunkKind::Method),
            "module" => Some(ChunkKind::Module),
            "anchor" => Some(ChunkKind::Anchor),
            "block" => Some(ChunkKind::Block),
            "fallback" => Some(ChunkKind::Fallback),
            _ => None,
        }
    }

    /// Kinds that name a definition; used by the retriever's structural boost.
    pub fn is_definition_like(&self) -> bool {
        matches!(self, ChunkKind::Function | ChunkKind::Method | ChunkKind::Class)
    }
}

/// Semantic role assigned by the chunker to bias ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkRole {
    Orchestration,
    Definition,
    Implementation,
}

impl ChunkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkRole::Orchestration => "orchestration",
            ChunkRole::Definition => "definition",
            ChunkRole::Implementation => "implementation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "orchestration" => Some(ChunkRole::Orchestration),
            "definition" => Some(ChunkRole::Definition),
            "implementation" => Some(ChunkRole::Implementation),
            _ => None,
        }
    }
}

/// The unit of storage: one embedded chunk of one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Freshly generated per insert; never reused across re-indexes.
    pub id: Uuid,
    /// Repo-relative, forward-slash normalized.
    pub path: String,
    /// Hex SHA-256 of the source file bytes at index time. All chunks of a
    /// file share it.
    pub hash: String,
    /// 1-based inclusive.
    pub line_start: u32,
    pub line_end: u32,
    /// Chunk content with the breadcrumb header prepended.
    pub text: String,
    /// Neighbor excerpts; empty strings at file edges, never null on the wire.
    pub context_prev: String,
    pub context_next: String,
    pub kind: ChunkKind,
    pub role: ChunkRole,
    pub defined_symbols: Vec<String>,
    /// L2-normalized dense embedding, length [`VECTOR_DIM`].
    pub dense: Vec<f32>,
    /// Quantized token grid, row-major `[tokens, COLBERT_DIM]`.
    pub colbert: Vec<i8>,
    /// True token vectors = `colbert[i][j] * colbert_scale`.
    pub colbert_scale: f32,
    /// L2-normalized mean of the dequantized grid, length [`COLBERT_DIM`].
    pub pooled_colbert: Vec<f32>,
}

impl ChunkRecord {
    /// Validates the embedding invariants, naming the offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.dense.len() != VECTOR_DIM {
            return Err(Error::SchemaMismatch {
                field: "dense",
                reason: format!("expected {} floats, got {}", VECTOR_DIM, self.dense.len()),
            });
        }
        if self.dense.iter().any(|v| !v.is_finite()) {
            return Err(Error::SchemaMismatch {
                field: "dense",
                reason: "contains NaN or infinity".to_string(),
            });
        }
        if self.pooled_colbert.len() != COLBERT_DIM {
            return Err(Error::SchemaMismatch {
                field: "pooled_colbert",
                reason: format!(
                    "expected {} floats, got {}",
                    COLBERT_DIM,
                    self.pooled_colbert.len()
                ),
            });
        }
        if !self.colbert.is_empty() && self.colbert.len() % COLBERT_DIM != 0 {
            return Err(Error::SchemaMismatch {
                field: "colbert",
                reason: format!(
                    "grid length {} is not a multiple of {}",
                    self.colbert.len(),
                    COLBERT_DIM
                ),
            });
        }
        if !(self.colbert_scale.is_finite() && self.colbert_scale > 0.0) {
            return Err(Error::SchemaMismatch {
                field: "colbert_scale",
                reason: format!("must be finite and positive, got {}", self.colbert_scale),
            });
        }
        if self.line_start == 0 || self.line_end < self.line_start {
            return Err(Error::SchemaMismatch {
                field: "line_start",
                reason: format!(
                    "line range must be 1-based and ordered, got {}..{}",
                    self.line_start, self.line_end
                ),
            });
        }
        Ok(())
    }
}

/// Change-detection entry kept per repo-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub hash: String,
    pub mtime_ms: u64,
    pub size_bytes: u64,
}

/// Summary returned by a sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Files examined (including skips and per-file failures).
    pub processed: usize,
    /// Files whose chunks were (re-)written this pass.
    pub indexed: usize,
    /// Candidate files discovered by the walk.
    pub total: usize,
    /// False when cancellation or a per-file failure skipped the stale sweep.
    pub complete: bool,
}

/// One comparison in the search filter DSL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterCond {
    pub key: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    StartsWith,
    Contains,
    In,
}

/// Boolean combinators over [`FilterCond`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Not(Box<Filter>),
    #[serde(untagged)]
    Cond(FilterCond),
}

/// Where a result came from before fusion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Provenance {
    /// 1-based rank in the dense ANN list, if present there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_rank: Option<usize>,
    /// 1-based rank in the FTS list, if present there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fts_rank: Option<usize>,
    /// Raw MaxSim score, if the rerank stage ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

/// Final search output record.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub text: String,
    pub path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub role: ChunkRole,
    pub defined_symbols: Vec<String>,
    pub score: f32,
    pub rank: usize,
    pub provenance: Provenance,
}

impl SearchResult {
    /// Coarse confidence bucket relative to the best score in the result set.
    pub fn confidence(&self, best_score: f32) -> &'static str {
        if best_score <= 0.0 {
            return "low";
        }
        let ratio = self.score / best_score;
        if ratio >= 0.85 {
            "high"
        } else if ratio >= 0.5 {
            "medium"
        } else {
            "low"
        }
    }

    /// One-line preview of the chunk body (breadcrumb header skipped).
    pub fn preview(&self) -> String {
        self.text
            .lines()
            .skip(1)
            .find(|l| !l.trim().is_empty())
            .or_else(|| self.text.lines().next())
            .unwrap_or_default()
            .trim()
            .chars()
            .take(120)
            .collect()
    }
}

/// Serialize results as the compact tab-separated format.
pub fn results_to_tsv(results: &[SearchResult]) -> String {
    let best = results.first().map(|r| r.score).unwrap_or(0.0);
    let mut out = String::new();
    for r in results {
        out.push_str(&format!(
            "{}\t{}-{}\t{:.4}\t{}\t{}\t{}\t{}\n",
            r.path,
            r.line_start,
            r.line_end,
            r.score,
            r.role.as_str(),
            r.confidence(best),
            r.defined_symbols.join(","),
            r.preview(),
        ));
    }
    out
}
