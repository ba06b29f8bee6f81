//! Two-stage hybrid retrieval: dense ANN and full-text candidates fused with
//! reciprocal-rank fusion, structural boosts, then late-interaction MaxSim
//! reranking over the candidates' quantized grids.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{pre_rerank_k, RERANK_ALPHA, RRF_K};
use crate::embed::maxsim::normalize_l2;
use crate::embed::{CandidateGrid, Embedder, QueryEmbedding};
use crate::error::{Error, Result};
use crate::models::{ChunkRecord, Filter, Provenance, SearchResult};
use crate::store::{CompiledFilter, ScoredRecord, Storage, VectorField};

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub path_prefix: Option<String>,
    pub filter: Option<Filter>,
}

pub struct Retriever<E: Embedder + 'static> {
    storage: Arc<Storage>,
    embedder: Arc<E>,
}

struct Fused {
    record: ChunkRecord,
    fused: f32,
    vector_rank: Option<usize>,
    fts_rank: Option<usize>,
}

impl<E: Embedder + 'static> Retriever<E> {
    pub fn new(storage: Arc<Storage>, embedder: Arc<E>) -> Self {
        Self { storage, embedder }
    }

    /// Hybrid search for the top `k` chunks.
    ///
    /// The secondary `pooled_colbert` index is consulted only as a fallback
    /// when the dense pass returns fewer than `k` candidates. If one
    /// retrieval path fails the other's candidates are still returned, with
    /// a warning; a query that cannot be encoded fails with `SearchFailed`.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(Error::SearchFailed("query is required".to_string()));
        }
        let k = k.max(1);
        let pre_k = pre_rerank_k(k);

        let query_embedding = self
            .embedder
            .encode_query(&query)
            .await
            .map_err(|e| Error::SearchFailed(format!("query encoding failed: {e}")))?;

        // Stage 1: candidate generation, both paths in parallel.
        let vector_hits = {
            let storage = self.storage.clone();
            let dense = query_embedding.dense.clone();
            let filter = compile(options);
            tokio::task::spawn_blocking(move || {
                storage.vector_search(VectorField::Dense, &dense, pre_k, Some(&filter))
            })
        };
        let fts_hits = {
            let storage = self.storage.clone();
            let q = query.clone();
            let filter = compile(options);
            tokio::task::spawn_blocking(move || storage.fts_search(&q, pre_k, Some(&filter)))
        };

        let (vector_hits, fts_hits) = tokio::join!(vector_hits, fts_hits);
        let mut vector_hits = vector_hits
            .map_err(|e| Error::SearchFailed(format!("vector task failed: {e}")))?;
        let fts_result =
            fts_hits.map_err(|e| Error::SearchFailed(format!("fts task failed: {e}")))?;

        let fts_hits = match fts_result {
            Ok(hits) => hits,
            Err(e) => {
                if vector_hits.is_empty() {
                    return Err(Error::SearchFailed(format!("both retrieval paths failed: {e}")));
                }
                tracing::warn!("FTS path failed, returning vector candidates only: {e}");
                Vec::new()
            }
        };

        // Fallback: supplement thin dense results from the pooled grid index.
        if vector_hits.len() < k && !query_embedding.colbert.is_empty() {
            let pooled_query = pooled_query_vector(&query_embedding);
            let filter = compile(options);
            let extra =
                self.storage
                    .vector_search(VectorField::PooledColbert, &pooled_query, pre_k, Some(&filter));
            let known: Vec<Uuid> = vector_hits.iter().map(|h| h.record.id).collect();
            vector_hits.extend(
                extra
                    .into_iter()
                    .filter(|h| !known.contains(&h.record.id)),
            );
        }

        // Stage 2: merge by id, reciprocal-rank fusion.
        let mut fused = fuse(&query, vector_hits, fts_hits);
        fused.sort_by(|a, b| {
            b.fused
                .partial_cmp(&a.fused)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.path.cmp(&b.record.path))
                .then_with(|| a.record.line_start.cmp(&b.record.line_start))
        });
        fused.truncate(pre_k);

        if fused.is_empty() {
            return Ok(Vec::new());
        }

        // Stage 4: MaxSim rerank; degrade to fused order if the pool fails.
        let grids: Vec<CandidateGrid> = fused
            .iter()
            .map(|f| CandidateGrid {
                colbert: f.record.colbert.clone(),
                scale: f.record.colbert_scale,
            })
            .collect();

        let rerank_scores = match self.embedder.rerank(&query_embedding, &grids).await {
            Ok(scores) if scores.len() == fused.len() => Some(scores),
            Ok(scores) => {
                tracing::warn!(
                    "Reranker returned {} scores for {} candidates, ignoring",
                    scores.len(),
                    fused.len()
                );
                None
            }
            Err(e) => {
                tracing::warn!("Rerank failed, returning fused order: {e}");
                None
            }
        };

        let mut scored: Vec<(f32, Option<f32>, Fused)> = match rerank_scores {
            Some(scores) => fused
                .into_iter()
                .zip(scores)
                .map(|(f, ms)| {
                    let final_score = RERANK_ALPHA * ms + (1.0 - RERANK_ALPHA) * f.fused;
                    (final_score, Some(ms), f)
                })
                .collect(),
            None => fused.into_iter().map(|f| (f.fused, None, f)).collect(),
        };

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.2.record.path.cmp(&b.2.record.path))
                .then_with(|| a.2.record.line_start.cmp(&b.2.record.line_start))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (score, rerank_score, f))| SearchResult {
                text: f.record.text,
                path: f.record.path,
                line_start: f.record.line_start,
                line_end: f.record.line_end,
                role: f.record.role,
                defined_symbols: f.record.defined_symbols,
                score,
                rank: i + 1,
                provenance: Provenance {
                    vector_rank: f.vector_rank,
                    fts_rank: f.fts_rank,
                    rerank_score,
                },
            })
            .collect())
    }
}

fn compile(options: &SearchOptions) -> CompiledFilter {
    CompiledFilter::compile(options.filter.as_ref(), options.path_prefix.as_deref())
}

/// Normalized mean of the query's token rows, used against the secondary
/// `pooled_colbert` index.
fn pooled_query_vector(query: &QueryEmbedding) -> Vec<f32> {
    let dim = query.colbert.first().map(|r| r.len()).unwrap_or(0);
    let mut mean = vec![0.0f32; dim];
    for row in &query.colbert {
        for (k, v) in row.iter().enumerate() {
            mean[k] += v;
        }
    }
    let n = query.colbert.len().max(1) as f32;
    for v in &mut mean {
        *v /= n;
    }
    normalize_l2(mean)
}

/// Merge the two candidate lists by chunk id: RRF accumulation plus the
/// structural boosts, keeping the best provenance ranks per id.
fn fuse(query: &str, vector_hits: Vec<ScoredRecord>, fts_hits: Vec<ScoredRecord>) -> Vec<Fused> {
    let question_query = has_question_word(query);
    let mut map: HashMap<Uuid, Fused> = HashMap::new();

    for (rank0, hit) in vector_hits.into_iter().enumerate() {
        let rank = rank0 + 1;
        let rrf = 1.0 / (RRF_K + rank as f32);
        let entry = map.entry(hit.record.id).or_insert_with(|| Fused {
            record: hit.record,
            fused: 0.0,
            vector_rank: None,
            fts_rank: None,
        });
        entry.fused += rrf;
        entry.vector_rank.get_or_insert(rank);
    }

    for (rank0, hit) in fts_hits.into_iter().enumerate() {
        let rank = rank0 + 1;
        let rrf = 1.0 / (RRF_K + rank as f32);
        let entry = map.entry(hit.record.id).or_insert_with(|| Fused {
            record: hit.record,
            fused: 0.0,
            vector_rank: None,
            fts_rank: None,
        });
        entry.fused += rrf;
        entry.fts_rank.get_or_insert(rank);
    }

    let mut fused: Vec<Fused> = map.into_values().collect();
    for f in &mut fused {
        f.fused *= structural_boost(&f.record, question_query);
    }
    fused
}

/// Stage 3 boosts, multiplicative on the fused score.
fn structural_boost(record: &ChunkRecord, question_query: bool) -> f32 {
    let mut boost = 1.0f32;
    if record.kind.is_definition_like() {
        boost *= 1.20;
    }
    if is_test_path(&record.path) {
        boost *= 0.75;
    }
    if is_docs_path(&record.path) {
        boost *= 0.85;
    }
    if record.kind == crate::models::ChunkKind::Anchor && question_query {
        boost *= 1.10;
    }
    boost
}

fn has_question_word(query: &str) -> bool {
    query
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| matches!(w.to_lowercase().as_str(), "how" | "where" | "what" | "why"))
}

fn is_test_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    if lower.starts_with("test/")
        || lower.starts_with("tests/")
        || lower.contains("/test/")
        || lower.contains("/tests/")
        || lower.contains("/__tests__/")
    {
        return true;
    }
    let file = lower.rsplit('/').next().unwrap_or(&lower);
    let stem = file.split('.').next().unwrap_or(file);
    file.contains(".test.") || file.contains(".spec.") || stem.ends_with("_test") || stem.ends_with("_spec")
}

fn is_docs_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.starts_with("docs/") || lower.contains("/docs/") || lower.starts_with("doc/") || lower.contains("/doc/")
}
