//! Worker-side model runtime: the dense sentence encoder and the
//! late-interaction token encoder, both run through tract with a shared
//! tokenizer.
//!
//! Model assets live under `~/.osgrep/models/<model-id>/` and are fetched
//! once if absent. Everything here is synchronous; the worker process serves
//! one request at a time and the pool provides parallelism across processes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tract_onnx::prelude::*;
use tract_onnx::prelude::tract_ndarray;

use super::maxsim::{self, normalize_l2, quantize_grid};
use super::{CandidateGrid, HybridEmbedding, QueryEmbedding};
use crate::config::{Config, COLBERT_DIM, VECTOR_DIM};
use crate::project;

/// `[Q]` marker token id, inserted after `[CLS]` for query encoding.
pub const QUERY_MARKER_ID: u32 = 50_368;
/// `[D]` marker token id, inserted after `[CLS]` for document encoding.
pub const DOC_MARKER_ID: u32 = 50_369;

/// Longest token sequence fed to either encoder.
const MAX_SEQ_LEN: usize = 512;

const DENSE_MODEL_FILE: &str = "dense.onnx";
const COLBERT_MODEL_FILE: &str = "colbert.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Tokens excluded from MaxSim: ASCII punctuation plus the usual specials.
const SKIPLIST_TOKENS: &[&str] = &[
    "!", "\"", "#", "$", "%", "&", "'", "(", ")", "*", "+", ",", "-", ".", "/", ":", ";", "<",
    "=", ">", "?", "@", "[", "\\", "]", "^", "_", "`", "{", "|", "}", "~", "[CLS]", "[SEP]",
    "[PAD]", "[MASK]", "[UNK]",
];

type OnnxPlan = TypedRunnableModel<TypedModel>;

pub struct ModelRuntime {
    dense: OnnxPlan,
    colbert: OnnxPlan,
    tokenizer: tokenizers::Tokenizer,
    skiplist: HashSet<u32>,
    query_prefix: String,
}

impl ModelRuntime {
    pub fn load(config: &Config) -> Result<Self> {
        let dir = ensure_assets(&config.model_id)?;

        let tokenizer = tokenizers::Tokenizer::from_file(dir.join(TOKENIZER_FILE))
            .map_err(|e| anyhow::anyhow!("Load tokenizer: {e}"))?;

        let dense = load_plan(&dir.join(DENSE_MODEL_FILE))?;
        let colbert = load_plan(&dir.join(COLBERT_MODEL_FILE))?;

        // The skiplist is resolved against the tokenizer once per worker.
        let skiplist = SKIPLIST_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();

        Ok(Self {
            dense,
            colbert,
            tokenizer,
            skiplist,
            query_prefix: config.query_prefix.clone(),
        })
    }

    pub fn skiplist(&self) -> &HashSet<u32> {
        &self.skiplist
    }

    /// Document-side hybrid embedding for a batch of chunk texts.
    pub fn compute_hybrid(&self, texts: &[String]) -> Result<Vec<HybridEmbedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let ids = self.token_ids(text, DOC_MARKER_ID)?;
            let dense = self.run_dense(&ids)?;
            let rows = self.run_colbert(&ids)?;
            let (grid, scale) = quantize_grid(&rows);
            let pooled = maxsim::pool_grid(&grid, scale, COLBERT_DIM);
            out.push(HybridEmbedding {
                dense,
                colbert: grid,
                scale,
                pooled,
            });
        }
        Ok(out)
    }

    /// Query-side encoding: dense with the configured prefix, f32 rows with
    /// each row L2-normalized so MaxSim scores are comparable across queries.
    pub fn encode_query(&self, text: &str) -> Result<QueryEmbedding> {
        let prefixed = format!("{}{}", self.query_prefix, text);
        let dense_ids = self.token_ids(&prefixed, QUERY_MARKER_ID)?;
        let dense = self.run_dense(&dense_ids)?;

        let colbert_ids = self.token_ids(text, QUERY_MARKER_ID)?;
        let rows = self.run_colbert(&colbert_ids)?;
        let colbert: Vec<Vec<f32>> = rows.into_iter().map(normalize_l2).collect();

        Ok(QueryEmbedding {
            dense,
            colbert,
            token_ids: colbert_ids,
        })
    }

    /// MaxSim scores for candidate grids against an already-encoded query.
    pub fn rerank(
        &self,
        query: &[Vec<f32>],
        query_token_ids: &[u32],
        candidates: &[CandidateGrid],
    ) -> Vec<f32> {
        candidates
            .iter()
            .map(|c| {
                maxsim::max_sim_quantized(
                    query,
                    query_token_ids,
                    &self.skiplist,
                    &c.colbert,
                    c.scale,
                    COLBERT_DIM,
                )
            })
            .collect()
    }

    /// Tokenize and insert the side marker after `[CLS]`.
    fn token_ids(&self, text: &str, marker: u32) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenize: {e}"))?;
        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        let insert_at = usize::from(!ids.is_empty());
        ids.insert(insert_at, marker);
        ids.truncate(MAX_SEQ_LEN);
        Ok(ids)
    }

    /// Mean-pool the dense encoder's last hidden states, pad to
    /// [`VECTOR_DIM`], L2-normalize.
    fn run_dense(&self, ids: &[u32]) -> Result<Vec<f32>> {
        let view = run_encoder(&self.dense, ids)?;
        let shape = view.shape().to_vec();
        let (seq, hidden) = (shape[1], shape[2]);

        let mut pooled = vec![0.0f32; hidden];
        for t in 0..seq.min(ids.len()) {
            for k in 0..hidden {
                pooled[k] += view[[0, t, k]];
            }
        }
        let count = seq.min(ids.len()).max(1) as f32;
        for v in &mut pooled {
            *v /= count;
        }

        pooled.resize(VECTOR_DIM, 0.0);
        Ok(normalize_l2(pooled))
    }

    /// Per-token rows from the late-interaction encoder.
    fn run_colbert(&self, ids: &[u32]) -> Result<Vec<Vec<f32>>> {
        let view = run_encoder(&self.colbert, ids)?;
        let shape = view.shape().to_vec();
        let (seq, width) = (shape[1], shape[2]);
        if width < COLBERT_DIM {
            bail!("Late-interaction encoder width {width} below {COLBERT_DIM}");
        }

        let mut rows = Vec::with_capacity(seq.min(ids.len()));
        for t in 0..seq.min(ids.len()) {
            let mut row = Vec::with_capacity(COLBERT_DIM);
            for k in 0..COLBERT_DIM {
                row.push(view[[0, t, k]]);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Run one encoder over a single sequence; returns `[1, seq, width]`.
fn run_encoder(plan: &OnnxPlan, ids: &[u32]) -> Result<ndarray::Array3<f32>> {
    let mut input_ids: Vec<i64> = ids.iter().map(|&v| v as i64).collect();
    if input_ids.is_empty() {
        input_ids.push(0);
    }
    let seq = input_ids.len();
    let attention: Vec<i64> = vec![1i64; seq];

    let input_ids = tract_ndarray::Array2::from_shape_vec((1, seq), input_ids)
        .context("input ids shape")?;
    let attention = tract_ndarray::Array2::from_shape_vec((1, seq), attention)
        .context("attention mask shape")?;

    let input_ids_t: Tensor = input_ids.into();
    let attention_t: Tensor = attention.into();
    let result = plan.run(tvec!(input_ids_t.into(), attention_t.into()))?;

    let output = result
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No output tensor"))?;
    let view = output
        .to_array_view::<f32>()
        .map_err(|e| anyhow::anyhow!("Output to array: {e}"))?;
    if view.ndim() != 3 {
        bail!("Unexpected encoder output shape: {:?}", view.shape());
    }
    let shape = view.shape().to_vec();
    let flat: Vec<f32> = view.iter().copied().collect();
    Ok(ndarray::Array3::from_shape_vec((shape[0], shape[1], shape[2]), flat)
        .context("encoder output dimensionality")?)
}

fn load_plan(path: &Path) -> Result<OnnxPlan> {
    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("Load ONNX model {}", path.display()))?
        .into_optimized()
        .context("Optimize model")?
        .into_runnable()
        .context("Build runnable model")
}

/// Ensure model assets exist locally, fetching missing files once.
fn ensure_assets(model_id: &str) -> Result<PathBuf> {
    let dir = project::models_dir(model_id);
    std::fs::create_dir_all(&dir).context("Create models dir")?;

    for file in [DENSE_MODEL_FILE, COLBERT_MODEL_FILE, TOKENIZER_FILE] {
        let target = dir.join(file);
        if target.exists() {
            continue;
        }
        download_asset(model_id, file, &target)
            .with_context(|| format!("Fetch model asset {file} for {model_id}"))?;
    }
    Ok(dir)
}

fn download_asset(model_id: &str, file: &str, target: &Path) -> Result<()> {
    let url = format!("https://huggingface.co/{model_id}/resolve/main/{file}");
    tracing::info!("Fetching model asset {url}");
    let resp = reqwest::blocking::get(&url)
        .with_context(|| format!("Download {url}"))?
        .error_for_status()
        .with_context(|| format!("Download {url}"))?;
    let bytes = resp.bytes().context("Read body")?;

    let tmp = target.with_extension("part");
    std::fs::write(&tmp, &bytes).context("Write asset")?;
    std::fs::rename(&tmp, target).context("Move asset into place")?;
    Ok(())
}
