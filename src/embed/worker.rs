//! Worker process entry point: a JSON-lines request loop over stdio.
//!
//! The worker owns the model runtime and the chunker; `process_file`
//! composes both so a file is chunked and embedded without crossing the
//! process boundary per chunk. Requests are served one at a time; the pool
//! gets parallelism by running several workers.

use std::io::{BufRead, Write};

use anyhow::Result;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use uuid::Uuid;

use super::model::ModelRuntime;
use super::protocol::{RequestBody, ResponseBody, WireRequest, WireResponse};
use super::{CandidateGrid, HybridEmbedding, QueryEmbedding};
use crate::chunking;
use crate::config::Config;
use crate::models::ChunkRecord;

/// Inference operations the loop dispatches to. [`ModelRuntime`] is the real
/// implementation; tests drive the loop with a canned backend.
pub trait InferenceBackend {
    fn compute_hybrid(&mut self, texts: &[String]) -> Result<Vec<HybridEmbedding>>;
    fn encode_query(&mut self, text: &str) -> Result<QueryEmbedding>;
    fn rerank(
        &mut self,
        query: &[Vec<f32>],
        query_token_ids: &[u32],
        candidates: &[CandidateGrid],
    ) -> Result<Vec<f32>>;
}

impl InferenceBackend for ModelRuntime {
    fn compute_hybrid(&mut self, texts: &[String]) -> Result<Vec<HybridEmbedding>> {
        ModelRuntime::compute_hybrid(self, texts)
    }

    fn encode_query(&mut self, text: &str) -> Result<QueryEmbedding> {
        ModelRuntime::encode_query(self, text)
    }

    fn rerank(
        &mut self,
        query: &[Vec<f32>],
        query_token_ids: &[u32],
        candidates: &[CandidateGrid],
    ) -> Result<Vec<f32>> {
        Ok(ModelRuntime::rerank(self, query, query_token_ids, candidates))
    }
}

/// Run the worker with the real model runtime on stdio. Exits with an error
/// (and a non-zero status) if the models cannot be loaded; the pool treats
/// that as a dead worker.
pub fn run() -> Result<()> {
    let config = Config::from_env();
    let mut runtime = ModelRuntime::load(&config)?;

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_loop(stdin.lock(), stdout.lock(), &mut runtime)
}

/// Serve requests until stdin closes.
pub fn run_loop<R: BufRead, W: Write, B: InferenceBackend>(
    reader: R,
    mut writer: W,
    backend: &mut B,
) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WireRequest>(&line) {
            Ok(request) => handle(request, backend),
            Err(e) => WireResponse {
                id: Uuid::nil(),
                ok: None,
                err: Some(format!("malformed request: {e}")),
                memory_rss: own_rss(),
            },
        };

        serde_json::to_writer(&mut writer, &response)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    Ok(())
}

fn handle<B: InferenceBackend>(request: WireRequest, backend: &mut B) -> WireResponse {
    let id = request.id;
    let outcome = match request.body {
        RequestBody::ComputeHybrid { texts } => backend
            .compute_hybrid(&texts)
            .map(|embeddings| ResponseBody::Hybrid { embeddings }),
        RequestBody::EncodeQuery { text } => backend
            .encode_query(&text)
            .map(|embedding| ResponseBody::Query { embedding }),
        RequestBody::Rerank {
            query,
            query_token_ids,
            candidates,
        } => backend
            .rerank(&query, &query_token_ids, &candidates)
            .map(|scores| ResponseBody::Scores { scores }),
        RequestBody::ProcessFile {
            path,
            content,
            hash,
        } => process_file(backend, &path, &content, &hash).map(|records| ResponseBody::Chunks {
            records,
        }),
    };

    match outcome {
        Ok(body) => WireResponse {
            id,
            ok: Some(body),
            err: None,
            memory_rss: own_rss(),
        },
        Err(e) => WireResponse {
            id,
            ok: None,
            err: Some(format!("{e:#}")),
            memory_rss: own_rss(),
        },
    }
}

/// Chunk and embed one file; seeds and embeddings stay index-aligned.
pub fn process_file<B: InferenceBackend>(
    backend: &mut B,
    path: &str,
    content: &str,
    hash: &str,
) -> Result<Vec<ChunkRecord>> {
    let seeds = chunking::chunk_file(path, content);
    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = seeds.iter().map(|s| s.text.clone()).collect();
    let embeddings = backend.compute_hybrid(&texts)?;
    if embeddings.len() != seeds.len() {
        anyhow::bail!(
            "encoder returned {} embeddings for {} chunks",
            embeddings.len(),
            seeds.len()
        );
    }

    Ok(seeds
        .into_iter()
        .zip(embeddings)
        .map(|(seed, emb)| ChunkRecord {
            id: Uuid::new_v4(),
            path: path.to_string(),
            hash: hash.to_string(),
            line_start: seed.line_start,
            line_end: seed.line_end,
            text: seed.text,
            context_prev: seed.context_prev,
            context_next: seed.context_next,
            kind: seed.kind,
            role: seed.role,
            defined_symbols: seed.defined_symbols,
            dense: emb.dense,
            colbert: emb.colbert,
            colbert_scale: emb.scale,
            pooled_colbert: emb.pooled,
        })
        .collect())
}

fn own_rss() -> Option<u64> {
    let refresh = RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory());
    let sys = System::new_with_specifics(refresh);
    sys.process(Pid::from_u32(std::process::id()))
        .map(|p| p.memory())
}
