//! End-to-end sync and search scenarios over a real temp repo.
//!
//! Inference is replaced by a deterministic stub embedder (hashed
//! bag-of-words vectors) so retrieval behavior is observable without model
//! assets; worker crash recovery is exercised at the pool level in
//! `src/embed/pool.rs`.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use osgrep::chunking;
use osgrep::config::{Config, COLBERT_DIM, VECTOR_DIM};
use osgrep::embed::maxsim::{self, normalize_l2, quantize_grid};
use osgrep::embed::{CandidateGrid, Embedder, HybridEmbedding, QueryEmbedding};
use osgrep::error::Result;
use osgrep::meta::MetadataCache;
use osgrep::models::{ChunkRecord, Filter, FilterCond, FilterOp};
use osgrep::project::ProjectPaths;
use osgrep::search::{Retriever, SearchOptions};
use osgrep::store::Storage;
use osgrep::sync::Syncer;

/// Deterministic stand-in for the worker pool: hashed bag-of-words dense
/// vectors and one grid row per token, so lexically overlapping texts score
/// close and tests can count embedding work.
#[derive(Default)]
struct StubEmbedder {
    process_file_calls: AtomicUsize,
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in token.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn dense_of(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; VECTOR_DIM];
    for t in tokens(text) {
        v[(fnv1a(&t) % VECTOR_DIM as u64) as usize] += 1.0;
    }
    let v = normalize_l2(v);
    if v.iter().all(|x| *x == 0.0) {
        let mut unit = vec![0.0f32; VECTOR_DIM];
        unit[0] = 1.0;
        return unit;
    }
    v
}

fn grid_rows_of(text: &str) -> Vec<Vec<f32>> {
    let toks = tokens(text);
    if toks.is_empty() {
        let mut row = vec![0.0f32; COLBERT_DIM];
        row[0] = 1.0;
        return vec![row];
    }
    toks.iter()
        .take(64)
        .map(|t| {
            let mut row = vec![0.0f32; COLBERT_DIM];
            row[(fnv1a(t) % COLBERT_DIM as u64) as usize] = 1.0;
            row
        })
        .collect()
}

#[async_trait::async_trait]
impl Embedder for StubEmbedder {
    async fn compute_hybrid(&self, texts: &[String]) -> Result<Vec<HybridEmbedding>> {
        Ok(texts
            .iter()
            .map(|t| {
                let (grid, scale) = quantize_grid(&grid_rows_of(t));
                let pooled = maxsim::pool_grid(&grid, scale, COLBERT_DIM);
                HybridEmbedding {
                    dense: dense_of(t),
                    colbert: grid,
                    scale,
                    pooled,
                }
            })
            .collect())
    }

    async fn encode_query(&self, text: &str) -> Result<QueryEmbedding> {
        let rows = grid_rows_of(text);
        let token_ids = tokens(text)
            .iter()
            .take(rows.len())
            .map(|t| (fnv1a(t) % 10_000) as u32)
            .collect();
        Ok(QueryEmbedding {
            dense: dense_of(text),
            colbert: rows,
            token_ids,
        })
    }

    async fn rerank(
        &self,
        query: &QueryEmbedding,
        candidates: &[CandidateGrid],
    ) -> Result<Vec<f32>> {
        let skiplist = HashSet::new();
        Ok(candidates
            .iter()
            .map(|c| {
                maxsim::max_sim_quantized(
                    &query.colbert,
                    &query.token_ids,
                    &skiplist,
                    &c.colbert,
                    c.scale,
                    COLBERT_DIM,
                )
            })
            .collect())
    }

    async fn process_file(
        &self,
        path: &str,
        content: &str,
        hash: &str,
    ) -> Result<Vec<ChunkRecord>> {
        self.process_file_calls.fetch_add(1, Ordering::SeqCst);
        let seeds = chunking::chunk_file(path, content);
        let texts: Vec<String> = seeds.iter().map(|s| s.text.clone()).collect();
        let embeddings = self.compute_hybrid(&texts).await?;
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
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    paths: ProjectPaths,
    config: Config,
    storage: Arc<Storage>,
    embedder: Arc<StubEmbedder>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        fs::create_dir_all(root.join(".git")).unwrap();

        let paths = ProjectPaths::discover(&root).unwrap();
        let config = Config {
            worker_threads: 2,
            ..Config::default()
        };
        let storage = Arc::new(
            Storage::open(&paths.store_dir(), &config.store_name, 0).unwrap(),
        );

        Self {
            _dir: dir,
            root,
            paths,
            config,
            storage,
            embedder: Arc::new(StubEmbedder::default()),
        }
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn syncer(&self) -> Syncer<StubEmbedder> {
        Syncer::new(
            self.paths.clone(),
            self.config.clone(),
            self.storage.clone(),
            self.embedder.clone(),
        )
    }

    async fn sync(&self) -> osgrep::models::SyncReport {
        self.syncer()
            .sync(&CancellationToken::new(), &mut ())
            .await
            .unwrap()
    }

    fn retriever(&self) -> Retriever<StubEmbedder> {
        Retriever::new(self.storage.clone(), self.embedder.clone())
    }

    async fn search(&self, query: &str, k: usize) -> Vec<osgrep::models::SearchResult> {
        self.retriever()
            .search(query, k, &SearchOptions::default())
            .await
            .unwrap()
    }

    fn embed_calls(&self) -> usize {
        self.embedder.process_file_calls.load(Ordering::SeqCst)
    }

    fn meta(&self) -> MetadataCache {
        MetadataCache::open(&self.paths.meta_dir()).unwrap()
    }

    fn meta_file(&self) -> PathBuf {
        self.paths.meta_dir().join("meta.bin.zst")
    }
}

fn two_file_repo() -> Harness {
    let h = Harness::new();
    h.write("main.ts", "function login(){return \"ok\";}\n");
    h.write("utils.ts", "export function helper(){return \"utils\";}\n");
    h
}

#[tokio::test]
async fn fresh_index_of_two_files() {
    let h = two_file_repo();
    let report = h.sync().await;

    assert!(report.indexed >= 2, "indexed {}", report.indexed);
    assert!(report.complete);
    assert!(report.processed >= 2);

    let paths = h.storage.list_paths();
    assert!(paths.get("main.ts").is_some_and(|&n| n >= 1));
    assert!(paths.get("utils.ts").is_some_and(|&n| n >= 1));

    let results = h.search("login", 5).await;
    assert!(!results.is_empty());
    let top = &results[0];
    assert_eq!(top.path, "main.ts");
    assert!(top.score > 0.0);
    assert!(top.text.contains("login"));
    assert_eq!(top.rank, 1);
}

#[tokio::test]
async fn metadata_matches_stored_hashes() {
    let h = two_file_repo();
    h.sync().await;

    let meta = h.meta();
    for (path, _count) in h.storage.list_paths() {
        let entry = meta.get(&path).expect("meta entry for stored path");
        let hits = h
            .storage
            .fts_search("function", 50, None)
            .unwrap()
            .into_iter()
            .filter(|r| r.record.path == path)
            .collect::<Vec<_>>();
        for hit in hits {
            assert_eq!(hit.record.hash, entry.hash);
        }
    }
}

#[tokio::test]
async fn path_filter_restricts_results() {
    let h = two_file_repo();
    h.sync().await;

    let filter = Filter::All(vec![Filter::Cond(FilterCond {
        key: "path".to_string(),
        op: FilterOp::StartsWith,
        value: "main.ts".into(),
    })]);
    let results = h
        .retriever()
        .search(
            "function",
            10,
            &SearchOptions {
                path_prefix: None,
                filter: Some(filter),
            },
        )
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.path.starts_with("main.ts")));
}

#[tokio::test]
async fn idempotent_resync_does_no_work() {
    let h = two_file_repo();
    h.sync().await;
    let calls_after_first = h.embed_calls();
    let rows_after_first = h.storage.row_count();
    let meta_bytes_first = fs::read(h.meta_file()).unwrap();

    let report = h.sync().await;

    assert_eq!(h.embed_calls(), calls_after_first, "no re-embedding");
    assert_eq!(h.storage.row_count(), rows_after_first, "no storage writes");
    assert!(report.processed >= 2);
    assert_eq!(report.indexed, 0);
    // Byte-identical metadata cache after a no-op pass.
    assert_eq!(fs::read(h.meta_file()).unwrap(), meta_bytes_first);
}

#[tokio::test]
async fn change_detection_touches_only_the_changed_file() {
    let h = two_file_repo();
    h.sync().await;
    let calls_before = h.embed_calls();

    let utils_ids_before: HashSet<Uuid> = h
        .storage
        .fts_search("helper", 50, None)
        .unwrap()
        .into_iter()
        .filter(|r| r.record.path == "utils.ts")
        .map(|r| r.record.id)
        .collect();
    assert!(!utils_ids_before.is_empty());

    h.write("main.ts", "function login(){return \"ok\";}\n// audit trail\n");
    let report = h.sync().await;

    assert_eq!(report.indexed, 1);
    assert_eq!(h.embed_calls(), calls_before + 1, "only main.ts re-embedded");

    let utils_ids_after: HashSet<Uuid> = h
        .storage
        .fts_search("helper", 50, None)
        .unwrap()
        .into_iter()
        .filter(|r| r.record.path == "utils.ts")
        .map(|r| r.record.id)
        .collect();
    assert_eq!(utils_ids_before, utils_ids_after);
}

#[tokio::test]
async fn stale_sweep_removes_deleted_files() {
    let h = two_file_repo();
    h.sync().await;

    fs::remove_file(h.root.join("utils.ts")).unwrap();
    let report = h.sync().await;
    assert!(report.complete);

    assert!(!h.storage.list_paths().contains_key("utils.ts"));
    let results = h.search("helper", 5).await;
    assert!(results.iter().all(|r| r.path != "utils.ts"));

    let meta = h.meta();
    assert!(meta.get("utils.ts").is_none());
}

#[tokio::test]
async fn empty_file_indexed_as_absent_with_metadata() {
    let h = Harness::new();
    h.write("empty.rs", "");
    h.write("real.rs", "fn real() {}\n");
    h.sync().await;

    assert!(!h.storage.list_paths().contains_key("empty.rs"));
    // Metadata entry exists so the next pass skips the re-read.
    assert!(h.meta().get("empty.rs").is_some());

    let calls = h.embed_calls();
    h.sync().await;
    assert_eq!(h.embed_calls(), calls);
}

#[tokio::test]
async fn nul_byte_file_is_deleted_by_path() {
    let h = Harness::new();
    h.write("real.rs", "fn real() {}\n");
    h.sync().await;

    // The file turns binary in place: its chunks must disappear.
    fs::write(h.root.join("real.rs"), b"fn re\x00al() {}\n").unwrap();
    h.sync().await;

    assert!(!h.storage.list_paths().contains_key("real.rs"));
    assert!(h.meta().get("real.rs").is_some());
}

#[tokio::test]
async fn file_over_size_cap_is_rejected() {
    let h = Harness::new();
    h.write("small.rs", "fn ok() {}\n");
    let big = "x".repeat(10 * 1024 * 1024 + 1);
    h.write("big.rs", &big);

    h.sync().await;

    let paths = h.storage.list_paths();
    assert!(paths.contains_key("small.rs"));
    assert!(!paths.contains_key("big.rs"));
}

#[tokio::test]
async fn cancellation_skips_sweep_and_releases_lock() {
    let h = two_file_repo();
    h.sync().await;
    fs::remove_file(h.root.join("utils.ts")).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.syncer().sync(&cancel, &mut ()).await.unwrap();

    assert!(!report.complete);
    // Sweep skipped: the deleted file's chunks survive a cancelled pass.
    assert!(h.storage.list_paths().contains_key("utils.ts"));

    // The lock was released: a fresh pass runs and completes the sweep.
    let report = h.sync().await;
    assert!(report.complete);
    assert!(!h.storage.list_paths().contains_key("utils.ts"));
}

#[tokio::test]
async fn inconsistent_cache_triggers_rebuild() {
    let h = two_file_repo();
    h.sync().await;
    assert!(h.storage.has_any_rows());
    let calls_before = h.embed_calls();

    // Blow away the metadata while storage still has rows.
    fs::remove_file(h.meta_file()).unwrap();
    let report = h.sync().await;

    assert!(report.complete);
    assert_eq!(report.indexed, 2, "full rebuild after corruption");
    assert_eq!(h.embed_calls(), calls_before + 2);
    assert!(h.storage.list_paths().contains_key("main.ts"));
}

#[tokio::test]
async fn second_writer_is_rejected_while_syncing() {
    let h = two_file_repo();
    let lock = osgrep::project::WriterLock::acquire(&h.paths).unwrap();

    let err = h
        .syncer()
        .sync(&CancellationToken::new(), &mut ())
        .await
        .unwrap_err();
    assert!(matches!(err, osgrep::error::Error::LockHeld { .. }));

    drop(lock);
    assert!(h.syncer().sync(&CancellationToken::new(), &mut ()).await.is_ok());
}

#[tokio::test]
async fn gitignored_files_are_not_indexed() {
    let h = Harness::new();
    h.write("kept.rs", "fn kept() {}\n");
    h.write("generated/out.rs", "fn generated() {}\n");
    h.write(".gitignore", "generated/\n");
    // Project discovery already appended .osgrep/ to .gitignore; rewrite
    // keeps both entries.
    let gitignore = h.root.join(".gitignore");
    fs::write(&gitignore, ".osgrep/\ngenerated/\n").unwrap();

    h.sync().await;

    let paths = h.storage.list_paths();
    assert!(paths.contains_key("kept.rs"));
    assert!(!paths.keys().any(|p| p.starts_with("generated/")));
}

#[tokio::test]
async fn osgrepignore_is_honored() {
    let h = Harness::new();
    h.write("kept.rs", "fn kept() {}\n");
    h.write("scratch/notes.md", "scratch notes\n");
    h.write(".osgrepignore", "scratch/\n");

    h.sync().await;

    let paths = h.storage.list_paths();
    assert!(paths.contains_key("kept.rs"));
    assert!(!paths.keys().any(|p| p.starts_with("scratch/")));
}

#[tokio::test]
async fn every_stored_vector_is_unit_norm() {
    let h = two_file_repo();
    h.sync().await;

    for hit in h.storage.fts_search("function", 100, None).unwrap() {
        let r = &hit.record;
        let dense_norm: f32 = r.dense.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((dense_norm - 1.0).abs() < 1e-3, "dense norm {dense_norm}");
        let pooled_norm: f32 = r.pooled_colbert.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((pooled_norm - 1.0).abs() < 1e-3, "pooled norm {pooled_norm}");
        assert!(r.colbert_scale.is_finite() && r.colbert_scale > 0.0);
    }
}

#[tokio::test]
async fn provenance_records_candidate_origin() {
    let h = two_file_repo();
    h.sync().await;

    let results = h.search("login", 5).await;
    let top = &results[0];
    assert!(
        top.provenance.vector_rank.is_some() || top.provenance.fts_rank.is_some(),
        "top hit must come from at least one retrieval path"
    );
    assert!(top.provenance.rerank_score.is_some());
}

#[tokio::test]
async fn tsv_serialization_is_stable() {
    let h = two_file_repo();
    h.sync().await;

    let results = h.search("login", 3).await;
    let tsv = osgrep::models::results_to_tsv(&results);
    let first_line = tsv.lines().next().unwrap();
    let cols: Vec<&str> = first_line.split('\t').collect();
    assert_eq!(cols.len(), 7);
    assert_eq!(cols[0], "main.ts");
    assert!(cols[1].contains('-'));
}

/// Walking a worktree checkout resolves to the main repository root, so the
/// index lands beside the primary clone.
#[test]
fn worktree_discovery_reuses_main_root() {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("main");
    fs::create_dir_all(main.join(".git/worktrees/feature")).unwrap();
    fs::write(main.join(".git/worktrees/feature/commondir"), "../..\n").unwrap();

    let wt = dir.path().join("feature");
    fs::create_dir_all(&wt).unwrap();
    fs::write(
        wt.join(".git"),
        format!("gitdir: {}\n", main.join(".git/worktrees/feature").display()),
    )
    .unwrap();

    let paths = ProjectPaths::discover(&wt).unwrap();
    assert_eq!(paths.root, main.canonicalize().unwrap());
    assert!(paths.data_dir.starts_with(&paths.root));
}
