//! One-writer reconciliation between the working tree and the store.
//!
//! A sync pass streams the tree through the ignore rules, skips unchanged
//! files via the metadata cache, schedules embedding work under bounded
//! concurrency, flushes batches in delete → insert → metadata order, and
//! finishes with a stale-path sweep. Per-file failures are recorded and
//! skipped; flush failures abort the pass.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, BATCH_LIMIT, EMBED_BATCH_SIZE, MAX_FILE_SIZE_BYTES, META_SAVE_INTERVAL};
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::meta::MetadataCache;
use crate::models::{ChunkRecord, MetaEntry, SyncReport};
use crate::project::{ProjectPaths, WriterLock};
use crate::store::Storage;

/// Baked deny list applied on top of `.gitignore` and `.osgrepignore`:
/// lockfiles, build outputs, dependency trees, secrets, and the data dir.
const DEFAULT_DENY: &[&str] = &[
    "node_modules",
    "dist",
    "build",
    "target",
    "vendor",
    "__pycache__",
    ".git",
    ".osgrep",
    "*.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "*.min.js",
    "*.pem",
    "*.key",
    ".env",
    ".env.*",
    "id_rsa*",
    "*.p12",
];

/// Progress sink for long passes. The unit impl ignores everything.
pub trait SyncProgress: Send {
    fn update(&mut self, processed: usize, indexed: usize, total: usize);
}

impl SyncProgress for () {
    fn update(&mut self, _processed: usize, _indexed: usize, _total: usize) {}
}

impl<F: FnMut(usize, usize, usize) + Send> SyncProgress for F {
    fn update(&mut self, processed: usize, indexed: usize, total: usize) {
        self(processed, indexed, total)
    }
}

pub struct Syncer<E: Embedder + 'static> {
    paths: ProjectPaths,
    config: Config,
    storage: Arc<Storage>,
    embedder: Arc<E>,
}

/// Outcome of one embed task, joined back on the orchestration loop.
struct TaskResult {
    path: String,
    entry: MetaEntry,
    records: Result<Vec<ChunkRecord>>,
}

impl<E: Embedder + 'static> Syncer<E> {
    pub fn new(
        paths: ProjectPaths,
        config: Config,
        storage: Arc<Storage>,
        embedder: Arc<E>,
    ) -> Self {
        Self {
            paths,
            config,
            storage,
            embedder,
        }
    }

    /// Run one sync pass. Holds the writer lock for the duration; fails fast
    /// with `LockHeld` when another live writer owns the project.
    pub async fn sync(
        &self,
        cancel: &CancellationToken,
        progress: &mut dyn SyncProgress,
    ) -> Result<SyncReport> {
        let _lock = WriterLock::acquire(&self.paths)?;
        let mut meta = MetadataCache::open(&self.paths.meta_dir())?;

        // Storage with rows but no metadata (or the reverse) means one side
        // was deleted or corrupted externally; drop both and rebuild.
        if self.storage.has_any_rows() != !meta.is_empty() {
            tracing::warn!("{}", Error::StorageCorruption);
            self.storage.drop_all()?;
            meta.clear();
            meta.save()?;
        }

        let files = self.collect_files();
        let total = files.len();

        let mut report = SyncReport {
            total,
            ..SyncReport::default()
        };
        let mut seen: HashSet<String> = HashSet::new();
        let mut had_errors = false;
        let mut cancelled = false;

        let mut batch: Vec<ChunkRecord> = Vec::new();
        let mut pending_deletes: Vec<String> = Vec::new();
        let mut pending_meta: Vec<(String, MetaEntry)> = Vec::new();
        let mut since_save = 0usize;
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        for (abs_path, rel_path) in files {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            report.processed += 1;
            progress.update(report.processed, report.indexed, total);

            let snapshot = match self.examine(&abs_path, &rel_path, &meta) {
                // Not indexable this pass (e.g. grew past the size cap):
                // not marked seen, so previously indexed chunks get swept.
                Examined::Reject => continue,
                Examined::Skip => {
                    seen.insert(rel_path);
                    continue;
                }
                Examined::Refresh(entry) => {
                    meta.put(rel_path.clone(), entry);
                    seen.insert(rel_path);
                    continue;
                }
                Examined::Delete(entry) => {
                    pending_deletes.push(rel_path.clone());
                    pending_meta.push((rel_path.clone(), entry));
                    seen.insert(rel_path);
                    continue;
                }
                Examined::Embed(snapshot) => snapshot,
                Examined::Failed(e) => {
                    tracing::warn!("Skipping {rel_path}: {e}");
                    had_errors = true;
                    // Keep previously indexed chunks; the sweep is skipped on
                    // an incomplete pass anyway.
                    seen.insert(rel_path);
                    continue;
                }
            };

            seen.insert(rel_path.clone());

            // Bounded concurrency: at most worker_threads embed tasks in
            // flight; join one before scheduling the next.
            while tasks.len() >= self.config.worker_threads {
                if let Some(joined) = tasks.join_next().await {
                    self.absorb(
                        joined,
                        &mut batch,
                        &mut pending_deletes,
                        &mut pending_meta,
                        &mut report,
                        &mut had_errors,
                    );
                }
                self.maybe_flush(
                    &mut batch,
                    &mut pending_deletes,
                    &mut pending_meta,
                    &mut meta,
                    &mut since_save,
                    false,
                )
                .await?;
            }

            let embedder = self.embedder.clone();
            let path = rel_path.clone();
            tasks.spawn(async move {
                let records = embedder
                    .process_file(&path, &snapshot.content, &snapshot.hash)
                    .await;
                TaskResult {
                    path,
                    entry: snapshot.entry,
                    records,
                }
            });

            self.maybe_flush(
                &mut batch,
                &mut pending_deletes,
                &mut pending_meta,
                &mut meta,
                &mut since_save,
                false,
            )
            .await?;
        }

        // Await whatever is still in flight. After cancellation the results
        // are dropped instead of flushed.
        while let Some(joined) = tasks.join_next().await {
            if cancelled {
                continue;
            }
            self.absorb(
                joined,
                &mut batch,
                &mut pending_deletes,
                &mut pending_meta,
                &mut report,
                &mut had_errors,
            );
        }

        if !cancelled {
            self.maybe_flush(
                &mut batch,
                &mut pending_deletes,
                &mut pending_meta,
                &mut meta,
                &mut since_save,
                true,
            )
            .await?;
        }

        // Stale sweep: only on a clean, uncancelled pass.
        if !cancelled && !had_errors {
            let stored = self.storage.list_paths();
            let stale: Vec<String> = stored
                .keys()
                .filter(|p| !seen.contains(*p))
                .cloned()
                .collect();
            if !stale.is_empty() {
                tracing::info!("Sweeping {} stale paths", stale.len());
                self.storage.delete_paths(&stale)?;
                for p in &stale {
                    meta.delete(p);
                }
            }
            // Drop metadata for paths that no longer exist on disk either.
            let gone: Vec<String> = meta
                .paths()
                .filter(|p| !seen.contains(*p))
                .cloned()
                .collect();
            for p in gone {
                meta.delete(&p);
            }
            self.storage.create_fts_index()?;
        }

        meta.close()?;
        progress.update(report.processed, report.indexed, total);
        report.complete = !cancelled && !had_errors;
        Ok(report)
    }

    /// Walk the tree through the ignore rules; deterministic order.
    fn collect_files(&self) -> Vec<(PathBuf, String)> {
        let root = &self.paths.root;

        let mut overrides = OverrideBuilder::new(root);
        for pattern in DEFAULT_DENY {
            // Leading `!` makes the override an exclusion.
            if let Err(e) = overrides.add(&format!("!{pattern}")) {
                tracing::warn!("Bad deny pattern {pattern}: {e}");
            }
        }
        let overrides = match overrides.build() {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("Deny list disabled: {e}");
                ignore::overrides::Override::empty()
            }
        };

        let walker = WalkBuilder::new(root)
            .add_custom_ignore_filename(".osgrepignore")
            .overrides(overrides)
            .follow_links(false)
            .build();

        let mut canonical_seen: HashSet<PathBuf> = HashSet::new();
        let mut files = Vec::new();

        for entry in walker.flatten() {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if !is_indexable(path) {
                continue;
            }
            // Deduplicate hard links / re-walked paths by real path.
            if let Ok(real) = path.canonicalize() {
                if !canonical_seen.insert(real) {
                    continue;
                }
            }
            let rel = match path.strip_prefix(root) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            files.push((path.to_path_buf(), rel));
        }

        files.sort_by(|a, b| a.1.cmp(&b.1));
        files
    }

    /// Per-file decision: skip, refresh metadata, delete, embed, or fail.
    fn examine(&self, abs: &Path, rel: &str, meta: &MetadataCache) -> Examined {
        let stat = match std::fs::metadata(abs) {
            Ok(m) => m,
            Err(_) => return Examined::Failed(Error::FileVanished(abs.to_path_buf())),
        };
        if stat.len() > MAX_FILE_SIZE_BYTES {
            tracing::debug!("{}", Error::FileTooLarge {
                path: abs.to_path_buf(),
                size: stat.len(),
            });
            return Examined::Reject;
        }

        let mtime_ms = mtime_millis(&stat);
        let size_bytes = stat.len();

        if let Some(entry) = meta.get(rel) {
            if entry.mtime_ms == mtime_ms && entry.size_bytes == size_bytes {
                return Examined::Skip;
            }
        }

        // Snapshot: read, then verify the file did not change underneath.
        let content = match std::fs::read(abs) {
            Ok(c) => c,
            Err(_) => return Examined::Failed(Error::FileVanished(abs.to_path_buf())),
        };
        match std::fs::metadata(abs) {
            Ok(after) if mtime_millis(&after) == mtime_ms && after.len() == size_bytes => {}
            // Changed mid-read; leave it for the next pass.
            _ => return Examined::Skip,
        }

        let hash = hex_sha256(&content);
        let entry = MetaEntry {
            hash: hash.clone(),
            mtime_ms,
            size_bytes,
        };

        if let Some(existing) = meta.get(rel) {
            if existing.hash == hash {
                // Content unchanged, only the stat moved.
                return Examined::Refresh(entry);
            }
        }

        if content.is_empty() || content.contains(&0u8) {
            if content.contains(&0u8) {
                tracing::debug!("{}", Error::FileBinary(abs.to_path_buf()));
            }
            return Examined::Delete(entry);
        }

        let content = String::from_utf8_lossy(&content).into_owned();
        Examined::Embed(Snapshot {
            content,
            hash,
            entry,
        })
    }

    fn absorb(
        &self,
        joined: std::result::Result<TaskResult, tokio::task::JoinError>,
        batch: &mut Vec<ChunkRecord>,
        pending_deletes: &mut Vec<String>,
        pending_meta: &mut Vec<(String, MetaEntry)>,
        report: &mut SyncReport,
        had_errors: &mut bool,
    ) {
        let task = match joined {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Embed task panicked: {e}");
                *had_errors = true;
                return;
            }
        };
        match task.records {
            Ok(records) => {
                // Delete-before-insert for this path is guaranteed by flush
                // ordering: deletes in a flush run before its inserts.
                pending_deletes.push(task.path.clone());
                batch.extend(records);
                pending_meta.push((task.path, task.entry));
                report.indexed += 1;
            }
            Err(e) => {
                tracing::warn!("Embedding failed for {}: {e}", task.path);
                *had_errors = true;
            }
        }
    }

    /// Flush when any threshold trips (or unconditionally with `force`).
    /// Order within a flush: deletes, then inserts, then metadata. A failed
    /// insert aborts before metadata commit, so the affected files are
    /// re-embedded next pass.
    async fn maybe_flush(
        &self,
        batch: &mut Vec<ChunkRecord>,
        pending_deletes: &mut Vec<String>,
        pending_meta: &mut Vec<(String, MetaEntry)>,
        meta: &mut MetadataCache,
        since_save: &mut usize,
        force: bool,
    ) -> Result<()> {
        let due = force
            || batch.len() >= EMBED_BATCH_SIZE
            || pending_deletes.len() >= BATCH_LIMIT
            || pending_meta.len() >= BATCH_LIMIT;
        if !due || (batch.is_empty() && pending_deletes.is_empty() && pending_meta.is_empty()) {
            return Ok(());
        }

        let deletes = std::mem::take(pending_deletes);
        let records = std::mem::take(batch);
        let metas = std::mem::take(pending_meta);
        let committed = metas.len();

        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || {
            storage.delete_paths(&deletes)?;
            storage.insert_batch(records)
        })
        .await
        .map_err(|e| Error::Storage(anyhow::anyhow!("flush task failed: {e}")))??;

        for (path, entry) in metas {
            meta.put(path, entry);
        }
        *since_save += committed;
        if *since_save >= META_SAVE_INTERVAL {
            meta.save()?;
            *since_save = 0;
        }
        Ok(())
    }
}

struct Snapshot {
    content: String,
    hash: String,
    entry: MetaEntry,
}

enum Examined {
    /// Not indexable this pass; excluded from the seen set.
    Reject,
    /// Unchanged (or changing underneath); counted as seen.
    Skip,
    Refresh(MetaEntry),
    Delete(MetaEntry),
    Embed(Snapshot),
    Failed(Error),
}

fn mtime_millis(stat: &std::fs::Metadata) -> u64 {
    stat.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Closed allow-list of indexable extensions: mainstream source languages
/// plus markdown, plain text, and PDF.
fn is_indexable(path: &Path) -> bool {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    matches!(
        ext.as_str(),
        "rs" | "py"
            | "js"
            | "jsx"
            | "mjs"
            | "cjs"
            | "ts"
            | "tsx"
            | "mts"
            | "cts"
            | "go"
            | "java"
            | "c"
            | "cc"
            | "cpp"
            | "h"
            | "hpp"
            | "cs"
            | "rb"
            | "php"
            | "swift"
            | "kt"
            | "kts"
            | "scala"
            | "lua"
            | "sh"
            | "bash"
            | "zsh"
            | "sql"
            | "html"
            | "css"
            | "scss"
            | "vue"
            | "svelte"
            | "zig"
            | "dart"
            | "ex"
            | "exs"
            | "hs"
            | "ml"
            | "clj"
            | "el"
            | "erl"
            | "nim"
            | "jl"
            | "r"
            | "tf"
            | "proto"
            | "graphql"
            | "md"
            | "txt"
            | "pdf"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexable_extensions() {
        assert!(is_indexable(Path::new("src/main.rs")));
        assert!(is_indexable(Path::new("doc/README.md")));
        assert!(is_indexable(Path::new("paper.pdf")));
        assert!(!is_indexable(Path::new("logo.png")));
        assert!(!is_indexable(Path::new("Cargo.lock")));
        assert!(!is_indexable(Path::new("noext")));
    }

    #[test]
    fn test_hex_sha256_is_stable() {
        let a = hex_sha256(b"hello");
        let b = hex_sha256(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hex_sha256(b"hello!"));
    }
}
