//! Vector side of the store: full chunk records with both embeddings, held
//! in memory behind a lock and persisted as one compressed snapshot.
//!
//! ANN is a brute-force scan; embeddings are unit-normalized so the dot
//! product is cosine similarity. Persistence is atomic (temp file + rename)
//! so a crash mid-write never corrupts the previous snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::RwLock;
use uuid::Uuid;

use super::filter::CompiledFilter;
use crate::config::{COLBERT_DIM, VECTOR_DIM};
use crate::error::{Error, Result};
use crate::models::ChunkRecord;

const SNAPSHOT_FILE: &str = "rows.bin.zst";
const ZSTD_LEVEL: i32 = 3;

/// Which stored vector an ANN query scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorField {
    Dense,
    PooledColbert,
}

#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: ChunkRecord,
    pub score: f32,
}

pub struct VectorTable {
    rows: RwLock<Vec<ChunkRecord>>,
    path: PathBuf,
    cache_max: usize,
}

impl VectorTable {
    pub fn open_or_create(dir: &Path, store_name: &str, cache_max: usize) -> Result<Self> {
        let table_dir = dir.join(store_name);
        std::fs::create_dir_all(&table_dir)?;
        let path = table_dir.join(SNAPSHOT_FILE);

        let rows = if path.exists() {
            match load_snapshot(&path) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!("Discarding unreadable vector snapshot: {e:#}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            rows: RwLock::new(rows),
            path,
            cache_max,
        })
    }

    /// Append a validated batch and persist. The batch is atomic: validation
    /// happens up front, and the snapshot only replaces the previous one
    /// after a complete write.
    pub fn insert_batch(&self, records: Vec<ChunkRecord>) -> Result<()> {
        for record in &records {
            record.validate()?;
        }

        let mut rows = self.rows.write();
        rows.extend(records);
        if self.cache_max > 0 && rows.len() > self.cache_max {
            tracing::warn!(
                "Vector table holds {} rows, above the configured cache bound {}",
                rows.len(),
                self.cache_max
            );
        }
        persist(&self.path, &rows)
    }

    pub fn delete_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|r| !paths.iter().any(|p| p == &r.path));
        if rows.len() != before {
            persist(&self.path, &rows)?;
        }
        Ok(())
    }

    pub fn list_paths(&self) -> HashMap<String, usize> {
        let rows = self.rows.read();
        let mut counts = HashMap::new();
        for r in rows.iter() {
            *counts.entry(r.path.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn has_any_rows(&self) -> bool {
        !self.rows.read().is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    pub fn get(&self, id: &Uuid) -> Option<ChunkRecord> {
        self.rows.read().iter().find(|r| &r.id == id).cloned()
    }

    /// Cosine scan over the chosen field, filtered, best `k`.
    pub fn search(
        &self,
        field: VectorField,
        query: &[f32],
        k: usize,
        filter: Option<&CompiledFilter>,
    ) -> Vec<ScoredRecord> {
        let expected = match field {
            VectorField::Dense => VECTOR_DIM,
            VectorField::PooledColbert => COLBERT_DIM,
        };
        if query.len() != expected {
            tracing::warn!(
                "Vector query width {} does not match field width {}",
                query.len(),
                expected
            );
            return Vec::new();
        }

        let rows = self.rows.read();
        let mut scored: Vec<(f32, &ChunkRecord)> = rows
            .iter()
            .filter(|r| filter.map_or(true, |f| f.matches(r)))
            .map(|r| {
                let target = match field {
                    VectorField::Dense => &r.dense,
                    VectorField::PooledColbert => &r.pooled_colbert,
                };
                (dot(query, target), r)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(score, r)| ScoredRecord {
                record: r.clone(),
                score,
            })
            .collect()
    }

    pub fn clear(&self) -> Result<()> {
        let mut rows = self.rows.write();
        rows.clear();
        persist(&self.path, &rows)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn load_snapshot(path: &Path) -> anyhow::Result<Vec<ChunkRecord>> {
    let compressed = std::fs::read(path).context("read vector snapshot")?;
    let raw = zstd::decode_all(compressed.as_slice()).context("decompress vector snapshot")?;
    bincode::deserialize(&raw).context("decode vector snapshot")
}

fn persist(path: &Path, rows: &[ChunkRecord]) -> Result<()> {
    let raw = bincode::serialize(rows)
        .context("encode vector snapshot")
        .map_err(Error::Storage)?;
    let compressed = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)
        .context("compress vector snapshot")
        .map_err(Error::Storage)?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, compressed)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
