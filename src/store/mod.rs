//! The vector+FTS store behind one narrow contract.
//!
//! `Storage` pairs a tantivy full-text index with the vector table (the
//! source of truth holding complete records). Updates follow the engine's
//! ordering guarantee: callers delete by path before inserting replacements,
//! and metadata is committed only after both sides succeed.

pub mod filter;
pub mod fts;
pub mod vector;

use std::collections::HashMap;
use std::path::Path;

pub use filter::CompiledFilter;
pub use vector::{ScoredRecord, VectorField};

use crate::error::{Error, Result};
use crate::models::ChunkRecord;

pub struct Storage {
    fts: fts::FtsIndex,
    table: vector::VectorTable,
}

impl Storage {
    pub fn open(dir: &Path, store_name: &str, cache_max: usize) -> Result<Self> {
        let table = vector::VectorTable::open_or_create(dir, store_name, cache_max)?;
        let fts = fts::FtsIndex::open_or_create(&dir.join(format!("{store_name}_fts")))
            .map_err(Error::Storage)?;
        Ok(Self { fts, table })
    }

    /// Append a batch. Validation runs first so a schema mismatch rejects
    /// the whole batch with a diagnostic naming the offending field; the
    /// vector table (source of truth) is written before the FTS side.
    pub fn insert_batch(&self, records: Vec<ChunkRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.table.insert_batch(records.clone())?;
        self.fts.add_batch(&records).map_err(Error::Storage)?;
        Ok(())
    }

    /// Delete every row whose `path` is in the set, on both sides.
    pub fn delete_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        self.table.delete_paths(paths)?;
        self.fts.delete_paths(paths).map_err(Error::Storage)?;
        Ok(())
    }

    /// Cheap enumeration for the stale sweep.
    pub fn list_paths(&self) -> HashMap<String, usize> {
        self.table.list_paths()
    }

    pub fn has_any_rows(&self) -> bool {
        self.table.has_any_rows()
    }

    pub fn row_count(&self) -> usize {
        self.table.row_count()
    }

    pub fn vector_search(
        &self,
        field: VectorField,
        query: &[f32],
        k: usize,
        filter: Option<&CompiledFilter>,
    ) -> Vec<ScoredRecord> {
        self.table.search(field, query, k, filter)
    }

    /// Full-text over chunk text, resolved to complete records and filtered.
    /// Oversamples the index so a selective filter still fills `k`.
    pub fn fts_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&CompiledFilter>,
    ) -> Result<Vec<ScoredRecord>> {
        let raw = self.fts.search(query, k * 3).map_err(Error::Storage)?;

        let mut out = Vec::with_capacity(k);
        for hit in raw {
            let Some(record) = self.table.get(&hit.id) else {
                continue;
            };
            if filter.map_or(true, |f| f.matches(&record)) {
                out.push(ScoredRecord {
                    record,
                    score: hit.score,
                });
                if out.len() >= k {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub fn create_fts_index(&self) -> Result<()> {
        self.fts.ensure_index().map_err(Error::Storage)
    }

    /// Drop all rows on both sides. Used by the corruption recovery path.
    pub fn drop_all(&self) -> Result<()> {
        self.table.clear()?;
        self.fts.clear().map_err(Error::Storage)?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        // Both sides persist eagerly; nothing buffered to flush.
        Ok(())
    }
}
