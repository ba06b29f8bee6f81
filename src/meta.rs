//! Durable `{path → (hash, mtime, size)}` map used for change detection.
//!
//! Purely an optimization: an empty cache forces a full re-embed, a stale
//! cache produces stale skips that the syncer's inconsistency check catches.
//! Entries live in an ordered in-memory map and are snapshotted to a single
//! zstd-compressed file; durability is flushed on [`MetadataCache::save`]
//! and [`MetadataCache::close`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::error::Result;
use crate::models::MetaEntry;

const SNAPSHOT_FILE: &str = "meta.bin.zst";
const ZSTD_LEVEL: i32 = 3;

pub struct MetadataCache {
    entries: BTreeMap<String, MetaEntry>,
    path: PathBuf,
    dirty: bool,
}

impl MetadataCache {
    /// Open the cache under `dir`, loading the previous snapshot if present.
    /// A corrupt snapshot is discarded rather than propagated; the next sync
    /// simply re-embeds everything.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SNAPSHOT_FILE);

        let entries = if path.exists() {
            match Self::load_snapshot(&path) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("Discarding unreadable metadata snapshot: {e:#}");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            entries,
            path,
            dirty: false,
        })
    }

    fn load_snapshot(path: &Path) -> anyhow::Result<BTreeMap<String, MetaEntry>> {
        let compressed = fs::read(path).context("read metadata snapshot")?;
        let raw = zstd::decode_all(compressed.as_slice()).context("decompress metadata snapshot")?;
        bincode::deserialize(&raw).context("decode metadata snapshot")
    }

    pub fn get(&self, path: &str) -> Option<&MetaEntry> {
        self.entries.get(path)
    }

    pub fn put(&mut self, path: String, entry: MetaEntry) {
        self.entries.insert(path, entry);
        self.dirty = true;
    }

    pub fn delete(&mut self, path: &str) {
        if self.entries.remove(path).is_some() {
            self.dirty = true;
        }
    }

    /// Ordered iteration over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaEntry)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    /// Snapshot to disk (atomic temp-file + rename). No-op when unchanged,
    /// so back-to-back syncs of an unchanged tree leave the file bytes
    /// untouched.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let raw = bincode::serialize(&self.entries)
            .context("encode metadata snapshot")
            .map_err(crate::error::Error::Other)?;
        let compressed = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)
            .context("compress metadata snapshot")
            .map_err(crate::error::Error::Other)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, compressed)?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str) -> MetaEntry {
        MetaEntry {
            hash: hash.to_string(),
            mtime_ms: 1_700_000_000_000,
            size_bytes: 42,
        }
    }

    #[test]
    fn test_roundtrip_through_snapshot() {
        let dir = tempfile::tempdir().unwrap();

        let mut cache = MetadataCache::open(dir.path()).unwrap();
        cache.put("src/a.rs".to_string(), entry("aa"));
        cache.put("src/b.rs".to_string(), entry("bb"));
        cache.close().unwrap();

        let reopened = MetadataCache::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("src/a.rs").unwrap().hash, "aa");
    }

    #[test]
    fn test_iteration_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::open(dir.path()).unwrap();
        cache.put("z.rs".to_string(), entry("z"));
        cache.put("a.rs".to_string(), entry("a"));
        cache.put("m.rs".to_string(), entry("m"));

        let keys: Vec<&String> = cache.paths().collect();
        assert_eq!(keys, ["a.rs", "m.rs", "z.rs"]);
    }

    #[test]
    fn test_clean_save_leaves_bytes_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::open(dir.path()).unwrap();
        cache.put("a.rs".to_string(), entry("a"));
        cache.save().unwrap();
        let first = fs::read(dir.path().join(SNAPSHOT_FILE)).unwrap();

        // No mutation: save must not rewrite the snapshot.
        cache.save().unwrap();
        let second = fs::read(dir.path().join(SNAPSHOT_FILE)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), b"not a snapshot").unwrap();

        let cache = MetadataCache::open(dir.path()).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_delete_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::open(dir.path()).unwrap();
        cache.put("a.rs".to_string(), entry("a"));
        cache.delete("a.rs");
        assert!(cache.get("a.rs").is_none());
        assert!(cache.is_empty());
    }
}
