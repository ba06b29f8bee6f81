//! Full-text side of the store, built on tantivy.
//!
//! Chunk text is the only searched field; id and path are stored so hits can
//! be resolved against the vector table and deleted per path. The index is
//! rebuilt writer-per-operation with modest heap, committed per batch.

use std::path::Path;

use anyhow::{Context, Result};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use uuid::Uuid;

use crate::models::ChunkRecord;

const WRITER_HEAP: usize = 50_000_000;

pub struct FtsIndex {
    index: Index,
    f_id: Field,
    f_path: Field,
    f_text: Field,
}

/// A raw FTS hit: chunk id plus the BM25 score.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub id: Uuid,
    pub score: f32,
}

impl FtsIndex {
    pub fn open_or_create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut schema_builder = Schema::builder();
        let f_id = schema_builder.add_text_field("id", STRING | STORED);
        let f_path = schema_builder.add_text_field("path", STRING | STORED);
        let f_text = schema_builder.add_text_field("text", TEXT);
        let schema = schema_builder.build();

        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir).context("Failed to open existing tantivy index")?
        } else {
            Index::create_in_dir(dir, schema.clone()).context("Failed to create tantivy index")?
        };

        Ok(Self {
            index,
            f_id,
            f_path,
            f_text,
        })
    }

    pub fn add_batch(&self, records: &[ChunkRecord]) -> Result<()> {
        let mut writer: IndexWriter = self
            .index
            .writer(WRITER_HEAP)
            .context("Failed to create index writer")?;

        for record in records {
            writer.add_document(doc!(
                self.f_id => record.id.to_string(),
                self.f_path => record.path.clone(),
                self.f_text => record.text.clone(),
            ))?;
        }

        writer.commit().context("Failed to commit fts batch")?;
        Ok(())
    }

    pub fn delete_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut writer: IndexWriter = self
            .index
            .writer(WRITER_HEAP)
            .context("Failed to create index writer")?;

        for path in paths {
            writer.delete_term(Term::from_field_text(self.f_path, path));
        }
        writer.commit().context("Failed to commit fts delete")?;
        Ok(())
    }

    /// Literal keyword search over `text`. Natural-language queries with
    /// operator characters are parsed leniently rather than rejected.
    pub fn search(&self, query_str: &str, limit: usize) -> Result<Vec<FtsHit>> {
        let reader = self
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create reader")?;
        let searcher = reader.searcher();

        let query_parser = QueryParser::for_index(&self.index, vec![self.f_text]);
        let (query, _errors) = query_parser.parse_query_lenient(query_str);

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit.max(1)))
            .context("FTS search failed")?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;
            let id_str = doc
                .get_first(self.f_id)
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let id = match Uuid::parse_str(id_str) {
                Ok(id) => id,
                Err(_) => continue,
            };
            hits.push(FtsHit { id, score });
        }

        Ok(hits)
    }

    /// Idempotent; the text field is indexed at insert time, so this only
    /// forces a commit for readers that want a fresh snapshot.
    pub fn ensure_index(&self) -> Result<()> {
        let mut writer: IndexWriter = self
            .index
            .writer(WRITER_HEAP)
            .context("Failed to create index writer")?;
        writer.commit().context("Failed to commit")?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let mut writer: IndexWriter = self
            .index
            .writer(WRITER_HEAP)
            .context("Failed to create index writer")?;
        writer.delete_all_documents()?;
        writer.commit().context("Failed to commit clear")?;
        Ok(())
    }
}
