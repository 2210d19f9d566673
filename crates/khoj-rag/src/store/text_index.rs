//! Tantivy-backed keyword index over the chunks table. The index lives in
//! a subdirectory of the store and is derived data: any version restore on
//! the chunks table marks it stale, and the next search rebuilds it from
//! the table, which keeps the "(re)created before any FTS search" contract
//! without coupling it to table history.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Schema, Value as TantivyValue, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::error::{Error, Result};

pub struct TextIndex {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    document_id_field: schema::Field,
    content_field: schema::Field,
    stale: AtomicBool,
    path: PathBuf,
}

/// One keyword hit: chunk id, owning document id, BM25 score.
#[derive(Debug, Clone)]
pub struct TextHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
}

impl TextIndex {
    /// `id` and `document_id` are STRING (indexed untokenized) so delete
    /// terms and document filters work exactly.
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        let id_field = sb.add_text_field("id", STRING | STORED);
        let document_id_field = sb.add_text_field("document_id", STRING | STORED);
        let content_field = sb.add_text_field("content_fts", TEXT);
        (sb.build(), id_field, document_id_field, content_field)
    }

    pub fn open(store_dir: &Path) -> Result<Self> {
        let index_path = store_dir.join("fts_index");
        std::fs::create_dir_all(&index_path).ok();

        let (schema, id_field, document_id_field, content_field) = Self::build_schema();

        let dir = tantivy::directory::MmapDirectory::open(&index_path)
            .map_err(|e| Error::Storage(format!("full-text index dir: {e}")))?;
        let index = if Index::exists(&dir)? {
            Index::open_in_dir(&index_path)?
        } else {
            Index::create_in_dir(&index_path, schema.clone())?
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("failed to create tantivy reader")
            .map_err(|e| Error::Storage(e.to_string()))?;

        let writer = index
            .writer(50_000_000)
            .context("failed to create tantivy writer")
            .map_err(|e| { eprintln!("DEBUG_TANTIVY_ERR: {:?}", e); Error::Storage(e.to_string()) })?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field,
            document_id_field,
            content_field,
            stale: AtomicBool::new(true),
            path: index_path,
        })
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn add_chunks(&self, rows: &[(String, String, String)]) -> Result<()> {
        let writer = self.writer.lock();
        for (id, document_id, content_fts) in rows {
            writer.add_document(doc!(
                self.id_field => id.as_str(),
                self.document_id_field => document_id.as_str(),
                self.content_field => content_fts.as_str(),
            ))?;
        }
        Ok(())
    }

    pub fn delete_document(&self, document_id: &str) -> Result<()> {
        let writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.document_id_field, document_id));
        Ok(())
    }

    pub fn delete_chunk(&self, chunk_id: &str) -> Result<()> {
        let writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.id_field, chunk_id));
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock();
            writer.commit().context("tantivy commit failed").map_err(|e| Error::Storage(e.to_string()))?;
        }
        self.reader.reload()?;
        Ok(())
    }

    /// Replace the whole index with the given rows. Called when the index
    /// is stale relative to the chunks table.
    pub fn rebuild(&self, rows: &[(String, String, String)]) -> Result<()> {
        {
            let mut writer = self.writer.lock();
            writer.delete_all_documents()?;
            for (id, document_id, content_fts) in rows {
                writer.add_document(doc!(
                    self.id_field => id.as_str(),
                    self.document_id_field => document_id.as_str(),
                    self.content_field => content_fts.as_str(),
                ))?;
            }
            writer.commit().context("tantivy rebuild commit failed").map_err(|e| Error::Storage(e.to_string()))?;
        }
        self.reader.reload()?;
        self.stale.store(false, Ordering::SeqCst);
        tracing::debug!(path = %self.path.display(), rows = rows.len(), "rebuilt full-text index");
        Ok(())
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<TextHit>> {
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.content_field]);
        let parsed = match parser.parse_query(query) {
            Ok(q) => q,
            // Queries with stray syntax characters fall back to escaped terms.
            Err(_) => {
                let escaped: String = query
                    .chars()
                    .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
                    .collect();
                match parser.parse_query(&escaped) {
                    Ok(q) => q,
                    Err(_) => return Ok(Vec::new()),
                }
            }
        };

        let top = searcher.search(&parsed, &TopDocs::with_limit(limit.max(1)))?;
        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let stored: TantivyDocument = searcher.doc(address)?;
            let chunk_id = stored
                .get_first(self.id_field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let document_id = stored
                .get_first(self.document_id_field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if !chunk_id.is_empty() {
                hits.push(TextHit {
                    chunk_id,
                    document_id,
                    score,
                });
            }
        }
        Ok(hits)
    }
}
