//! Document CRUD. Creation and update touch both the documents and chunks
//! tables, so every such operation records the current version of both up
//! front and restores them if anything later in the pipeline fails.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::chunker::Chunker;
use crate::document::StructuredDocument;
use crate::error::{Error, Result};
use crate::store::{schema, DocumentRecord, Store, TableKind};
use crate::types::{Chunk, Document};

use super::ChunkRepository;

const SNAPSHOT_TABLES: &[TableKind] = &[TableKind::Documents, TableKind::Chunks];

pub struct DocumentRepository {
    store: Arc<Store>,
    chunks: Arc<ChunkRepository>,
    chunker: Arc<Chunker>,
}

impl DocumentRepository {
    pub fn new(store: Arc<Store>, chunks: Arc<ChunkRepository>, chunker: Arc<Chunker>) -> Self {
        Self {
            store,
            chunks,
            chunker,
        }
    }

    pub fn chunk_repository(&self) -> &Arc<ChunkRepository> {
        &self.chunks
    }

    fn to_record(document: &Document) -> Result<DocumentRecord> {
        Ok(DocumentRecord {
            id: document
                .id
                .clone()
                .ok_or_else(|| Error::InvalidInput("document has no id".into()))?,
            content: document.content.clone(),
            uri: document.uri.clone(),
            title: document.title.clone(),
            metadata: serde_json::to_string(&document.metadata)?,
            created_at: document.created_at.to_rfc3339(),
            updated_at: document.updated_at.to_rfc3339(),
            structured_doc_json: document.structured_doc_json.clone(),
            structured_doc_version: document.structured_doc_version.clone(),
        })
    }

    fn from_record(record: &DocumentRecord) -> Document {
        let parse_ts = |s: &str| {
            chrono::DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        };
        Document {
            id: Some(record.id.clone()),
            content: record.content.clone(),
            uri: record.uri.clone(),
            title: record.title.clone(),
            metadata: serde_json::from_str(&record.metadata).unwrap_or_default(),
            created_at: parse_ts(&record.created_at),
            updated_at: parse_ts(&record.updated_at),
            structured_doc_json: record.structured_doc_json.clone(),
            structured_doc_version: record.structured_doc_version.clone(),
        }
    }

    /// Insert the document row alone. Callers needing chunks go through
    /// [`create_and_chunk`](Self::create_and_chunk).
    pub async fn create(&self, mut document: Document) -> Result<Document> {
        if document.id.is_none() {
            document.id = Some(Uuid::new_v4().to_string());
        }
        let now = Utc::now();
        document.created_at = now;
        document.updated_at = now;
        self.store
            .append_documents(&[Self::to_record(&document)?])
            .await?;
        Ok(document)
    }

    /// Create the document and its chunks atomically. When `chunks` is
    /// None, the structured form is chunked; provided chunks are stored
    /// as-is with orders reassigned from list position. Both tables are
    /// restored on any failure after the document row lands.
    pub async fn create_and_chunk(
        &self,
        document: Document,
        structured: Option<&StructuredDocument>,
        chunks: Option<Vec<Chunk>>,
    ) -> Result<Document> {
        let snapshot = self.store.snapshot(SNAPSHOT_TABLES).await?;
        let result = self.create_and_chunk_inner(document, structured, chunks).await;
        match result {
            Ok(document) => Ok(document),
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback(&snapshot).await {
                    tracing::error!(%rollback_err, "rollback after failed write also failed");
                }
                Err(err)
            }
        }
    }

    async fn create_and_chunk_inner(
        &self,
        document: Document,
        structured: Option<&StructuredDocument>,
        chunks: Option<Vec<Chunk>>,
    ) -> Result<Document> {
        let document = self.create(document).await?;
        let document_id = document
            .id
            .clone()
            .ok_or_else(|| Error::Storage("document id missing after create".into()))?;

        let chunks = match chunks {
            Some(provided) => provided,
            None => match structured {
                Some(doc) => self.chunker.chunk(doc)?,
                None => Vec::new(),
            },
        };
        let chunks: Vec<Chunk> = chunks
            .into_iter()
            .enumerate()
            .map(|(order, mut chunk)| {
                chunk.document_id = Some(document_id.clone());
                chunk.order = order as u32;
                chunk
            })
            .collect();
        self.chunks.create(chunks).await?;
        Ok(document)
    }

    /// Update document fields without touching chunks.
    pub async fn update(&self, mut document: Document) -> Result<Document> {
        let id = document
            .id
            .clone()
            .ok_or_else(|| Error::InvalidInput("document id is required for update".into()))?;
        document.updated_at = Utc::now();

        let null_or = |v: &Option<String>| match v {
            Some(s) => schema::sql_quote(s),
            None => "NULL".to_string(),
        };
        let columns = vec![
            ("content", schema::sql_quote(&document.content)),
            ("uri", null_or(&document.uri)),
            ("title", null_or(&document.title)),
            (
                "metadata",
                schema::sql_quote(&serde_json::to_string(&document.metadata)?),
            ),
            (
                "updated_at",
                schema::sql_quote(&document.updated_at.to_rfc3339()),
            ),
            (
                "structured_doc_json",
                null_or(&document.structured_doc_json),
            ),
            (
                "structured_doc_version",
                null_or(&document.structured_doc_version),
            ),
        ];
        self.store.update_document_columns(&id, &columns).await?;
        Ok(document)
    }

    /// Update the document and regenerate its chunks, atomically across
    /// both tables.
    pub async fn update_and_rechunk(
        &self,
        document: Document,
        structured: Option<&StructuredDocument>,
        chunks: Option<Vec<Chunk>>,
    ) -> Result<Document> {
        let id = document
            .id
            .clone()
            .ok_or_else(|| Error::InvalidInput("document id is required for update".into()))?;
        let snapshot = self.store.snapshot(SNAPSHOT_TABLES).await?;
        let result = async {
            self.chunks.delete_by_document_id(&id).await?;
            let document = self.update(document).await?;

            let new_chunks = match chunks {
                Some(provided) => provided,
                None => match structured {
                    Some(doc) => self.chunker.chunk(doc)?,
                    None => Vec::new(),
                },
            };
            let new_chunks: Vec<Chunk> = new_chunks
                .into_iter()
                .enumerate()
                .map(|(order, mut chunk)| {
                    chunk.document_id = Some(id.clone());
                    chunk.order = order as u32;
                    chunk
                })
                .collect();
            self.chunks.create(new_chunks).await?;
            Ok(document)
        }
        .await;

        match result {
            Ok(document) => Ok(document),
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback(&snapshot).await {
                    tracing::error!(%rollback_err, "rollback after failed write also failed");
                }
                Err(err)
            }
        }
    }

    pub async fn get_by_id(&self, document_id: &str) -> Result<Option<Document>> {
        let predicate = format!("id = {}", schema::sql_quote(document_id));
        let records = self
            .store
            .query_documents(Some(&predicate), Some(1), None)
            .await?;
        Ok(records.first().map(Self::from_record))
    }

    pub async fn get_by_uri(&self, uri: &str) -> Result<Option<Document>> {
        let predicate = format!("uri = {}", schema::sql_quote(uri));
        let records = self
            .store
            .query_documents(Some(&predicate), Some(1), None)
            .await?;
        Ok(records.first().map(Self::from_record))
    }

    /// List documents; `predicate` is an already-compiled storage
    /// predicate (the facade compiles user filters first).
    pub async fn list_all(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
        predicate: Option<&str>,
    ) -> Result<Vec<Document>> {
        let records = self.store.query_documents(predicate, limit, offset).await?;
        Ok(records.iter().map(Self::from_record).collect())
    }

    pub async fn count(&self) -> Result<usize> {
        self.store.count_documents().await
    }

    /// Delete a document and cascade to its chunks and image assets.
    pub async fn delete(&self, document_id: &str) -> Result<bool> {
        if self.get_by_id(document_id).await?.is_none() {
            return Ok(false);
        }
        let snapshot = self
            .store
            .snapshot(&[TableKind::Documents, TableKind::Chunks, TableKind::MmAssets])
            .await?;
        let result = async {
            self.chunks.delete_by_document_id(document_id).await?;
            self.store
                .delete_assets(&format!(
                    "document_id = {}",
                    schema::sql_quote(document_id)
                ))
                .await?;
            self.store
                .delete_documents(&format!("id = {}", schema::sql_quote(document_id)))
                .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback(&snapshot).await {
                    tracing::error!(%rollback_err, "rollback after failed write also failed");
                }
                Err(err)
            }
        }
    }
}
