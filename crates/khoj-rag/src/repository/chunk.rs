//! Chunk CRUD and the three search modes: vector ANN, keyword, and hybrid
//! fusion of the two via reciprocal rank fusion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::embeddings::{self, Embedder};
use crate::error::{Error, Result};
use crate::search::{self, filter, SearchType, RRF_K};
use crate::store::{schema, ChunkRecord, Store, TableKind};
use crate::types::{Chunk, ChunkMetadata};

pub struct ChunkRepository {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
}

impl ChunkRepository {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    fn to_record(chunk: &Chunk) -> Result<ChunkRecord> {
        let document_id = chunk
            .document_id
            .clone()
            .ok_or_else(|| Error::InvalidInput("chunk must have a document_id".into()))?;
        let vector = chunk
            .embedding
            .clone()
            .ok_or_else(|| Error::EmbeddingFailed(format!("chunk {} has no embedding", chunk.id)))?;
        Ok(ChunkRecord {
            id: chunk.id.clone(),
            document_id,
            content: chunk.content.clone(),
            content_fts: chunk.content_fts(),
            metadata: serde_json::to_string(&chunk.metadata)?,
            order: chunk.order,
            vector,
        })
    }

    fn from_record(record: &ChunkRecord) -> Chunk {
        let metadata: ChunkMetadata = serde_json::from_str(&record.metadata).unwrap_or_default();
        Chunk {
            id: record.id.clone(),
            document_id: if record.document_id.is_empty() {
                None
            } else {
                Some(record.document_id.clone())
            },
            content: record.content.clone(),
            metadata,
            order: record.order,
            embedding: if record.vector.is_empty() {
                None
            } else {
                Some(record.vector.clone())
            },
            document_uri: None,
            document_title: None,
        }
    }

    /// Store chunks, generating embeddings for any that lack one. All
    /// chunks must carry a `document_id`.
    pub async fn create(&self, mut chunks: Vec<Chunk>) -> Result<Vec<Chunk>> {
        if chunks.is_empty() {
            return Ok(chunks);
        }
        embeddings::embed_with_retry(self.embedder.as_ref(), &mut chunks).await?;
        let records: Vec<ChunkRecord> = chunks
            .iter()
            .map(Self::to_record)
            .collect::<Result<_>>()?;
        self.store.append_chunks(&records).await?;
        Ok(chunks)
    }

    pub async fn get_by_id(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let predicate = format!("id = {}", schema::sql_quote(chunk_id));
        let records = self.store.query_chunks(Some(&predicate), Some(1), None).await?;
        Ok(records.first().map(Self::from_record))
    }

    /// All chunks of a document ordered by `order`, with document uri and
    /// title joined in.
    pub async fn get_by_document_id(
        &self,
        document_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Chunk>> {
        let predicate = format!("document_id = {}", schema::sql_quote(document_id));
        let mut records = self.store.query_chunks(Some(&predicate), None, None).await?;
        records.sort_by_key(|r| r.order);

        let offset = offset.unwrap_or(0);
        let records: Vec<_> = records
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        let doc_predicate = format!("id = {}", schema::sql_quote(document_id));
        let docs = self
            .store
            .query_documents(Some(&doc_predicate), Some(1), None)
            .await?;
        let (uri, title) = docs
            .first()
            .map(|d| (d.uri.clone(), d.title.clone()))
            .unwrap_or((None, None));

        Ok(records
            .iter()
            .map(|r| {
                let mut chunk = Self::from_record(r);
                chunk.document_uri = uri.clone();
                chunk.document_title = title.clone();
                chunk
            })
            .collect())
    }

    pub async fn count_by_document_id(&self, document_id: &str) -> Result<usize> {
        let predicate = format!("document_id = {}", schema::sql_quote(document_id));
        self.store.count_chunks(Some(&predicate)).await
    }

    pub async fn delete(&self, chunk_id: &str) -> Result<bool> {
        if self.get_by_id(chunk_id).await?.is_none() {
            return Ok(false);
        }
        self.store
            .delete_chunks(&format!("id = {}", schema::sql_quote(chunk_id)))
            .await?;
        Ok(true)
    }

    pub async fn delete_by_document_id(&self, document_id: &str) -> Result<bool> {
        let count = self.count_by_document_id(document_id).await?;
        if count == 0 {
            return Ok(false);
        }
        self.store
            .delete_chunks(&format!("document_id = {}", schema::sql_quote(document_id)))
            .await?;
        Ok(true)
    }

    pub async fn list_all(&self, limit: Option<usize>, offset: Option<usize>) -> Result<Vec<Chunk>> {
        let records = self.store.query_chunks(None, limit, offset).await?;
        Ok(records.iter().map(Self::from_record).collect())
    }

    /// Search chunks. A filter restricts to documents matching a
    /// restricted SQL-WHERE predicate over the documents table, resolved to
    /// an id set before any chunk search runs.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        search_type: SearchType,
        doc_filter: Option<&str>,
    ) -> Result<Vec<(Chunk, f32)>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let allowed_docs: Option<HashSet<String>> = match doc_filter {
            Some(raw) => {
                let predicate = filter::compile(raw)?;
                let ids = self.store.document_ids(Some(&predicate)).await?;
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                Some(ids.into_iter().collect())
            }
            None => None,
        };
        let chunk_predicate = allowed_docs.as_ref().map(|ids| {
            let list = ids
                .iter()
                .map(|id| schema::sql_quote(id))
                .collect::<Vec<_>>()
                .join(", ");
            format!("document_id IN ({list})")
        });

        let scored = match search_type {
            SearchType::Vector => {
                self.vector_search(query, limit, chunk_predicate.as_deref())
                    .await?
            }
            SearchType::Fts => self.fts_search(query, limit, allowed_docs.as_ref()).await?,
            SearchType::Hybrid => {
                self.hybrid_search(query, limit, chunk_predicate.as_deref(), allowed_docs.as_ref())
                    .await?
            }
        };

        self.attach_document_info(scored).await
    }

    async fn vector_search(
        &self,
        query: &str,
        limit: usize,
        predicate: Option<&str>,
    ) -> Result<Vec<(Chunk, f32)>> {
        let vector = self.embedder.embed_query(query).await?;
        let hits = self
            .store
            .vector_search_chunks(&vector, limit, predicate)
            .await?;
        Ok(hits
            .into_iter()
            .map(|(record, distance)| {
                (Self::from_record(&record), search::distance_to_score(distance))
            })
            .collect())
    }

    async fn fts_search(
        &self,
        query: &str,
        limit: usize,
        allowed_docs: Option<&HashSet<String>>,
    ) -> Result<Vec<(Chunk, f32)>> {
        let hits = self.fts_hits(query, limit, allowed_docs).await?;
        let ids: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
        let mut scores: Vec<f32> = hits.iter().map(|(_, s)| *s).collect();
        search::min_max_normalize(&mut scores);

        let by_id = self.fetch_by_ids(&ids).await?;
        Ok(ids
            .iter()
            .zip(scores)
            .filter_map(|(id, score)| by_id.get(id).map(|c| (c.clone(), score)))
            .collect())
    }

    /// Raw BM25 hits as `(chunk_id, score)`, filtered to allowed documents.
    async fn fts_hits(
        &self,
        query: &str,
        limit: usize,
        allowed_docs: Option<&HashSet<String>>,
    ) -> Result<Vec<(String, f32)>> {
        self.store.ensure_fts_index().await?;
        // Over-fetch when a document filter applies; tantivy does not know
        // about it.
        let fetch = if allowed_docs.is_some() { limit * 10 } else { limit };
        let hits = self.store.text_index().search(query, fetch.max(limit))?;
        Ok(hits
            .into_iter()
            .filter(|hit| {
                allowed_docs
                    .map(|docs| docs.contains(&hit.document_id))
                    .unwrap_or(true)
            })
            .take(limit)
            .map(|hit| (hit.chunk_id, hit.score))
            .collect())
    }

    async fn hybrid_search(
        &self,
        query: &str,
        limit: usize,
        predicate: Option<&str>,
        allowed_docs: Option<&HashSet<String>>,
    ) -> Result<Vec<(Chunk, f32)>> {
        let (vector_hits, fts_hits) = futures::join!(
            self.vector_search(query, limit, predicate),
            self.fts_hits(query, limit, allowed_docs)
        );
        let vector_hits = vector_hits?;
        let fts_hits = fts_hits?;

        let vector_ids: Vec<String> = vector_hits.iter().map(|(c, _)| c.id.clone()).collect();
        let fts_ids: Vec<String> = fts_hits.iter().map(|(id, _)| id.clone()).collect();

        let mut fused = search::reciprocal_rank_fusion(&vector_ids, &fts_ids, RRF_K, limit);
        search::normalize_by_max(&mut fused);

        // Vector hits already carry full chunk data; fetch the rest.
        let mut by_id: HashMap<String, Chunk> = vector_hits
            .into_iter()
            .map(|(c, _)| (c.id.clone(), c))
            .collect();
        let missing: Vec<String> = fused
            .iter()
            .filter(|(id, _)| !by_id.contains_key(id))
            .map(|(id, _)| id.clone())
            .collect();
        by_id.extend(self.fetch_by_ids(&missing).await?);

        Ok(fused
            .into_iter()
            .filter_map(|(id, score)| by_id.get(&id).map(|c| (c.clone(), score)))
            .collect())
    }

    /// Look up chunks by id, batched to keep predicates bounded.
    async fn fetch_by_ids(&self, ids: &[String]) -> Result<HashMap<String, Chunk>> {
        let mut out = HashMap::new();
        for batch in ids.chunks(50) {
            if batch.is_empty() {
                continue;
            }
            let list = batch
                .iter()
                .map(|id| schema::sql_quote(id))
                .collect::<Vec<_>>()
                .join(", ");
            let predicate = format!("id IN ({list})");
            let records = self.store.query_chunks(Some(&predicate), None, None).await?;
            for record in &records {
                out.insert(record.id.clone(), Self::from_record(record));
            }
        }
        Ok(out)
    }

    /// Join document uri/title onto scored chunks, one lookup per document.
    async fn attach_document_info(
        &self,
        scored: Vec<(Chunk, f32)>,
    ) -> Result<Vec<(Chunk, f32)>> {
        let doc_ids: HashSet<String> = scored
            .iter()
            .filter_map(|(c, _)| c.document_id.clone())
            .collect();
        if doc_ids.is_empty() {
            return Ok(scored);
        }
        let list = doc_ids
            .iter()
            .map(|id| schema::sql_quote(id))
            .collect::<Vec<_>>()
            .join(", ");
        let docs = self
            .store
            .query_documents(Some(&format!("id IN ({list})")), None, None)
            .await?;
        let info: HashMap<String, (Option<String>, Option<String>)> = docs
            .into_iter()
            .map(|d| (d.id.clone(), (d.uri, d.title)))
            .collect();
        Ok(scored
            .into_iter()
            .map(|(mut chunk, score)| {
                if let Some(doc_id) = &chunk.document_id {
                    if let Some((uri, title)) = info.get(doc_id) {
                        chunk.document_uri = uri.clone();
                        chunk.document_title = title.clone();
                    }
                }
                (chunk, score)
            })
            .collect())
    }

    /// Re-embed every chunk of a document in place without changing chunk
    /// boundaries. Returns how many rows actually changed.
    pub async fn reembed_document(&self, document_id: &str) -> Result<usize> {
        let predicate = format!("document_id = {}", schema::sql_quote(document_id));
        let records = self.store.query_chunks(Some(&predicate), None, None).await?;
        if records.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = records.iter().map(|r| r.content_fts.clone()).collect();
        let vectors =
            embeddings::embed_texts_with_retry(self.embedder.as_ref(), &texts).await?;
        let updated: Vec<ChunkRecord> = records
            .into_iter()
            .zip(vectors)
            .filter(|(record, vector)| &record.vector != vector)
            .map(|(mut record, vector)| {
                record.vector = vector;
                record
            })
            .collect();
        let count = updated.len();
        if count > 0 {
            self.store.upsert_chunks(&updated).await?;
        }
        Ok(count)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub async fn optimize(&self) -> Result<()> {
        self.store.optimize(TableKind::Chunks).await
    }
}
