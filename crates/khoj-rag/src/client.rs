//! High-level client: open a store, ingest sources (convert → chunk →
//! embed → write, rolled back on failure), search (retrieve → rerank →
//! expand → cite), and run maintenance (rebuild, vacuum, migrate).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunker::Chunker;
use crate::citations::CitationRegistry;
use crate::config::RagConfig;
use crate::converter::{Converter, MarkdownConverter};
use crate::document::StructuredDocument;
use crate::embeddings::{Embedder, HttpImageEmbedder, ImageEmbedder, OllamaEmbedder};
use crate::error::{Error, Result};
use crate::expansion::{self, ExpansionCaps};
use crate::reranking::Reranker;
use crate::repository::{AssetRepository, ChunkRepository, DocumentRepository};
use crate::search::{filter, SearchType};
use crate::store::{OpenOptions, Store};
use crate::tokens::{HeuristicCounter, HfTokenCounter, TokenCounter};
use crate::types::{Chunk, Citation, Document, SearchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebuildMode {
    /// Re-convert from source URIs where accessible, re-chunk, re-embed.
    #[default]
    Full,
    /// Re-chunk from stored content, re-embed.
    Rechunk,
    /// Re-embed existing chunks in place.
    EmbedOnly,
}

impl RebuildMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(RebuildMode::Full),
            "rechunk" => Some(RebuildMode::Rechunk),
            "embed_only" => Some(RebuildMode::EmbedOnly),
            _ => None,
        }
    }
}

/// Options for [`RagClient::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub search_type: SearchType,
    /// Restricted SQL-WHERE over the documents table.
    pub filter: Option<String>,
}

/// Field updates for [`RagClient::update_document_fields`]. `content` and
/// `structured_doc_json` are mutually exclusive; the structured JSON and
/// its version must come together.
#[derive(Default)]
pub struct DocumentUpdate {
    pub content: Option<String>,
    pub title: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub chunks: Option<Vec<Chunk>>,
    pub structured_doc_json: Option<String>,
    pub structured_doc_version: Option<String>,
}

pub struct RagClientBuilder {
    db_path: PathBuf,
    config: RagConfig,
    options: OpenOptions,
    embedder: Option<Arc<dyn Embedder>>,
    converter: Option<Arc<dyn Converter>>,
    reranker: Option<Arc<dyn Reranker>>,
    image_embedder: Option<Arc<dyn ImageEmbedder>>,
}

impl RagClientBuilder {
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = config;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.options.create = create;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.read_only = read_only;
        self
    }

    pub fn skip_validation(mut self, skip: bool) -> Self {
        self.options.skip_validation = skip;
        self
    }

    pub fn skip_migration_check(mut self, skip: bool) -> Self {
        self.options.skip_migration_check = skip;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn image_embedder(mut self, embedder: Arc<dyn ImageEmbedder>) -> Self {
        self.image_embedder = Some(embedder);
        self
    }

    pub async fn build(self) -> Result<RagClient> {
        let config = self.config;
        config.validate().map_err(Error::ConfigValidation)?;

        let embedder = self.embedder.unwrap_or_else(|| {
            Arc::new(OllamaEmbedder::new(
                config.embeddings.base_url.clone(),
                config.embeddings.model.clone(),
                config.embeddings.vector_dim,
            ))
        });
        if embedder.vector_dim() != config.embeddings.vector_dim {
            return Err(Error::ConfigValidation(format!(
                "embedder produces dim {}, config says {}",
                embedder.vector_dim(),
                config.embeddings.vector_dim
            )));
        }

        let converter = self
            .converter
            .unwrap_or_else(|| Arc::new(MarkdownConverter::new()) as Arc<dyn Converter>);

        let counter: Arc<dyn TokenCounter> = match &config.processing.tokenizer_file {
            Some(path) => Arc::new(HfTokenCounter::from_file(path)?),
            None => Arc::new(HeuristicCounter),
        };
        let chunker = Arc::new(Chunker::new(config.processing.chunker.clone(), counter));

        let store = Arc::new(Store::open(&self.db_path, &config, self.options).await?);
        let chunks = Arc::new(ChunkRepository::new(store.clone(), embedder.clone()));
        let documents = DocumentRepository::new(store.clone(), chunks.clone(), chunker.clone());

        let image_embedder = self.image_embedder.or_else(|| {
            if config.multimodal.enabled {
                Some(Arc::new(HttpImageEmbedder::new(
                    config.multimodal.base_url.clone(),
                    config.multimodal.model.clone(),
                    config.multimodal.vector_dim,
                    config.multimodal.embed_batch_size,
                )) as Arc<dyn ImageEmbedder>)
            } else {
                None
            }
        });
        let assets = image_embedder.map(|e| AssetRepository::new(store.clone(), e));

        Ok(RagClient {
            config,
            store,
            documents,
            chunks,
            assets,
            converter,
            chunker,
            reranker: self.reranker,
            citations: parking_lot::Mutex::new(CitationRegistry::new()),
        })
    }
}

pub struct RagClient {
    config: RagConfig,
    store: Arc<Store>,
    documents: DocumentRepository,
    chunks: Arc<ChunkRepository>,
    assets: Option<AssetRepository>,
    converter: Arc<dyn Converter>,
    chunker: Arc<Chunker>,
    reranker: Option<Arc<dyn Reranker>>,
    citations: parking_lot::Mutex<CitationRegistry>,
}

impl std::fmt::Debug for RagClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RagClient {
    pub fn builder(db_path: impl Into<PathBuf>) -> RagClientBuilder {
        RagClientBuilder {
            db_path: db_path.into(),
            config: RagConfig::default(),
            options: OpenOptions::default(),
            embedder: None,
            converter: None,
            reranker: None,
            image_embedder: None,
        }
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn chunk_repository(&self) -> &Arc<ChunkRepository> {
        &self.chunks
    }

    pub fn document_repository(&self) -> &DocumentRepository {
        &self.documents
    }

    /// Convert raw text into its structured form.
    pub async fn convert(&self, content: &str, name: Option<&str>) -> Result<StructuredDocument> {
        self.converter.convert_text(content, name).await
    }

    /// Chunk a structured document without storing anything.
    pub fn chunk(&self, doc: &StructuredDocument) -> Result<Vec<Chunk>> {
        self.chunker.chunk(doc)
    }

    /// Fill in any missing chunk embeddings (bounded retries on transient
    /// embedding failures).
    pub async fn ensure_chunks_embedded(&self, mut chunks: Vec<Chunk>) -> Result<Vec<Chunk>> {
        crate::embeddings::embed_with_retry(self.chunks.embedder().as_ref(), &mut chunks).await?;
        Ok(chunks)
    }

    // ── Ingestion ──────────────────────────────────────────────────────

    /// Create a document from text content: convert, chunk, embed, store.
    pub async fn create_document(
        &self,
        content: &str,
        uri: Option<&str>,
        title: Option<&str>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Document> {
        let structured = self.converter.convert_text(content, title).await?;
        let mut document = Document::new(content);
        document.uri = uri.map(String::from);
        document.title = title.map(String::from);
        document.metadata = metadata.unwrap_or_default();
        document.structured_doc_json = Some(structured.to_json()?);
        document.structured_doc_version = Some(structured.version.clone());
        self.documents
            .create_and_chunk(document, Some(&structured), None)
            .await
    }

    /// Import a pre-processed document with externally produced chunks.
    pub async fn import_document(
        &self,
        content: &str,
        chunks: Vec<Chunk>,
        uri: Option<&str>,
        title: Option<&str>,
        metadata: Option<HashMap<String, serde_json::Value>>,
        structured_doc_json: Option<String>,
        structured_doc_version: Option<String>,
    ) -> Result<Document> {
        if structured_doc_json.is_some() != structured_doc_version.is_some() {
            return Err(Error::InvalidInput(
                "structured_doc_json and structured_doc_version must both be provided or both be None"
                    .into(),
            ));
        }
        if let Some(json) = &structured_doc_json {
            StructuredDocument::from_json(json)?;
        }

        let chunks = self.ensure_chunks_embedded(chunks).await?;
        let mut document = Document::new(content);
        document.uri = uri.map(String::from);
        document.title = title.map(String::from);
        document.metadata = metadata.unwrap_or_default();
        document.structured_doc_json = structured_doc_json;
        document.structured_doc_version = structured_doc_version;
        self.documents
            .create_and_chunk(document, None, Some(chunks))
            .await
    }

    /// Create or update documents from a file path, directory, or URL.
    /// Existing documents are matched by URI and compared by md5: unchanged
    /// content is a no-op (title/metadata may still refresh), changed
    /// content updates and rechunks.
    pub async fn create_document_from_source(
        &self,
        source: &str,
        title: Option<&str>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Vec<Document>> {
        if source.starts_with("http://") || source.starts_with("https://") {
            let doc = self
                .create_document_from_url(source, title, metadata)
                .await?;
            return Ok(vec![doc]);
        }
        let path = match source.strip_prefix("file://") {
            Some(rest) => PathBuf::from(rest),
            None => PathBuf::from(source),
        };
        if path.is_dir() {
            let mut documents = Vec::new();
            for entry in walkdir::WalkDir::new(&path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let extension = entry
                    .path()
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                    .unwrap_or_default();
                if !self.converter.supported_extensions().contains(&extension) {
                    continue;
                }
                documents.push(
                    self.create_document_from_file(entry.path(), None, metadata.clone())
                        .await?,
                );
            }
            return Ok(documents);
        }
        let doc = self
            .create_document_from_file(&path, title, metadata)
            .await?;
        Ok(vec![doc])
    }

    pub async fn create_document_from_file(
        &self,
        path: &Path,
        title: Option<&str>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Document> {
        if !path.exists() {
            return Err(Error::InvalidInput(format!(
                "file does not exist: {}",
                path.display()
            )));
        }
        let bytes = std::fs::read(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let digest = format!("{:x}", md5::compute(&bytes));
        let uri = format!(
            "file://{}",
            path.canonicalize()
                .unwrap_or_else(|_| path.to_path_buf())
                .display()
        );
        let mut metadata = metadata.unwrap_or_default();
        metadata.insert(
            "contentType".to_string(),
            serde_json::Value::String(content_type_for(path)),
        );
        metadata.insert("md5".to_string(), serde_json::Value::String(digest.clone()));

        if let Some(existing) = self.documents.get_by_uri(&uri).await? {
            if existing.md5() == Some(digest.as_str()) {
                return self.refresh_unchanged(existing, title, metadata).await;
            }
            let structured = self.converter.convert_file(path).await?;
            let mut updated = existing;
            updated.content = structured.export_to_markdown();
            updated.metadata = metadata;
            updated.structured_doc_json = Some(structured.to_json()?);
            updated.structured_doc_version = Some(structured.version.clone());
            if let Some(title) = title {
                updated.title = Some(title.to_string());
            }
            return self
                .documents
                .update_and_rechunk(updated, Some(&structured), None)
                .await;
        }

        let structured = self.converter.convert_file(path).await?;
        let mut document = Document::new(structured.export_to_markdown());
        document.uri = Some(uri);
        document.title = title.map(String::from);
        document.metadata = metadata;
        document.structured_doc_json = Some(structured.to_json()?);
        document.structured_doc_version = Some(structured.version.clone());
        self.documents
            .create_and_chunk(document, Some(&structured), None)
            .await
    }

    pub async fn create_document_from_url(
        &self,
        url: &str,
        title: Option<&str>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Document> {
        let response = reqwest::get(url)
            .await
            .map_err(|e| Error::ConversionFailed(format!("fetching {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ConversionFailed(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::ConversionFailed(format!("reading {url}: {e}")))?;
        let digest = format!("{:x}", md5::compute(&bytes));

        let mut metadata = metadata.unwrap_or_default();
        metadata.insert(
            "contentType".to_string(),
            serde_json::Value::String(content_type.clone()),
        );
        metadata.insert("md5".to_string(), serde_json::Value::String(digest.clone()));

        if let Some(existing) = self.documents.get_by_uri(url).await? {
            if existing.md5() == Some(digest.as_str()) {
                return self.refresh_unchanged(existing, title, metadata).await;
            }
        }

        let extension = extension_for(url, &content_type);
        if !self.converter.supported_extensions().contains(&extension) {
            return Err(Error::InvalidInput(format!(
                "unsupported content type/extension: {content_type}/{extension}"
            )));
        }

        // The converter boundary is file-based; stage the download.
        let temp_path = std::env::temp_dir().join(format!(
            "khoj-download-{}{extension}",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&temp_path, &bytes).map_err(|source| Error::Io {
            path: temp_path.clone(),
            source,
        })?;
        let converted = self.converter.convert_file(&temp_path).await;
        std::fs::remove_file(&temp_path).ok();
        let structured = converted?;

        if let Some(existing) = self.documents.get_by_uri(url).await? {
            let mut updated = existing;
            updated.content = structured.export_to_markdown();
            updated.metadata = metadata;
            updated.structured_doc_json = Some(structured.to_json()?);
            updated.structured_doc_version = Some(structured.version.clone());
            if let Some(title) = title {
                updated.title = Some(title.to_string());
            }
            return self
                .documents
                .update_and_rechunk(updated, Some(&structured), None)
                .await;
        }

        let mut document = Document::new(structured.export_to_markdown());
        document.uri = Some(url.to_string());
        document.title = title.map(String::from);
        document.metadata = metadata;
        document.structured_doc_json = Some(structured.to_json()?);
        document.structured_doc_version = Some(structured.version.clone());
        self.documents
            .create_and_chunk(document, Some(&structured), None)
            .await
    }

    /// md5 unchanged: no reconversion, but a provided title or genuinely
    /// new metadata still lands.
    async fn refresh_unchanged(
        &self,
        mut existing: Document,
        title: Option<&str>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Document> {
        let mut changed = false;
        if let Some(title) = title {
            if existing.title.as_deref() != Some(title) {
                existing.title = Some(title.to_string());
                changed = true;
            }
        }
        let mut merged = existing.metadata.clone();
        for (k, v) in metadata {
            merged.insert(k, v);
        }
        if merged != existing.metadata {
            existing.metadata = merged;
            changed = true;
        }
        if changed {
            return self.documents.update(existing).await;
        }
        Ok(existing)
    }

    pub async fn get_document_by_id(&self, document_id: &str) -> Result<Option<Document>> {
        self.documents.get_by_id(document_id).await
    }

    pub async fn get_document_by_uri(&self, uri: &str) -> Result<Option<Document>> {
        self.documents.get_by_uri(uri).await
    }

    /// Replace a document's content wholesale: reconvert and rechunk.
    pub async fn update_document(&self, document: Document) -> Result<Document> {
        let structured = self
            .converter
            .convert_text(&document.content, document.title.as_deref())
            .await?;
        let mut document = document;
        document.structured_doc_json = Some(structured.to_json()?);
        document.structured_doc_version = Some(structured.version.clone());
        self.documents
            .update_and_rechunk(document, Some(&structured), None)
            .await
    }

    /// Update specific fields. Title/metadata-only updates do not rechunk.
    pub async fn update_document_fields(
        &self,
        document_id: &str,
        update: DocumentUpdate,
    ) -> Result<Document> {
        if update.content.is_some() && update.structured_doc_json.is_some() {
            return Err(Error::InvalidInput(
                "content and structured_doc_json are mutually exclusive".into(),
            ));
        }
        if update.structured_doc_json.is_some() != update.structured_doc_version.is_some() {
            return Err(Error::InvalidInput(
                "structured_doc_json and structured_doc_version must both be provided or both be None"
                    .into(),
            ));
        }
        let structured = match &update.structured_doc_json {
            Some(json) => Some(StructuredDocument::from_json(json)?),
            None => None,
        };

        let mut existing = self
            .documents
            .get_by_id(document_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {document_id}")))?;

        if let Some(title) = &update.title {
            existing.title = Some(title.clone());
        }
        if let Some(metadata) = update.metadata {
            existing.metadata = metadata;
        }

        // Metadata/title only: no rechunk.
        if update.content.is_none() && update.chunks.is_none() && structured.is_none() {
            return self.documents.update(existing).await;
        }

        if let Some(chunks) = update.chunks {
            match update.content {
                Some(content) => existing.content = content,
                None => {
                    if let Some(sdoc) = &structured {
                        existing.content = sdoc.export_to_markdown();
                    }
                }
            }
            if structured.is_some() {
                existing.structured_doc_json = update.structured_doc_json.clone();
                existing.structured_doc_version = update.structured_doc_version.clone();
            }
            return self
                .documents
                .update_and_rechunk(existing, None, Some(chunks))
                .await;
        }

        if let Some(sdoc) = structured {
            existing.content = sdoc.export_to_markdown();
            existing.structured_doc_json = update.structured_doc_json;
            existing.structured_doc_version = update.structured_doc_version;
            return self
                .documents
                .update_and_rechunk(existing, Some(&sdoc), None)
                .await;
        }

        // Content without chunks: convert and rechunk.
        let content = update.content.unwrap_or_default();
        let structured = self
            .converter
            .convert_text(&content, existing.title.as_deref())
            .await?;
        existing.content = content;
        existing.structured_doc_json = Some(structured.to_json()?);
        existing.structured_doc_version = Some(structured.version.clone());
        self.documents
            .update_and_rechunk(existing, Some(&structured), None)
            .await
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        self.documents.delete(document_id).await
    }

    pub async fn list_documents(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
        doc_filter: Option<&str>,
    ) -> Result<Vec<Document>> {
        let predicate = match doc_filter {
            Some(raw) => Some(filter::compile(raw)?),
            None => None,
        };
        self.documents
            .list_all(limit, offset, predicate.as_deref())
            .await
    }

    // ── Search ─────────────────────────────────────────────────────────

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        let limit = options.limit.unwrap_or(self.config.search.limit);

        let scored = match &self.reranker {
            None => {
                self.chunks
                    .search(query, limit, options.search_type, options.filter.as_deref())
                    .await?
            }
            Some(reranker) => {
                let raw = self
                    .chunks
                    .search(
                        query,
                        limit * 10,
                        options.search_type,
                        options.filter.as_deref(),
                    )
                    .await?;
                let candidates: Vec<Chunk> = raw.into_iter().map(|(c, _)| c).collect();
                reranker.rerank(query, candidates, limit).await?
            }
        };

        Ok(scored
            .iter()
            .map(|(chunk, score)| SearchResult::from_chunk(chunk, *score))
            .collect())
    }

    /// Expand hits into coherent passages. `radius` defaults to the
    /// configured context radius; 0 returns the inputs unchanged.
    pub async fn expand_context(
        &self,
        results: Vec<SearchResult>,
        radius: Option<usize>,
    ) -> Result<Vec<SearchResult>> {
        let radius = radius.unwrap_or(self.config.search.context_radius);
        if radius == 0 || results.is_empty() {
            return Ok(results);
        }
        let caps = ExpansionCaps {
            max_items: self.config.search.max_context_items,
            max_chars: self.config.search.max_context_chars,
        };

        // Group by document, preserving first-hit order.
        let mut groups: Vec<(Option<String>, Vec<SearchResult>)> = Vec::new();
        for result in results {
            let key = result.document_id.clone();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(result),
                None => groups.push((key, vec![result])),
            }
        }

        let mut expanded = Vec::new();
        for (document_id, group) in groups {
            let Some(document_id) = document_id else {
                expanded.extend(group);
                continue;
            };
            let Some(document) = self.documents.get_by_id(&document_id).await? else {
                expanded.extend(group);
                continue;
            };

            let structured = document.structured_document();
            let has_refs = group.iter().any(|r| !r.doc_item_refs.is_empty());
            match structured {
                Some(sdoc) if has_refs => {
                    expanded.extend(expansion::expand_structural(group, &sdoc, radius, caps));
                }
                _ => {
                    let chunks = self
                        .chunks
                        .get_by_document_id(&document_id, None, None)
                        .await?;
                    expanded.extend(expansion::expand_chunk_order(group, &chunks, radius));
                }
            }
        }
        Ok(expanded)
    }

    /// Assign stable citation indices to a batch of results. Indices are
    /// session-scoped: the same chunk keeps its number across calls.
    pub fn cite(&self, results: &[SearchResult]) -> Vec<Citation> {
        self.citations.lock().cite(results)
    }

    pub fn citation_registry_json(&self) -> Result<String> {
        serde_json::to_string(&*self.citations.lock()).map_err(Into::into)
    }

    /// Text-to-image search over indexed image assets.
    pub async fn search_images(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<crate::repository::AssetHit>> {
        match &self.assets {
            Some(assets) => assets.search(query, limit).await,
            None => Err(Error::InvalidInput(
                "multimodal embeddings are not configured".into(),
            )),
        }
    }

    pub fn asset_repository(&self) -> Option<&AssetRepository> {
        self.assets.as_ref()
    }

    // ── Maintenance ────────────────────────────────────────────────────

    /// Rebuild the database. Returns processed document ids in order;
    /// progress is logged per document. Ends with a vacuum when auto
    /// vacuum is enabled.
    pub async fn rebuild(&self, mode: RebuildMode) -> Result<Vec<String>> {
        // Record current settings; a rebuild is the sanctioned way to
        // change chunker config or embedding model on an existing store.
        let mut settings = self.store.settings();
        settings.embedding_model = self.config.embeddings.model.clone();
        settings.embedding_vector_dim = self.config.embeddings.vector_dim;
        settings.chunker = self.config.processing.chunker.clone();
        self.store.save_settings(&settings).await?;

        let documents = self.documents.list_all(None, None, None).await?;
        let mut processed = Vec::with_capacity(documents.len());

        for document in documents {
            let Some(document_id) = document.id.clone() else {
                continue;
            };
            match mode {
                RebuildMode::EmbedOnly => {
                    let changed = self.chunks.reembed_document(&document_id).await?;
                    tracing::info!(document_id, changed, "re-embedded document");
                }
                RebuildMode::Rechunk => {
                    self.rebuild_from_content(document).await?;
                }
                RebuildMode::Full => {
                    if let Some(uri) = document.uri.clone() {
                        if self.source_accessible(&uri) {
                            self.documents.delete(&document_id).await?;
                            let recreated = self
                                .create_document_from_source(
                                    &uri,
                                    document.title.as_deref(),
                                    Some(document.metadata.clone()),
                                )
                                .await?;
                            processed.extend(recreated.into_iter().filter_map(|d| d.id));
                            continue;
                        }
                        tracing::warn!(uri, "source missing, rebuilding from stored content");
                    }
                    self.rebuild_from_content(document).await?;
                }
            }
            processed.push(document_id);
        }

        if self.config.storage.auto_vacuum {
            self.store
                .vacuum(self.config.storage.vacuum_retention_seconds)
                .await?;
        }
        Ok(processed)
    }

    async fn rebuild_from_content(&self, document: Document) -> Result<Document> {
        let structured = self
            .converter
            .convert_text(&document.content, document.title.as_deref())
            .await?;
        let mut document = document;
        document.structured_doc_json = Some(structured.to_json()?);
        document.structured_doc_version = Some(structured.version.clone());
        self.documents
            .update_and_rechunk(document, Some(&structured), None)
            .await
    }

    fn source_accessible(&self, uri: &str) -> bool {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return true;
        }
        match uri.strip_prefix("file://") {
            Some(path) => Path::new(path).exists(),
            None => Path::new(uri).exists(),
        }
    }

    pub async fn vacuum(&self, retention_seconds: Option<u64>) -> Result<()> {
        self.store
            .vacuum(retention_seconds.unwrap_or(self.config.storage.vacuum_retention_seconds))
            .await
    }

    pub async fn create_vector_index(&self) -> Result<bool> {
        self.store.create_vector_index().await
    }

    pub async fn migrate(&self) -> Result<Vec<String>> {
        self.store.migrate().await
    }

    /// Release the store: waits for in-flight vacuum work. Idempotent.
    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn content_type_for(path: &Path) -> String {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("md") | Some("markdown") => "text/markdown".to_string(),
        Some("txt") => "text/plain".to_string(),
        Some("html") | Some("htm") => "text/html".to_string(),
        Some("json") => "application/json".to_string(),
        Some("pdf") => "application/pdf".to_string(),
        Some("csv") => "text/csv".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

fn extension_for(url: &str, content_type: &str) -> String {
    const CONTENT_TYPES: &[(&str, &str)] = &[
        ("text/html", ".html"),
        ("text/markdown", ".md"),
        ("text/plain", ".txt"),
        ("application/pdf", ".pdf"),
        ("application/json", ".json"),
        ("text/csv", ".csv"),
    ];
    for (ct, ext) in CONTENT_TYPES {
        if content_type.contains(ct) {
            return ext.to_string();
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if let Some((_, ext)) = path.rsplit_once('.') {
        if !ext.contains('/') && ext.len() <= 8 {
            return format!(".{}", ext.to_lowercase());
        }
    }
    ".html".to_string()
}
