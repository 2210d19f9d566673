//! Image-region assets for multimodal retrieval. The converter (or caller)
//! supplies bbox crops of picture items; this repository embeds them and
//! indexes the vectors in the mm_assets table, keyed by
//! `(document_id, doc_item_ref, item_index)`.

use std::sync::Arc;

use uuid::Uuid;

use crate::embeddings::ImageEmbedder;
use crate::error::{Error, Result};
use crate::store::{schema, AssetRecord, Store};
use crate::types::BoundingBox;

/// One image region to index.
pub struct AssetInput {
    pub doc_item_ref: String,
    /// Disambiguates multiple crops of the same item.
    pub item_index: u32,
    pub page_no: u32,
    pub bbox: BoundingBox,
    /// Encoded image bytes (PNG/JPEG).
    pub image: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AssetHit {
    pub document_id: String,
    pub doc_item_ref: String,
    pub item_index: u32,
    pub page_no: u32,
    pub bbox: Option<BoundingBox>,
    pub score: f32,
}

pub struct AssetRepository {
    store: Arc<Store>,
    embedder: Arc<dyn ImageEmbedder>,
}

impl AssetRepository {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn ImageEmbedder>) -> Self {
        Self { store, embedder }
    }

    /// Embed and store image regions for a document. Existing assets for
    /// the same document are replaced.
    pub async fn index_document_images(
        &self,
        document_id: &str,
        inputs: Vec<AssetInput>,
    ) -> Result<usize> {
        if inputs.is_empty() {
            return Ok(0);
        }
        if self.embedder.vector_dim() != self.store.image_dim() {
            return Err(Error::ConfigValidation(format!(
                "image embedder dim {} does not match store dim {}",
                self.embedder.vector_dim(),
                self.store.image_dim()
            )));
        }

        let images: Vec<Vec<u8>> = inputs.iter().map(|i| i.image.clone()).collect();
        let vectors = self.embedder.embed_images(&images).await?;
        if vectors.len() != inputs.len() {
            return Err(Error::EmbeddingFailed(format!(
                "expected {} image vectors, got {}",
                inputs.len(),
                vectors.len()
            )));
        }

        let records: Vec<AssetRecord> = inputs
            .iter()
            .zip(vectors)
            .map(|(input, vector)| {
                Ok(AssetRecord {
                    id: Uuid::new_v4().to_string(),
                    document_id: document_id.to_string(),
                    doc_item_ref: input.doc_item_ref.clone(),
                    item_index: input.item_index,
                    page_no: input.page_no,
                    bbox: serde_json::to_string(&input.bbox)?,
                    vector,
                })
            })
            .collect::<Result<_>>()?;

        self.store
            .delete_assets(&format!(
                "document_id = {}",
                schema::sql_quote(document_id)
            ))
            .await?;
        self.store.append_assets(&records).await?;
        tracing::debug!(document_id, assets = records.len(), "indexed image assets");
        Ok(records.len())
    }

    /// Text-to-image search: embed the query in the image space and run ANN
    /// over the asset vectors.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<AssetHit>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_text(query).await?;
        let hits = self.store.vector_search_assets(&vector, limit).await?;
        Ok(hits
            .into_iter()
            .map(|(record, distance)| AssetHit {
                document_id: record.document_id,
                doc_item_ref: record.doc_item_ref,
                item_index: record.item_index,
                page_no: record.page_no,
                bbox: serde_json::from_str(&record.bbox).ok(),
                score: crate::search::distance_to_score(distance),
            })
            .collect())
    }

    pub async fn delete_by_document_id(&self, document_id: &str) -> Result<()> {
        self.store
            .delete_assets(&format!(
                "document_id = {}",
                schema::sql_quote(document_id)
            ))
            .await
    }
}
