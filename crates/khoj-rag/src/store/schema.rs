//! Arrow schemas for the four tables and the record <-> batch plumbing.
//! Timestamps are RFC3339 strings and free-form metadata is stored as JSON
//! text, which keeps the on-disk layout portable and greppable.

use std::sync::Arc;

use arrow_array::{
    Array, Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
    FixedSizeListArray,
};
use arrow_schema::{DataType, Field, Schema};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Documents,
    Chunks,
    Settings,
    MmAssets,
}

impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::Documents,
        TableKind::Chunks,
        TableKind::Settings,
        TableKind::MmAssets,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Documents => "documents",
            TableKind::Chunks => "chunks",
            TableKind::Settings => "settings",
            TableKind::MmAssets => "mm_assets",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "documents" => Some(TableKind::Documents),
            "chunks" => Some(TableKind::Chunks),
            "settings" => Some(TableKind::Settings),
            "mm_assets" => Some(TableKind::MmAssets),
            _ => None,
        }
    }
}

/// Raw row of the documents table.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub content: String,
    pub uri: Option<String>,
    pub title: Option<String>,
    /// JSON object.
    pub metadata: String,
    pub created_at: String,
    pub updated_at: String,
    pub structured_doc_json: Option<String>,
    pub structured_doc_version: Option<String>,
}

/// Raw row of the chunks table.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub content: String,
    /// Contextualized form indexed for keyword search.
    pub content_fts: String,
    /// JSON-serialized [`crate::types::ChunkMetadata`].
    pub metadata: String,
    pub order: u32,
    pub vector: Vec<f32>,
}

/// Raw row of the mm_assets table: one embedded image region.
#[derive(Debug, Clone)]
pub struct AssetRecord {
    pub id: String,
    pub document_id: String,
    pub doc_item_ref: String,
    pub item_index: u32,
    pub page_no: u32,
    /// JSON-serialized bounding box, bottom-left origin.
    pub bbox: String,
    pub vector: Vec<f32>,
}

pub fn documents_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("uri", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("created_at", DataType::Utf8, false),
        Field::new("updated_at", DataType::Utf8, false),
        Field::new("structured_doc_json", DataType::Utf8, true),
        Field::new("structured_doc_version", DataType::Utf8, true),
    ]))
}

pub fn chunks_schema(dim: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("document_id", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("content_fts", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("order", DataType::UInt32, false),
        Field::new("vector", vector_type(dim), true),
    ]))
}

pub fn settings_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::UInt32, false),
        Field::new("settings", DataType::Utf8, false),
    ]))
}

pub fn mm_assets_schema(dim: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("document_id", DataType::Utf8, false),
        Field::new("doc_item_ref", DataType::Utf8, false),
        Field::new("item_index", DataType::UInt32, false),
        Field::new("page_no", DataType::UInt32, false),
        Field::new("bbox", DataType::Utf8, false),
        Field::new("vector", vector_type(dim), true),
    ]))
}

fn vector_type(dim: usize) -> DataType {
    DataType::FixedSizeList(
        Arc::new(Field::new("item", DataType::Float32, true)),
        dim as i32,
    )
}

fn vector_array(vectors: impl Iterator<Item = Vec<f32>>, dim: usize) -> FixedSizeListArray {
    let flat: Vec<f32> = vectors.flatten().collect();
    FixedSizeListArray::new(
        Arc::new(Field::new("item", DataType::Float32, true)),
        dim as i32,
        Arc::new(Float32Array::from(flat)) as Arc<dyn Array>,
        None,
    )
}

type BatchReader = RecordBatchIterator<std::vec::IntoIter<std::result::Result<RecordBatch, arrow_schema::ArrowError>>>;

fn reader(batch: RecordBatch, schema: Arc<Schema>) -> Box<BatchReader> {
    Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema))
}

pub fn documents_batch(records: &[DocumentRecord]) -> Result<Box<BatchReader>> {
    let schema = documents_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(
                records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            )) as Arc<dyn Array>,
            Arc::new(StringArray::from(
                records.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.uri.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.title.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.metadata.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.created_at.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.updated_at.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records
                    .iter()
                    .map(|r| r.structured_doc_json.as_deref())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records
                    .iter()
                    .map(|r| r.structured_doc_version.as_deref())
                    .collect::<Vec<_>>(),
            )),
        ],
    )?;
    Ok(reader(batch, schema))
}

pub fn chunks_batch(records: &[ChunkRecord], dim: usize) -> Result<Box<BatchReader>> {
    for record in records {
        if record.vector.len() != dim {
            return Err(Error::InvalidInput(format!(
                "chunk {} has embedding dim {}, store expects {}",
                record.id,
                record.vector.len(),
                dim
            )));
        }
    }
    let schema = chunks_schema(dim);
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(
                records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            )) as Arc<dyn Array>,
            Arc::new(StringArray::from(
                records.iter().map(|r| r.document_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.content_fts.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.metadata.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                records.iter().map(|r| r.order).collect::<Vec<_>>(),
            )),
            Arc::new(vector_array(records.iter().map(|r| r.vector.clone()), dim)) as Arc<dyn Array>,
        ],
    )?;
    Ok(reader(batch, schema))
}

pub fn settings_batch(settings_json: &str) -> Result<Box<BatchReader>> {
    let schema = settings_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt32Array::from(vec![1u32])) as Arc<dyn Array>,
            Arc::new(StringArray::from(vec![settings_json])),
        ],
    )?;
    Ok(reader(batch, schema))
}

pub fn mm_assets_batch(records: &[AssetRecord], dim: usize) -> Result<Box<BatchReader>> {
    let schema = mm_assets_schema(dim);
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(
                records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            )) as Arc<dyn Array>,
            Arc::new(StringArray::from(
                records.iter().map(|r| r.document_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.doc_item_ref.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                records.iter().map(|r| r.item_index).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                records.iter().map(|r| r.page_no).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.bbox.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(vector_array(records.iter().map(|r| r.vector.clone()), dim)) as Arc<dyn Array>,
        ],
    )?;
    Ok(reader(batch, schema))
}

fn str_col<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
}

fn u32_col<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a UInt32Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
}

fn opt_str(col: Option<&StringArray>, row: usize) -> Option<String> {
    col.and_then(|c| {
        if c.is_null(row) {
            None
        } else {
            Some(c.value(row).to_string())
        }
    })
}

pub fn documents_from_batches(batches: &[RecordBatch]) -> Vec<DocumentRecord> {
    let mut out = Vec::new();
    for batch in batches {
        let (Some(ids), Some(contents)) = (str_col(batch, "id"), str_col(batch, "content")) else {
            continue;
        };
        let uris = str_col(batch, "uri");
        let titles = str_col(batch, "title");
        let metadatas = str_col(batch, "metadata");
        let created = str_col(batch, "created_at");
        let updated = str_col(batch, "updated_at");
        let sd_json = str_col(batch, "structured_doc_json");
        let sd_version = str_col(batch, "structured_doc_version");

        for row in 0..batch.num_rows() {
            out.push(DocumentRecord {
                id: ids.value(row).to_string(),
                content: contents.value(row).to_string(),
                uri: opt_str(uris, row),
                title: opt_str(titles, row),
                metadata: opt_str(metadatas, row).unwrap_or_else(|| "{}".to_string()),
                created_at: opt_str(created, row).unwrap_or_default(),
                updated_at: opt_str(updated, row).unwrap_or_default(),
                structured_doc_json: opt_str(sd_json, row),
                structured_doc_version: opt_str(sd_version, row),
            });
        }
    }
    out
}

/// Extract chunk rows; the second tuple element is the ANN `_distance`
/// column when the batch came from a vector search.
pub fn chunks_from_batches(batches: &[RecordBatch]) -> Vec<(ChunkRecord, Option<f32>)> {
    let mut out = Vec::new();
    for batch in batches {
        let (Some(ids), Some(contents)) = (str_col(batch, "id"), str_col(batch, "content")) else {
            continue;
        };
        let doc_ids = str_col(batch, "document_id");
        let content_fts = str_col(batch, "content_fts");
        let metadatas = str_col(batch, "metadata");
        let orders = u32_col(batch, "order");
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());
        let vectors = batch
            .column_by_name("vector")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>());

        for row in 0..batch.num_rows() {
            let vector = vectors
                .map(|v| {
                    let values = v.value(row);
                    values
                        .as_any()
                        .downcast_ref::<Float32Array>()
                        .map(|f| f.values().to_vec())
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            out.push((
                ChunkRecord {
                    id: ids.value(row).to_string(),
                    document_id: opt_str(doc_ids, row).unwrap_or_default(),
                    content: contents.value(row).to_string(),
                    content_fts: opt_str(content_fts, row).unwrap_or_default(),
                    metadata: opt_str(metadatas, row).unwrap_or_else(|| "{}".to_string()),
                    order: orders.map(|o| o.value(row)).unwrap_or(0),
                    vector,
                },
                distances.map(|d| d.value(row)),
            ));
        }
    }
    out
}

pub fn settings_from_batches(batches: &[RecordBatch]) -> Option<String> {
    for batch in batches {
        let settings = str_col(batch, "settings")?;
        if batch.num_rows() > 0 {
            return Some(settings.value(0).to_string());
        }
    }
    None
}

pub fn assets_from_batches(batches: &[RecordBatch]) -> Vec<(AssetRecord, Option<f32>)> {
    let mut out = Vec::new();
    for batch in batches {
        let (Some(ids), Some(doc_ids)) = (str_col(batch, "id"), str_col(batch, "document_id"))
        else {
            continue;
        };
        let refs = str_col(batch, "doc_item_ref");
        let item_indices = u32_col(batch, "item_index");
        let page_nos = u32_col(batch, "page_no");
        let bboxes = str_col(batch, "bbox");
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        for row in 0..batch.num_rows() {
            out.push((
                AssetRecord {
                    id: ids.value(row).to_string(),
                    document_id: doc_ids.value(row).to_string(),
                    doc_item_ref: opt_str(refs, row).unwrap_or_default(),
                    item_index: item_indices.map(|c| c.value(row)).unwrap_or(0),
                    page_no: page_nos.map(|c| c.value(row)).unwrap_or(0),
                    bbox: opt_str(bboxes, row).unwrap_or_else(|| "{}".to_string()),
                    vector: Vec::new(),
                },
                distances.map(|d| d.value(row)),
            ));
        }
    }
    out
}

/// SQL string literal with embedded quotes doubled.
pub fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
