use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A rectangle on a page, in page coordinates with bottom-left origin
/// (y grows upward, as produced by converters).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub page_no: u32,
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

/// Structured metadata carried by every chunk. `doc_item_refs` point back
/// into the source document's structure; every ref must resolve there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub doc_item_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headings: Option<Vec<String>>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub page_numbers: Vec<u32>,
}

/// The unit of embedding and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: Option<String>,
    pub content: String,
    pub metadata: ChunkMetadata,
    /// Dense position within the document, starting at 0.
    pub order: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// URI of the owning document, populated on reads that join documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
}

impl Chunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: None,
            content: content.into(),
            metadata: ChunkMetadata::default(),
            order: 0,
            embedding: None,
            document_uri: None,
            document_title: None,
        }
    }

    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// The string indexed for keyword search: heading context joined by
    /// newlines, then the raw content. Exactly `content` when no headings.
    pub fn content_fts(&self) -> String {
        contextualize(self.metadata.headings.as_deref(), &self.content)
    }
}

/// Prefix `content` with its heading path, one heading per line. This form
/// is both embedded and FTS-indexed; the raw content stays what is returned.
pub fn contextualize(headings: Option<&[String]>, content: &str) -> String {
    match headings {
        Some(h) if !h.is_empty() => {
            let mut out = h.join("\n");
            out.push('\n');
            out.push_str(content);
            out
        }
        _ => content.to_string(),
    }
}

/// A stored document: markdown export of its structured form plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Serialized structured form, when the document was converted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_doc_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_doc_version: Option<String>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            content: content.into(),
            uri: None,
            title: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            structured_doc_json: None,
            structured_doc_version: None,
        }
    }

    /// Parse the stored structured form, if any. Corrupt JSON is treated
    /// as absent so old rows degrade to chunk-order expansion.
    pub fn structured_document(&self) -> Option<crate::document::StructuredDocument> {
        let json = self.structured_doc_json.as_deref()?;
        match serde_json::from_str(json) {
            Ok(doc) => Some(doc),
            Err(err) => {
                tracing::warn!(document_id = ?self.id, %err, "stored structured doc failed to parse");
                None
            }
        }
    }

    pub fn md5(&self) -> Option<&str> {
        self.metadata.get("md5").and_then(|v| v.as_str())
    }
}

/// One search hit, score normalized into [0, 1] (higher is better).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub content: String,
    pub score: f32,
    pub chunk_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
    #[serde(default)]
    pub doc_item_refs: Vec<String>,
    /// Sorted ascending.
    #[serde(default)]
    pub page_numbers: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headings: Option<Vec<String>>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_boxes: Option<Vec<BoundingBox>>,
}

impl SearchResult {
    pub fn from_chunk(chunk: &Chunk, score: f32) -> Self {
        Self {
            content: chunk.content.clone(),
            score,
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            document_uri: chunk.document_uri.clone(),
            document_title: chunk.document_title.clone(),
            doc_item_refs: chunk.metadata.doc_item_refs.clone(),
            page_numbers: chunk.metadata.page_numbers.clone(),
            headings: chunk.metadata.headings.clone(),
            labels: chunk.metadata.labels.clone(),
            bounding_boxes: None,
        }
    }

    /// The dominant structural type of this result, used to pick the
    /// expansion strategy. Tiers: table, code, list_item, formula, caption,
    /// then any text label, then picture, then whatever comes first.
    pub fn primary_label(&self) -> Option<&str> {
        primary_label(&self.labels)
    }

    /// Render for an agent/LLM prompt. With a rank, the raw score is
    /// omitted (fused scores confuse models into thresholding on them).
    pub fn format_for_agent(&self, rank: Option<usize>, total: Option<usize>) -> String {
        let mut out = String::new();
        match (rank, total) {
            (Some(r), Some(t)) => out.push_str(&format!("[{}] [rank {} of {}]", self.chunk_id, r, t)),
            (Some(r), None) => out.push_str(&format!("[{}] [rank {}]", self.chunk_id, r)),
            _ => out.push_str(&format!("[{}] (score: {:.2})", self.chunk_id, self.score)),
        }
        let mut source_parts: Vec<String> = Vec::new();
        if let Some(title) = &self.document_title {
            source_parts.push(format!("\"{title}\""));
        }
        if let Some(headings) = &self.headings {
            source_parts.extend(headings.iter().cloned());
        }
        if !source_parts.is_empty() {
            out.push_str(&format!("\nSource: {}", source_parts.join(" > ")));
        }
        if let Some(label) = self.primary_label() {
            out.push_str(&format!("\nType: {label}"));
        }
        out.push_str(&format!("\nContent:\n{}", self.content));
        out
    }
}

const PRIORITY_LABELS: &[&str] = &["table", "code", "list_item", "formula", "caption"];
const TEXT_LABELS: &[&str] = &["paragraph", "text", "title", "section_header"];

/// See [`SearchResult::primary_label`]. `None` for an empty label list.
pub fn primary_label(labels: &[String]) -> Option<&str> {
    if labels.is_empty() {
        return None;
    }
    for candidate in PRIORITY_LABELS {
        if labels.iter().any(|l| l == candidate) {
            return Some(candidate);
        }
    }
    if let Some(l) = labels.iter().find(|l| TEXT_LABELS.contains(&l.as_str())) {
        return Some(l);
    }
    if labels.iter().any(|l| l == "picture") {
        return Some("picture");
    }
    labels.first().map(String::as_str)
}

/// A stable, session-scoped reference to a retrieved chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based; never changes for a chunk within a session.
    pub index: usize,
    pub chunk_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
    #[serde(default)]
    pub page_numbers: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headings: Option<Vec<String>>,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_label_prioritizes_structural_types() {
        let labels = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(
            primary_label(&labels(&["paragraph", "table", "text"])),
            Some("table")
        );
        assert_eq!(primary_label(&labels(&["list_item", "code"])), Some("code"));
        assert_eq!(primary_label(&labels(&["text", "list_item"])), Some("list_item"));
        // Text labels fall through to the first textual one
        assert_eq!(primary_label(&labels(&["paragraph", "text"])), Some("paragraph"));
        assert_eq!(primary_label(&labels(&["page_header", "picture"])), Some("picture"));
        assert_eq!(primary_label(&[]), None);
    }

    #[test]
    fn content_fts_prefixes_headings() {
        let mut chunk = Chunk::new("This is the raw chunk content.");
        chunk.metadata.headings = Some(vec!["Chapter 1".into(), "Section 1.1".into()]);
        assert_eq!(
            chunk.content_fts(),
            "Chapter 1\nSection 1.1\nThis is the raw chunk content."
        );

        let plain = Chunk::new("Plain content without headings.");
        assert_eq!(plain.content_fts(), "Plain content without headings.");
    }

    #[test]
    fn format_for_agent_with_rank_hides_score() {
        let result = SearchResult {
            content: "Body text.".into(),
            score: 0.02,
            chunk_id: "chunk-123".into(),
            document_id: Some("doc-456".into()),
            document_uri: None,
            document_title: Some("Annual Report".into()),
            doc_item_refs: vec![],
            page_numbers: vec![1, 2],
            headings: Some(vec!["Chapter 1".into()]),
            labels: vec!["paragraph".into(), "table".into()],
            bounding_boxes: None,
        };
        let formatted = result.format_for_agent(Some(1), Some(5));
        assert!(formatted.contains("[chunk-123] [rank 1 of 5]"));
        assert!(!formatted.contains("score:"));
        assert!(formatted.contains("Source: \"Annual Report\" > Chapter 1"));
        assert!(formatted.contains("Type: table"));
        assert!(formatted.contains("Content:\nBody text."));
    }
}
