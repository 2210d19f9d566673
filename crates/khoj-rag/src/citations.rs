//! Session-scoped citation numbering. A chunk keeps the same citation
//! index for the whole session no matter how many answers reference it,
//! so "[3]" always points at the same source.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Citation, SearchResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CitationRegistry {
    indices: HashMap<String, usize>,
}

impl CitationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the index already assigned to this chunk, or assign the next
    /// one (1-based). Assigned indices never change within a session.
    pub fn get_or_assign(&mut self, chunk_id: &str) -> usize {
        if let Some(&index) = self.indices.get(chunk_id) {
            return index;
        }
        let index = self.indices.len() + 1;
        self.indices.insert(chunk_id.to_string(), index);
        index
    }

    pub fn get(&self, chunk_id: &str) -> Option<usize> {
        self.indices.get(chunk_id).copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Build citations for a batch of results, assigning indices in result
    /// order for chunks not seen before.
    pub fn cite(&mut self, results: &[SearchResult]) -> Vec<Citation> {
        results
            .iter()
            .map(|r| Citation {
                index: self.get_or_assign(&r.chunk_id),
                chunk_id: r.chunk_id.clone(),
                document_id: r.document_id.clone(),
                document_uri: r.document_uri.clone(),
                document_title: r.document_title.clone(),
                page_numbers: r.page_numbers.clone(),
                headings: r.headings.clone(),
                content: r.content.clone(),
            })
            .collect()
    }
}
