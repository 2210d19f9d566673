//! Structure-aware chunking of a [`StructuredDocument`] under a token
//! budget. Section headers delimit chunks and become heading context;
//! tables and code blocks stay atomic when they fit and split into parts
//! carrying the same label and ref when they do not.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::{DocItem, ItemLabel, StructuredDocument};
use crate::error::Result;
use crate::tokens::{HeuristicCounter, TokenCounter};
use crate::types::{Chunk, ChunkMetadata};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkerConfig {
    /// Token budget per chunk.
    pub max_tokens: usize,
    /// Concatenate adjacent small items of the same label into one chunk.
    pub merge_peers: bool,
    /// Serialize tables as markdown; otherwise as `Header = cell` triplets.
    pub use_markdown_tables: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            merge_peers: true,
            use_markdown_tables: false,
        }
    }
}

pub struct Chunker {
    config: ChunkerConfig,
    counter: Arc<dyn TokenCounter>,
}

/// One source item staged into the current chunk.
struct StagedItem<'a> {
    item: &'a DocItem,
    text: String,
}

impl Chunker {
    pub fn new(config: ChunkerConfig, counter: Arc<dyn TokenCounter>) -> Self {
        Self { config, counter }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkerConfig::default(), Arc::new(HeuristicCounter))
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Produce the ordered chunk list for a document. Empty documents yield
    /// zero chunks; a malformed document (duplicate or dangling refs) is an
    /// error.
    pub fn chunk(&self, doc: &StructuredDocument) -> Result<Vec<Chunk>> {
        doc.validate()?;

        let mut chunks: Vec<Chunk> = Vec::new();
        // (level, text); title sits at level 0.
        let mut heading_stack: Vec<(u8, String)> = Vec::new();
        let mut staged: Vec<StagedItem<'_>> = Vec::new();
        let mut staged_tokens = 0usize;

        macro_rules! flush {
            () => {
                if !staged.is_empty() {
                    let chunk = self.emit(&staged, &heading_stack);
                    chunks.push(chunk);
                    staged.clear();
                    staged_tokens = 0;
                }
            };
        }

        for (item, _depth) in doc.iter_items() {
            match item.label {
                ItemLabel::Title => {
                    flush!();
                    heading_stack.clear();
                    if let Some(text) = &item.text {
                        heading_stack.push((0, text.clone()));
                    }
                }
                ItemLabel::SectionHeader => {
                    flush!();
                    let level = item.level.unwrap_or(1);
                    heading_stack.retain(|(l, _)| *l < level);
                    if let Some(text) = &item.text {
                        heading_stack.push((level, text.clone()));
                    }
                }
                ItemLabel::PageHeader | ItemLabel::PageFooter => {
                    // Furniture never contributes content.
                }
                ItemLabel::Table => {
                    flush!();
                    let rendered = self.serialize_table(item);
                    chunks.extend(self.emit_structural(item, rendered, &heading_stack));
                }
                ItemLabel::Code => {
                    flush!();
                    let text = item.text.clone().unwrap_or_default();
                    chunks.extend(self.emit_structural(item, text, &heading_stack));
                }
                _ => {
                    let Some(text) = item.text.as_deref().filter(|t| !t.trim().is_empty()) else {
                        continue; // e.g. picture without caption
                    };
                    let tokens = self.counter.count(text);

                    if tokens > self.config.max_tokens {
                        flush!();
                        for part in split_by_budget(text, self.config.max_tokens, &*self.counter) {
                            chunks.push(self.emit(
                                &[StagedItem { item, text: part }],
                                &heading_stack,
                            ));
                        }
                        continue;
                    }

                    let same_peer = staged
                        .last()
                        .map(|s| s.item.label == item.label)
                        .unwrap_or(true);
                    let fits = staged_tokens + tokens <= self.config.max_tokens;
                    if !self.config.merge_peers || !same_peer || !fits {
                        flush!();
                    }
                    staged_tokens += tokens;
                    staged.push(StagedItem {
                        item,
                        text: text.to_string(),
                    });
                    if !self.config.merge_peers {
                        flush!();
                    }
                }
            }
        }
        flush!();

        for (order, chunk) in chunks.iter_mut().enumerate() {
            chunk.order = order as u32;
        }
        Ok(chunks)
    }

    fn emit(&self, staged: &[StagedItem<'_>], heading_stack: &[(u8, String)]) -> Chunk {
        let content = staged
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut refs: Vec<String> = Vec::new();
        let mut labels: Vec<String> = Vec::new();
        let mut pages: Vec<u32> = Vec::new();
        for s in staged {
            if !refs.contains(&s.item.self_ref) {
                refs.push(s.item.self_ref.clone());
                labels.push(s.item.label.as_str().to_string());
            }
            for prov in &s.item.prov {
                if !pages.contains(&prov.page_no) {
                    pages.push(prov.page_no);
                }
            }
        }
        pages.sort_unstable();

        let headings: Vec<String> = heading_stack.iter().map(|(_, t)| t.clone()).collect();
        Chunk::new(content).with_metadata(ChunkMetadata {
            doc_item_refs: refs,
            headings: if headings.is_empty() { None } else { Some(headings) },
            labels,
            page_numbers: pages,
        })
    }

    /// Emit a table or code item: one chunk when it fits the budget, else
    /// consecutive parts all bearing the item's label and ref.
    fn emit_structural(
        &self,
        item: &DocItem,
        text: String,
        heading_stack: &[(u8, String)],
    ) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let parts = if self.counter.count(&text) <= self.config.max_tokens {
            vec![text]
        } else if item.label == ItemLabel::Table {
            split_table_rows(&text, self.config.max_tokens, &*self.counter)
        } else {
            split_by_lines(&text, self.config.max_tokens, &*self.counter)
        };
        parts
            .into_iter()
            .map(|part| self.emit(&[StagedItem { item, text: part }], heading_stack))
            .collect()
    }

    fn serialize_table(&self, item: &DocItem) -> String {
        let markdown = item.text.clone().unwrap_or_default();
        if self.config.use_markdown_tables {
            return markdown;
        }
        triplet_serialize_table(&markdown)
    }
}

/// Rewrite a markdown table as `Header = cell` rows, which embeds better
/// than pipe syntax for most models.
fn triplet_serialize_table(markdown: &str) -> String {
    let rows: Vec<Vec<String>> = markdown
        .lines()
        .filter(|l| !is_separator_row(l))
        .map(parse_table_row)
        .filter(|r| !r.is_empty())
        .collect();
    if rows.len() < 2 {
        return markdown.to_string();
    }
    let headers = &rows[0];
    rows[1..]
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, cell)| match headers.get(i) {
                    Some(h) if !h.is_empty() => format!("{h} = {cell}"),
                    _ => cell.clone(),
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' '))
        && trimmed.contains('-')
}

fn parse_table_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_start_matches('|')
        .trim_end_matches('|')
        .split('|')
        .map(|c| c.trim().to_string())
        .collect()
}

/// Split a markdown table row-wise under the budget, repeating the header
/// block in every part so each part stands alone.
fn split_table_rows(text: &str, budget: usize, counter: &dyn TokenCounter) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let header_count = if lines.len() > 2 && is_separator_row(lines[1]) {
        2
    } else {
        0
    };
    let (header, body) = lines.split_at(header_count);
    let header_block = header.join("\n");

    let mut parts = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for row in body {
        let mut candidate = if header_block.is_empty() {
            current.clone()
        } else {
            let mut v = vec![header_block.as_str()];
            v.extend(current.iter().copied());
            v
        };
        candidate.push(row);
        if !current.is_empty() && counter.count(&candidate.join("\n")) > budget {
            let mut part = Vec::new();
            if !header_block.is_empty() {
                part.push(header_block.as_str());
            }
            part.extend(current.iter().copied());
            parts.push(part.join("\n"));
            current = vec![row];
        } else {
            current.push(row);
        }
    }
    if !current.is_empty() {
        let mut part = Vec::new();
        if !header_block.is_empty() {
            part.push(header_block.as_str());
        }
        part.extend(current.iter().copied());
        parts.push(part.join("\n"));
    }
    parts
}

fn split_by_lines(text: &str, budget: usize, counter: &dyn TokenCounter) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        let candidate = if current.is_empty() {
            line.to_string()
        } else {
            format!("{}\n{}", current.join("\n"), line)
        };
        if !current.is_empty() && counter.count(&candidate) > budget {
            parts.push(current.join("\n"));
            current = vec![line];
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        parts.push(current.join("\n"));
    }
    if parts.is_empty() {
        parts.push(text.to_string());
    }
    parts
}

/// Word-greedy split of prose under the budget; sentences survive where
/// they fit, single oversize words are hard-cut.
fn split_by_budget(text: &str, budget: usize, counter: &dyn TokenCounter) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return vec![text.to_string()];
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    for word in words {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{current} {word}")
        };
        if !current.is_empty() && counter.count(&candidate) > budget {
            parts.push(std::mem::take(&mut current));
            current = word.to_string();
        } else {
            current = candidate;
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::StructuredDocument;

    fn chunker(max_tokens: usize) -> Chunker {
        Chunker::new(
            ChunkerConfig {
                max_tokens,
                merge_peers: true,
                use_markdown_tables: true,
            },
            Arc::new(HeuristicCounter),
        )
    }

    fn table_doc() -> StructuredDocument {
        let mut doc = StructuredDocument::new("table_test");
        doc.add_text(ItemLabel::Paragraph, "Introduction paragraph.");
        doc.add_heading("Employee Data", 1);
        doc.add_table(&[
            vec!["Name".into(), "Age".into(), "City".into()],
            vec!["Alice Smith".into(), "30".into(), "New York".into()],
            vec!["Bob Johnson".into(), "25".into(), "Los Angeles".into()],
            vec!["Charlie Brown".into(), "35".into(), "Chicago".into()],
            vec!["Diana Ross".into(), "28".into(), "Miami".into()],
        ]);
        doc.add_text(ItemLabel::Paragraph, "Conclusion paragraph.");
        doc
    }

    #[test]
    fn empty_document_produces_no_chunks() {
        let doc = StructuredDocument::new("empty");
        assert!(chunker(256).chunk(&doc).unwrap().is_empty());
    }

    #[test]
    fn orders_are_dense_from_zero() {
        let chunks = chunker(32).chunk(&table_doc()).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.order, i as u32);
        }
    }

    #[test]
    fn small_table_stays_atomic() {
        let chunks = chunker(256).chunk(&table_doc()).unwrap();
        let table_chunks: Vec<_> = chunks
            .iter()
            .filter(|c| c.metadata.labels.contains(&"table".to_string()))
            .collect();
        assert_eq!(table_chunks.len(), 1);
        assert!(table_chunks[0].content.contains("Alice Smith"));
        assert!(table_chunks[0].content.contains("Diana Ross"));
    }

    #[test]
    fn oversized_table_splits_into_parts_sharing_label_and_ref() {
        let chunks = chunker(32).chunk(&table_doc()).unwrap();
        let table_chunks: Vec<_> = chunks
            .iter()
            .filter(|c| c.metadata.labels.contains(&"table".to_string()))
            .collect();
        assert!(table_chunks.len() > 1, "expected a split at 32 tokens");
        for c in &table_chunks {
            assert_eq!(c.metadata.doc_item_refs, vec!["#/tables/0".to_string()]);
            assert_eq!(c.metadata.labels, vec!["table".to_string()]);
            // Header repeated in every part
            assert!(c.content.lines().next().unwrap().contains("Name"));
        }
    }

    #[test]
    fn headings_carry_section_context() {
        let chunks = chunker(256).chunk(&table_doc()).unwrap();
        let table_chunk = chunks
            .iter()
            .find(|c| c.metadata.labels.contains(&"table".to_string()))
            .unwrap();
        assert_eq!(
            table_chunk.metadata.headings.as_deref(),
            Some(&["Employee Data".to_string()][..])
        );
        // The intro precedes the heading, so it has no heading context.
        let intro = &chunks[0];
        assert!(intro.content.contains("Introduction"));
        assert!(intro.metadata.headings.is_none());
    }

    #[test]
    fn chunks_never_span_section_headers() {
        let mut doc = StructuredDocument::new("sections");
        doc.add_heading("One", 1);
        doc.add_text(ItemLabel::Paragraph, "Alpha.");
        doc.add_heading("Two", 1);
        doc.add_text(ItemLabel::Paragraph, "Beta.");
        let chunks = chunker(256).chunk(&doc).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.headings.as_deref(), Some(&["One".to_string()][..]));
        assert_eq!(chunks[1].metadata.headings.as_deref(), Some(&["Two".to_string()][..]));
    }

    #[test]
    fn merge_peers_concatenates_small_same_label_items() {
        let mut doc = StructuredDocument::new("list");
        doc.add_list_item("apples");
        doc.add_list_item("bananas");
        doc.add_list_item("oranges");
        let merged = chunker(256).chunk(&doc).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].metadata.doc_item_refs.len(), 3);

        let unmerged = Chunker::new(
            ChunkerConfig {
                max_tokens: 256,
                merge_peers: false,
                use_markdown_tables: true,
            },
            Arc::new(HeuristicCounter),
        )
        .chunk(&doc)
        .unwrap();
        assert_eq!(unmerged.len(), 3);
    }

    #[test]
    fn coverage_every_content_item_appears() {
        let doc = table_doc();
        let chunks = chunker(32).chunk(&doc).unwrap();
        let assembled: String = chunks.iter().map(|c| c.content.as_str()).collect::<Vec<_>>().join("\n");
        for (item, _) in doc.iter_items() {
            match item.label {
                ItemLabel::Title | ItemLabel::SectionHeader => {
                    // Headers surface as heading context instead of content.
                    let text = item.text.clone().unwrap();
                    assert!(chunks.iter().any(|c| c
                        .metadata
                        .headings
                        .as_ref()
                        .map(|h| h.contains(&text))
                        .unwrap_or(false)));
                }
                ItemLabel::Table => {
                    assert!(assembled.contains("Alice Smith"));
                    assert!(assembled.contains("Diana Ross"));
                }
                _ => {
                    if let Some(text) = &item.text {
                        assert!(assembled.contains(text.as_str()));
                    }
                }
            }
        }
    }

    #[test]
    fn triplet_serialization_pairs_headers_with_cells() {
        let mut doc = StructuredDocument::new("triplet");
        doc.add_table(&[
            vec!["Name".into(), "City".into()],
            vec!["Alice".into(), "New York".into()],
        ]);
        let chunks = Chunker::with_defaults().chunk(&doc).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Name = Alice, City = New York");
    }
}
