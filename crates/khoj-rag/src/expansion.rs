//! Context expansion: rebuild coherent passages around sparse chunk hits.
//!
//! Two strategies. When the parent document kept its structured form and a
//! hit carries item refs, expansion walks the document structure; hits whose
//! primary label is a structural type (table, code, list item) swallow the
//! whole contiguous run of that label instead of a fixed radius. Otherwise
//! expansion falls back to chunk order. Overlapping or adjacent windows
//! merge into one result either way.

use std::collections::HashMap;

use crate::document::StructuredDocument;
use crate::types::{BoundingBox, Chunk, SearchResult};

/// Labels that expand to their full contiguous run, ignoring the radius.
const RUN_LABELS: &[&str] = &["table", "code", "list_item"];

#[derive(Debug, Clone, Copy)]
pub struct ExpansionCaps {
    /// Upper bound on items per merged window; excess truncates from the tail.
    pub max_items: usize,
    /// Upper bound on assembled content length, in characters.
    pub max_chars: usize,
}

impl Default for ExpansionCaps {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_chars: 10_000,
        }
    }
}

/// Merge overlapping or adjacent `[start, end]` windows; `cur.end >=
/// next.start - 1` merges. Each merged window keeps its contributing
/// results in encounter order.
fn merge_ranges(
    mut ranges: Vec<(usize, usize, SearchResult)>,
) -> Vec<(usize, usize, Vec<SearchResult>)> {
    if ranges.is_empty() {
        return Vec::new();
    }
    ranges.sort_by_key(|(start, _, _)| *start);

    let mut merged: Vec<(usize, usize, Vec<SearchResult>)> = Vec::new();
    let mut iter = ranges.into_iter();
    let (mut cur_start, mut cur_end, first) = iter.next().unwrap();
    let mut cur_results = vec![first];

    for (start, end, result) in iter {
        if cur_end + 1 >= start {
            cur_end = cur_end.max(end);
            cur_results.push(result);
        } else {
            merged.push((cur_start, cur_end, std::mem::take(&mut cur_results)));
            cur_start = start;
            cur_end = end;
            cur_results.push(result);
        }
    }
    merged.push((cur_start, cur_end, cur_results));
    merged
}

/// Headings across the source results, first-seen order preserved.
fn merge_headings(results: &[SearchResult]) -> Option<Vec<String>> {
    let mut headings: Vec<String> = Vec::new();
    for result in results {
        if let Some(hs) = &result.headings {
            for h in hs {
                if !headings.contains(h) {
                    headings.push(h.clone());
                }
            }
        }
    }
    if headings.is_empty() {
        None
    } else {
        Some(headings)
    }
}

fn best_score(results: &[SearchResult]) -> f32 {
    results.iter().map(|r| r.score).fold(f32::MIN, f32::max)
}

/// Structural expansion over the document's item order.
pub fn expand_structural(
    results: Vec<SearchResult>,
    doc: &StructuredDocument,
    radius: usize,
    caps: ExpansionCaps,
) -> Vec<SearchResult> {
    let items: Vec<_> = doc.iter_items().map(|(item, _)| item).collect();
    if items.is_empty() {
        return results;
    }
    let ref_to_index: HashMap<&str, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.self_ref.as_str(), i))
        .collect();

    let mut ranges: Vec<(usize, usize, SearchResult)> = Vec::new();
    let mut passthrough: Vec<SearchResult> = Vec::new();

    for result in results {
        let indices: Vec<usize> = result
            .doc_item_refs
            .iter()
            .filter_map(|r| ref_to_index.get(r.as_str()).copied())
            .collect();
        // A hit referencing zero resolvable items degrades to pass-through.
        let (Some(&min_idx), Some(&max_idx)) = (indices.iter().min(), indices.iter().max())
        else {
            passthrough.push(result);
            continue;
        };

        let run_label = result
            .primary_label()
            .filter(|l| RUN_LABELS.contains(l))
            .map(str::to_string);

        let (start, end) = match run_label {
            Some(label) => {
                // Swallow the whole contiguous run of this label: the full
                // table, the whole list, the entire block of adjacent code.
                let mut start = min_idx;
                while start > 0 && items[start - 1].label.as_str() == label {
                    start -= 1;
                }
                let mut end = max_idx;
                while end + 1 < items.len() && items[end + 1].label.as_str() == label {
                    end += 1;
                }
                (start, end)
            }
            None => (
                min_idx.saturating_sub(radius),
                (max_idx + radius).min(items.len() - 1),
            ),
        };
        ranges.push((start, end, result));
    }

    let mut expanded: Vec<SearchResult> = Vec::new();
    for (start, end, sources) in merge_ranges(ranges) {
        // max_items truncates from the tail.
        let end = end.min(start + caps.max_items - 1);

        let mut content_parts: Vec<(&str, bool)> = Vec::new();
        let mut refs: Vec<String> = Vec::new();
        let mut labels: Vec<String> = Vec::new();
        let mut pages: Vec<u32> = Vec::new();
        let mut bboxes: Vec<BoundingBox> = Vec::new();

        for item in &items[start..=end] {
            if let Some(text) = item.text.as_deref().filter(|t| !t.is_empty()) {
                content_parts.push((text, item.label.as_str() == "table"));
            }
            refs.push(item.self_ref.clone());
            let label = item.label.as_str().to_string();
            if !labels.contains(&label) {
                labels.push(label);
            }
            for prov in &item.prov {
                if !pages.contains(&prov.page_no) {
                    pages.push(prov.page_no);
                }
                bboxes.push(BoundingBox {
                    page_no: prov.page_no,
                    left: prov.bbox.left,
                    top: prov.bbox.top,
                    right: prov.bbox.right,
                    bottom: prov.bbox.bottom,
                });
            }
        }
        pages.sort_unstable();

        let content = assemble_content(&content_parts, caps.max_chars);
        let headings = merge_headings(&sources);
        let first = &sources[0];
        expanded.push(SearchResult {
            content,
            score: best_score(&sources),
            chunk_id: first.chunk_id.clone(),
            document_id: first.document_id.clone(),
            document_uri: first.document_uri.clone(),
            document_title: first.document_title.clone(),
            doc_item_refs: refs,
            page_numbers: pages,
            headings,
            labels,
            bounding_boxes: if bboxes.is_empty() { None } else { Some(bboxes) },
        });
    }

    expanded.extend(passthrough);
    expanded
}

/// Join item texts by blank lines, truncating to `max_chars` with a
/// trailing ellipsis. When the cut lands inside a table, back off to the
/// last complete row so no half row survives (best effort).
fn assemble_content(parts: &[(&str, bool)], max_chars: usize) -> String {
    let mut content = String::new();
    let mut truncated = false;
    for (i, (text, is_table)) in parts.iter().enumerate() {
        if i > 0 {
            content.push_str("\n\n");
        }
        let budget = max_chars.saturating_sub(content.chars().count());
        let len = text.chars().count();
        if len <= budget {
            content.push_str(text);
            continue;
        }
        let mut cut: String = text.chars().take(budget).collect();
        if *is_table {
            if let Some(pos) = cut.rfind('\n') {
                cut.truncate(pos);
            }
        }
        content.push_str(&cut);
        truncated = true;
        break;
    }
    if truncated {
        content.push('…');
    }
    content
}

/// Chunk-order expansion for documents without a usable structured form.
/// The hit's chunk is located by id, falling back to exact content match;
/// unlocatable hits pass through unchanged.
pub fn expand_chunk_order(
    results: Vec<SearchResult>,
    chunks: &[Chunk],
    radius: usize,
) -> Vec<SearchResult> {
    if chunks.is_empty() {
        return results;
    }
    let by_id: HashMap<&str, &Chunk> = chunks.iter().map(|c| (c.id.as_str(), c)).collect();
    let by_content: HashMap<&str, &Chunk> =
        chunks.iter().map(|c| (c.content.as_str(), c)).collect();
    let by_order: HashMap<u32, &Chunk> = chunks.iter().map(|c| (c.order, c)).collect();
    let min_order = chunks.iter().map(|c| c.order).min().unwrap_or(0);
    let max_order = chunks.iter().map(|c| c.order).max().unwrap_or(0);

    let mut ranges: Vec<(usize, usize, SearchResult)> = Vec::new();
    let mut passthrough: Vec<SearchResult> = Vec::new();

    for result in results {
        let chunk = by_id
            .get(result.chunk_id.as_str())
            .or_else(|| by_content.get(result.content.as_str()));
        let Some(chunk) = chunk else {
            passthrough.push(result);
            continue;
        };
        let start = chunk.order.saturating_sub(radius as u32).max(min_order);
        let end = (chunk.order + radius as u32).min(max_order);
        ranges.push((start as usize, end as usize, result));
    }

    let mut expanded: Vec<SearchResult> = Vec::new();
    for (start, end, sources) in merge_ranges(ranges) {
        // Chunks already carry their own whitespace; no separator.
        let content: String = (start..=end)
            .filter_map(|order| by_order.get(&(order as u32)))
            .map(|c| c.content.as_str())
            .collect();
        let first = &sources[0];
        expanded.push(SearchResult {
            content,
            score: best_score(&sources),
            chunk_id: first.chunk_id.clone(),
            document_id: first.document_id.clone(),
            document_uri: first.document_uri.clone(),
            document_title: first.document_title.clone(),
            doc_item_refs: first.doc_item_refs.clone(),
            page_numbers: first.page_numbers.clone(),
            headings: first.headings.clone(),
            labels: first.labels.clone(),
            bounding_boxes: first.bounding_boxes.clone(),
        });
    }

    expanded.extend(passthrough);
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ItemLabel;

    fn result(chunk_id: &str, score: f32) -> SearchResult {
        SearchResult {
            content: String::new(),
            score,
            chunk_id: chunk_id.to_string(),
            document_id: Some("doc".into()),
            document_uri: None,
            document_title: None,
            doc_item_refs: vec![],
            page_numbers: vec![],
            headings: None,
            labels: vec![],
            bounding_boxes: None,
        }
    }

    fn chunk(id: &str, content: &str, order: u32) -> Chunk {
        let mut c = Chunk::new(content);
        c.id = id.to_string();
        c.document_id = Some("doc".into());
        c.order = order;
        c
    }

    #[test]
    fn merge_ranges_merges_overlap_and_adjacency() {
        let merged = merge_ranges(vec![
            (0, 2, result("a", 0.8)),
            (1, 3, result("b", 0.7)),
            (4, 5, result("c", 0.6)),
            (8, 9, result("d", 0.5)),
        ]);
        // [0,2]+[1,3] overlap; [4,5] is adjacent to the merged [0,3].
        assert_eq!(merged.len(), 2);
        assert_eq!((merged[0].0, merged[0].1), (0, 5));
        assert_eq!(merged[0].2.len(), 3);
        assert_eq!((merged[1].0, merged[1].1), (8, 9));
    }

    #[test]
    fn chunk_order_expansion_merges_and_takes_max_score() {
        let chunks: Vec<Chunk> = (0..5)
            .map(|i| chunk(&format!("c{i}"), &format!("Chunk {i}"), i))
            .collect();
        let r1 = result("c1", 0.8);
        let r2 = result("c2", 0.7);
        let expanded = expand_chunk_order(vec![r1, r2], &chunks, 1);

        assert_eq!(expanded.len(), 1);
        let merged = &expanded[0];
        for i in 0..4 {
            assert!(merged.content.contains(&format!("Chunk {i}")));
        }
        assert!(!merged.content.contains("Chunk 4"));
        assert_eq!(merged.score, 0.8);
        assert_eq!(merged.chunk_id, "c1");
    }

    #[test]
    fn chunk_order_expansion_keeps_disjoint_windows_apart() {
        let orders = [0u32, 1, 2, 3, 4, 5];
        let chunks: Vec<Chunk> = orders
            .iter()
            .map(|&i| chunk(&format!("c{i}"), &format!("Chunk {i}"), i))
            .collect();
        let expanded = expand_chunk_order(vec![result("c0", 0.8), result("c5", 0.7)], &chunks, 1);
        assert_eq!(expanded.len(), 2);
        assert!(expanded[0].content.contains("Chunk 0"));
        assert!(expanded[0].content.contains("Chunk 1"));
        assert!(!expanded[0].content.contains("Chunk 4"));
        assert!(expanded[1].content.contains("Chunk 4"));
        assert!(expanded[1].content.contains("Chunk 5"));
    }

    #[test]
    fn chunk_order_falls_back_to_content_match() {
        let chunks = vec![
            chunk("c0", "Alpha", 0),
            chunk("c1", "Beta", 1),
            chunk("c2", "Gamma", 2),
        ];
        let mut r = result("unknown-id", 0.9);
        r.content = "Beta".into();
        let expanded = expand_chunk_order(vec![r], &chunks, 1);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].content, "AlphaBetaGamma");
    }

    #[test]
    fn unlocatable_results_pass_through() {
        let chunks = vec![chunk("c0", "Alpha", 0)];
        let mut r = result("missing", 0.9);
        r.content = "not in document".into();
        let expanded = expand_chunk_order(vec![r.clone()], &chunks, 2);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].content, r.content);
        assert_eq!(expanded[0].score, r.score);
    }

    fn table_doc() -> StructuredDocument {
        let mut doc = StructuredDocument::new("table");
        doc.add_text(ItemLabel::Paragraph, "Intro.");
        doc.add_heading("Data", 1);
        doc.add_table(&[
            vec!["Name".into(), "City".into()],
            vec!["Alice".into(), "New York".into()],
            vec!["Bob".into(), "Los Angeles".into()],
            vec!["Charlie".into(), "Chicago".into()],
            vec!["Diana".into(), "Miami".into()],
        ]);
        doc.add_text(ItemLabel::Paragraph, "Outro.");
        doc
    }

    #[test]
    fn structural_table_hit_swallows_whole_table_regardless_of_radius() {
        let doc = table_doc();
        let mut r = result("c-table", 0.9);
        r.doc_item_refs = vec!["#/tables/0".into()];
        r.labels = vec!["table".into()];
        // Radius 0 would keep only the table item; the run rule brings the
        // whole table anyway because the table is a single item.
        let expanded = expand_structural(vec![r], &doc, 0, ExpansionCaps::default());
        assert_eq!(expanded.len(), 1);
        for name in ["Alice", "Bob", "Charlie", "Diana"] {
            assert!(expanded[0].content.contains(name), "missing {name}");
        }
        assert!(expanded[0].labels.contains(&"table".to_string()));
    }

    fn code_doc() -> StructuredDocument {
        let mut doc = StructuredDocument::new("code");
        doc.add_text(ItemLabel::Paragraph, "Here are several code snippets:");
        doc.add_code("# Part 1: Setup\nimport os");
        doc.add_code("# Part 2: Config\nCONFIG = {\"debug\": true}");
        doc.add_code("# Part 3: Main\nfn main() {}");
        doc.add_text(ItemLabel::Paragraph, "End of code examples.");
        doc
    }

    #[test]
    fn structural_code_hit_expands_over_adjacent_code_run() {
        let doc = code_doc();
        let mut r = result("c-code", 0.9);
        r.doc_item_refs = vec!["#/texts/2".into()]; // middle code block
        r.labels = vec!["code".into()];
        let expanded = expand_structural(vec![r], &doc, 0, ExpansionCaps::default());
        assert_eq!(expanded.len(), 1);
        for part in ["Part 1", "Part 2", "Part 3"] {
            assert!(expanded[0].content.contains(part), "missing {part}");
        }
        // The run stops at non-code neighbors.
        assert!(!expanded[0].content.contains("several code snippets"));
    }

    #[test]
    fn non_structural_hit_uses_radius() {
        let mut doc = StructuredDocument::new("prose");
        for i in 0..5 {
            doc.add_text(ItemLabel::Paragraph, format!("Paragraph {i}."));
        }
        let mut r = result("c-p", 0.9);
        r.doc_item_refs = vec!["#/texts/2".into()];
        r.labels = vec!["paragraph".into()];
        let expanded = expand_structural(vec![r], &doc, 1, ExpansionCaps::default());
        assert_eq!(expanded.len(), 1);
        let content = &expanded[0].content;
        assert!(content.contains("Paragraph 1."));
        assert!(content.contains("Paragraph 2."));
        assert!(content.contains("Paragraph 3."));
        assert!(!content.contains("Paragraph 0."));
        assert!(!content.contains("Paragraph 4."));
    }

    #[test]
    fn zero_valid_refs_degrades_to_pass_through() {
        let doc = table_doc();
        let mut r = result("c-x", 0.4);
        r.doc_item_refs = vec!["#/texts/999".into()];
        r.content = "original content".into();
        let expanded = expand_structural(vec![r], &doc, 2, ExpansionCaps::default());
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].content, "original content");
    }

    #[test]
    fn max_items_caps_window_from_tail() {
        let mut doc = StructuredDocument::new("long");
        for i in 0..20 {
            doc.add_text(ItemLabel::Paragraph, format!("P{i}."));
        }
        let mut r = result("c", 0.9);
        r.doc_item_refs = vec!["#/texts/0".into()];
        r.labels = vec!["paragraph".into()];
        let caps = ExpansionCaps {
            max_items: 3,
            max_chars: 10_000,
        };
        let expanded = expand_structural(vec![r], &doc, 10, caps);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].doc_item_refs.len(), 3);
        assert!(expanded[0].content.contains("P2."));
        assert!(!expanded[0].content.contains("P3."));
    }

    #[test]
    fn max_chars_truncates_with_ellipsis() {
        let mut doc = StructuredDocument::new("long");
        doc.add_text(ItemLabel::Paragraph, "A".repeat(100));
        doc.add_text(ItemLabel::Paragraph, "B".repeat(100));
        let mut r = result("c", 0.9);
        r.doc_item_refs = vec!["#/texts/0".into()];
        r.labels = vec!["paragraph".into()];
        let caps = ExpansionCaps {
            max_items: 10,
            max_chars: 120,
        };
        let expanded = expand_structural(vec![r], &doc, 1, caps);
        assert!(expanded[0].content.chars().count() <= 121);
        assert!(expanded[0].content.ends_with('…'));
    }

    #[test]
    fn merged_window_unions_metadata() {
        let mut doc = StructuredDocument::new("meta");
        for i in 0..4 {
            doc.add_text(ItemLabel::Paragraph, format!("P{i}."));
            doc.set_last_prov(
                (i + 1) as u32,
                crate::document::BBox {
                    left: 0.0,
                    top: 10.0,
                    right: 5.0,
                    bottom: 0.0,
                },
            );
        }
        let mut r1 = result("c1", 0.8);
        r1.doc_item_refs = vec!["#/texts/1".into()];
        r1.labels = vec!["paragraph".into()];
        r1.headings = Some(vec!["Intro".into()]);
        let mut r2 = result("c2", 0.7);
        r2.doc_item_refs = vec!["#/texts/2".into()];
        r2.labels = vec!["paragraph".into()];
        r2.headings = Some(vec!["Intro".into(), "Methods".into()]);

        let expanded = expand_structural(vec![r1, r2], &doc, 1, ExpansionCaps::default());
        assert_eq!(expanded.len(), 1);
        let merged = &expanded[0];
        assert_eq!(merged.score, 0.8);
        assert_eq!(merged.chunk_id, "c1");
        assert_eq!(merged.page_numbers, vec![1, 2, 3, 4]);
        assert_eq!(
            merged.headings.as_deref(),
            Some(&["Intro".to_string(), "Methods".to_string()][..])
        );
        assert_eq!(merged.bounding_boxes.as_ref().unwrap().len(), 4);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Overlap always merges: output count <= input count, and any
            /// pair with c <= b+1 collapses.
            #[test]
            fn merge_never_grows(windows in proptest::collection::vec((0usize..50, 0usize..10), 1..20)) {
                let ranges: Vec<(usize, usize, SearchResult)> = windows
                    .iter()
                    .enumerate()
                    .map(|(i, &(start, span))| (start, start + span, result(&format!("c{i}"), 0.5)))
                    .collect();
                let count = ranges.len();
                let merged = merge_ranges(ranges);
                prop_assert!(merged.len() <= count);
                // Merged windows are disjoint and non-adjacent.
                for pair in merged.windows(2) {
                    prop_assert!(pair[0].1 + 1 < pair[1].0);
                }
                // Every source result survives exactly once.
                let total: usize = merged.iter().map(|(_, _, rs)| rs.len()).sum();
                prop_assert_eq!(total, count);
            }

            /// max_items bounds the refs of every expanded window.
            #[test]
            fn max_items_is_an_upper_bound(
                hits in proptest::collection::vec(0usize..15, 1..5),
                radius in 0usize..6,
                max_items in 1usize..8,
            ) {
                let mut doc = StructuredDocument::new("prop");
                for i in 0..15 {
                    doc.add_text(ItemLabel::Paragraph, format!("P{i}."));
                }
                let results: Vec<SearchResult> = hits
                    .iter()
                    .enumerate()
                    .map(|(i, &idx)| {
                        let mut r = result(&format!("c{i}"), 0.5);
                        r.doc_item_refs = vec![format!("#/texts/{idx}")];
                        r.labels = vec!["paragraph".into()];
                        r
                    })
                    .collect();
                let caps = ExpansionCaps { max_items, max_chars: 100_000 };
                let expanded = expand_structural(results, &doc, radius, caps);
                for window in &expanded {
                    prop_assert!(window.doc_item_refs.len() <= max_items);
                }
            }
        }
    }
}
