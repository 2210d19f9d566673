//! Structured representation of a converted document: an ordered list of
//! items with self refs, labels and page provenance. Chunking and context
//! expansion both index into the order produced by [`StructuredDocument::iter_items`],
//! so that ordering is part of the serialization contract.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Schema version written into every serialized document.
pub const DOC_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemLabel {
    Title,
    SectionHeader,
    Paragraph,
    ListItem,
    Table,
    Code,
    Picture,
    Caption,
    Footnote,
    Formula,
    PageHeader,
    PageFooter,
}

impl ItemLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemLabel::Title => "title",
            ItemLabel::SectionHeader => "section_header",
            ItemLabel::Paragraph => "paragraph",
            ItemLabel::ListItem => "list_item",
            ItemLabel::Table => "table",
            ItemLabel::Code => "code",
            ItemLabel::Picture => "picture",
            ItemLabel::Caption => "caption",
            ItemLabel::Footnote => "footnote",
            ItemLabel::Formula => "formula",
            ItemLabel::PageHeader => "page_header",
            ItemLabel::PageFooter => "page_footer",
        }
    }
}

/// Rectangle in page coordinates, bottom-left origin (y grows upward).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// 1-based page number.
    pub page_no: u32,
    pub bbox: BBox,
}

/// A leaf of the structured document: one text block, table, picture, etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocItem {
    /// Path-like id, unique within the document (`#/texts/0`, `#/tables/0`).
    pub self_ref: String,
    pub label: ItemLabel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prov: Vec<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
    /// Heading level for section headers (1 = top level).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub width: f64,
    pub height: f64,
    /// Raster of the page, when the converter rendered one. Not serialized;
    /// multimodal indexing consumes it at ingestion time only.
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
}

/// Immutable tree of [`DocItem`]s in document order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredDocument {
    pub name: String,
    /// Schema version of the serialized form.
    pub version: String,
    items: Vec<DocItem>,
    #[serde(default)]
    pub pages: BTreeMap<u32, PageInfo>,
    #[serde(skip)]
    counters: HashMap<&'static str, usize>,
}

impl StructuredDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: DOC_SCHEMA_VERSION.to_string(),
            items: Vec::new(),
            pages: BTreeMap::new(),
            counters: HashMap::new(),
        }
    }

    fn next_ref(&mut self, label: ItemLabel) -> String {
        let bucket = match label {
            ItemLabel::Table => "tables",
            ItemLabel::Picture => "pictures",
            _ => "texts",
        };
        let n = self.counters.entry(bucket).or_insert(0);
        let self_ref = format!("#/{bucket}/{n}");
        *n += 1;
        self_ref
    }

    fn push(&mut self, label: ItemLabel, text: Option<String>, level: Option<u8>) -> &DocItem {
        let self_ref = self.next_ref(label);
        self.items.push(DocItem {
            self_ref,
            label,
            text,
            prov: Vec::new(),
            parent_ref: None,
            level,
        });
        self.items.last().unwrap()
    }

    pub fn add_title(&mut self, text: impl Into<String>) -> &DocItem {
        self.push(ItemLabel::Title, Some(text.into()), None)
    }

    pub fn add_heading(&mut self, text: impl Into<String>, level: u8) -> &DocItem {
        self.push(ItemLabel::SectionHeader, Some(text.into()), Some(level))
    }

    pub fn add_text(&mut self, label: ItemLabel, text: impl Into<String>) -> &DocItem {
        self.push(label, Some(text.into()), None)
    }

    pub fn add_list_item(&mut self, text: impl Into<String>) -> &DocItem {
        self.push(ItemLabel::ListItem, Some(text.into()), None)
    }

    pub fn add_code(&mut self, text: impl Into<String>) -> &DocItem {
        self.push(ItemLabel::Code, Some(text.into()), None)
    }

    /// Add a table from rows of cells; the first row is treated as the
    /// header when rendering markdown. Stored as one item whose text is the
    /// markdown serialization, so a table is always a single ref target.
    pub fn add_table(&mut self, rows: &[Vec<String>]) -> &DocItem {
        let text = render_markdown_table(rows);
        self.push(ItemLabel::Table, Some(text), None)
    }

    pub fn add_picture(&mut self, caption: Option<String>) -> &DocItem {
        self.push(ItemLabel::Picture, caption, None)
    }

    pub fn add_page(&mut self, page_no: u32, width: f64, height: f64) {
        self.pages.insert(
            page_no,
            PageInfo {
                width,
                height,
                image: None,
            },
        );
    }

    /// Attach provenance to the most recently added item.
    pub fn set_last_prov(&mut self, page_no: u32, bbox: BBox) {
        if let Some(item) = self.items.last_mut() {
            item.prov.push(Provenance { page_no, bbox });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// In-order traversal yielding `(item, depth)`. Depth is the number of
    /// `parent_ref` hops to a root item. This ordering is stable across
    /// serialization round-trips; expansion indexes into it exclusively.
    pub fn iter_items(&self) -> impl Iterator<Item = (&DocItem, usize)> {
        let depths: HashMap<&str, usize> = {
            let by_ref: HashMap<&str, &DocItem> = self
                .items
                .iter()
                .map(|i| (i.self_ref.as_str(), i))
                .collect();
            self.items
                .iter()
                .map(|item| {
                    let mut depth = 0;
                    let mut cur = item.parent_ref.as_deref();
                    while let Some(parent) = cur.and_then(|r| by_ref.get(r)) {
                        depth += 1;
                        cur = parent.parent_ref.as_deref();
                        if depth > self.items.len() {
                            break; // cyclic parent refs; treat as root
                        }
                    }
                    (item.self_ref.as_str(), depth)
                })
                .collect()
        };
        self.items
            .iter()
            .map(move |item| (item, *depths.get(item.self_ref.as_str()).unwrap_or(&0)))
    }

    pub fn get_by_ref(&self, self_ref: &str) -> Option<&DocItem> {
        self.items.iter().find(|i| i.self_ref == self_ref)
    }

    /// Check the structural invariants: self refs unique, parent refs
    /// resolvable within the document.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for item in &self.items {
            if !seen.insert(item.self_ref.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate self_ref {}",
                    item.self_ref
                )));
            }
        }
        for item in &self.items {
            if let Some(parent) = &item.parent_ref {
                if !seen.contains(parent.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "unresolvable parent_ref {} on {}",
                        parent, item.self_ref
                    )));
                }
            }
        }
        Ok(())
    }

    /// Markdown rendering of the whole document; this becomes the stored
    /// `content` column.
    pub fn export_to_markdown(&self) -> String {
        let mut blocks: Vec<String> = Vec::new();
        for (item, _) in self.iter_items() {
            let Some(text) = item.text.as_deref() else {
                continue;
            };
            let block = match item.label {
                ItemLabel::Title => format!("# {text}"),
                ItemLabel::SectionHeader => {
                    let level = usize::from(item.level.unwrap_or(1)).min(5);
                    format!("{} {text}", "#".repeat(level + 1))
                }
                ItemLabel::ListItem => format!("- {text}"),
                ItemLabel::Code => format!("```\n{text}\n```"),
                ItemLabel::PageHeader | ItemLabel::PageFooter => continue,
                _ => text.to_string(),
            };
            blocks.push(block);
        }
        blocks.join("\n\n")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("malformed structured doc JSON: {e}")))?;
        doc.validate()?;
        Ok(doc)
    }
}

fn render_markdown_table(rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    out.push_str(&format!("| {} |", rows[0].join(" | ")));
    out.push('\n');
    out.push_str(&format!(
        "| {} |",
        rows[0].iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
    ));
    for row in &rows[1..] {
        out.push('\n');
        out.push_str(&format!("| {} |", row.join(" | ")));
    }
    out
}
