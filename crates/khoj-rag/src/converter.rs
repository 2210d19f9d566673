//! Converter boundary: turn raw sources into [`StructuredDocument`]s.
//! Heavyweight backends (PDF layout analysis, OCR) live behind this trait;
//! the built-in converter covers markdown and plain text so the engine is
//! usable without external services.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;

use crate::document::{ItemLabel, StructuredDocument};
use crate::error::{Error, Result};

#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert_text(&self, content: &str, name: Option<&str>) -> Result<StructuredDocument>;

    async fn convert_file(&self, path: &Path) -> Result<StructuredDocument>;

    /// Lowercase extensions with leading dot (`.md`, `.txt`).
    fn supported_extensions(&self) -> &HashSet<String>;
}

/// Markdown/plain-text converter. Recognizes ATX headings, fenced code
/// blocks, pipe tables and list items; everything else becomes paragraphs
/// split on blank lines.
pub struct MarkdownConverter {
    extensions: HashSet<String>,
}

impl Default for MarkdownConverter {
    fn default() -> Self {
        let extensions = [".md", ".markdown", ".txt"]
            .into_iter()
            .map(String::from)
            .collect();
        Self { extensions }
    }
}

impl MarkdownConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(&self, content: &str, name: &str) -> StructuredDocument {
        let mut doc = StructuredDocument::new(name);
        let mut saw_title = false;
        let mut paragraph: Vec<&str> = Vec::new();
        let mut table: Vec<&str> = Vec::new();
        let mut code: Vec<&str> = Vec::new();
        let mut in_code = false;

        macro_rules! close_paragraph {
            () => {
                if !paragraph.is_empty() {
                    doc.add_text(ItemLabel::Paragraph, paragraph.join(" "));
                    paragraph.clear();
                }
            };
        }
        macro_rules! close_table {
            () => {
                if !table.is_empty() {
                    let rows = parse_pipe_table(&table);
                    if !rows.is_empty() {
                        doc.add_table(&rows);
                    }
                    table.clear();
                }
            };
        }

        for line in content.lines() {
            if in_code {
                if line.trim_start().starts_with("```") {
                    doc.add_code(code.join("\n"));
                    code.clear();
                    in_code = false;
                } else {
                    code.push(line);
                }
                continue;
            }

            let trimmed = line.trim();
            if trimmed.starts_with("```") {
                close_paragraph!();
                close_table!();
                in_code = true;
                continue;
            }
            if trimmed.is_empty() {
                close_paragraph!();
                close_table!();
                continue;
            }
            if let Some(heading) = parse_heading(trimmed) {
                close_paragraph!();
                close_table!();
                let (level, text) = heading;
                if level == 1 && !saw_title {
                    saw_title = true;
                    doc.add_title(text);
                } else {
                    doc.add_heading(text, level.saturating_sub(1).max(1));
                }
                continue;
            }
            if trimmed.starts_with('|') {
                close_paragraph!();
                table.push(trimmed);
                continue;
            }
            if let Some(item) = parse_list_item(trimmed) {
                close_paragraph!();
                close_table!();
                doc.add_list_item(item);
                continue;
            }
            close_table!();
            paragraph.push(trimmed);
        }

        if in_code && !code.is_empty() {
            doc.add_code(code.join("\n"));
        }
        close_paragraph!();
        close_table!();
        doc
    }
}

fn parse_heading(line: &str) -> Option<(u8, String)> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    Some((hashes as u8, rest.trim().to_string()))
}

fn parse_list_item(line: &str) -> Option<String> {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return Some(rest.trim().to_string());
    }
    static ORDERED: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let ordered = ORDERED.get_or_init(|| regex::Regex::new(r"^\d+\.\s+(.*)$").expect("valid regex"));
    ordered
        .captures(line)
        .map(|c| c[1].trim().to_string())
}

fn parse_pipe_table(lines: &[&str]) -> Vec<Vec<String>> {
    lines
        .iter()
        .filter(|l| {
            let t = l.trim();
            // Drop the |---|---| separator row
            !(t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' ')) && t.contains('-'))
        })
        .map(|l| {
            l.trim()
                .trim_start_matches('|')
                .trim_end_matches('|')
                .split('|')
                .map(|c| c.trim().to_string())
                .collect()
        })
        .collect()
}

#[async_trait]
impl Converter for MarkdownConverter {
    async fn convert_text(&self, content: &str, name: Option<&str>) -> Result<StructuredDocument> {
        Ok(self.parse(content, name.unwrap_or("document")))
    }

    async fn convert_file(&self, path: &Path) -> Result<StructuredDocument> {
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if !self.extensions.contains(&extension) {
            return Err(Error::InvalidInput(format!(
                "unsupported file extension: {extension}"
            )));
        }
        let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        self.convert_text(&content, Some(&name)).await
    }

    fn supported_extensions(&self) -> &HashSet<String> {
        &self.extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ItemLabel;

    #[tokio::test]
    async fn parses_headings_lists_tables_and_code() {
        let content = "# Guide\n\nIntro paragraph spanning\ntwo lines.\n\n## Fruit\n\n- apples\n- bananas\n\n| Name | Age |\n| --- | --- |\n| Alice | 30 |\n\n```\nfn main() {}\n```\n";
        let converter = MarkdownConverter::new();
        let doc = converter.convert_text(content, Some("guide")).await.unwrap();

        let labels: Vec<_> = doc.iter_items().map(|(i, _)| i.label).collect();
        assert_eq!(
            labels,
            vec![
                ItemLabel::Title,
                ItemLabel::Paragraph,
                ItemLabel::SectionHeader,
                ItemLabel::ListItem,
                ItemLabel::ListItem,
                ItemLabel::Table,
                ItemLabel::Code,
            ]
        );
        let para = doc.iter_items().nth(1).unwrap().0;
        assert_eq!(para.text.as_deref(), Some("Intro paragraph spanning two lines."));
        let table = doc.iter_items().nth(5).unwrap().0;
        assert!(table.text.as_deref().unwrap().contains("| Alice | 30 |"));
    }

    #[tokio::test]
    async fn rejects_unknown_extensions() {
        let converter = MarkdownConverter::new();
        let err = converter
            .convert_file(Path::new("slides.pptx"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
