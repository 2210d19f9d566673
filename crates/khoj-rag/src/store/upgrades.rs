//! Ordered registry of schema upgrade steps. On open, a store whose
//! recorded version precedes any step here refuses writes until
//! [`Store::migrate`](super::Store::migrate) runs them.

use std::fmt;

use futures::future::BoxFuture;

use crate::error::{Error, Result};
use crate::types::ChunkMetadata;

use super::schema::{self, TableKind};
use super::Store;

/// Minimal ordered semantic version (major, minor, patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u64, pub u64, pub u64);

impl Version {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |name: &str| -> Result<u64> {
            parts
                .next()
                .unwrap_or("0")
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .map_err(|_| Error::InvalidInput(format!("bad {name} in version '{s}'")))
        };
        Ok(Version(next("major")?, next("minor")?, next("patch")?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

pub struct Upgrade {
    /// Version this step upgrades the store to.
    pub version: Version,
    pub description: &'static str,
    /// Tables snapshotted around the step.
    pub tables: &'static [TableKind],
    pub apply: for<'a> fn(&'a Store) -> BoxFuture<'a, Result<()>>,
}

/// All known upgrade steps, ascending by target version.
pub fn registered_upgrades() -> Vec<Upgrade> {
    vec![
        Upgrade {
            version: Version(0, 20, 0),
            description: "backfill content_fts from chunk metadata headings",
            tables: &[TableKind::Chunks],
            apply: |store| Box::pin(backfill_content_fts(store)),
        },
        Upgrade {
            version: Version(0, 21, 0),
            description: "renumber chunk orders to be dense per document",
            tables: &[TableKind::Chunks],
            apply: |store| Box::pin(densify_chunk_orders(store)),
        },
    ]
}

/// Steps with `stored < target <= current`, ascending.
pub fn pending_upgrades(stored: Version, current: Version) -> Vec<Upgrade> {
    let mut pending: Vec<Upgrade> = registered_upgrades()
        .into_iter()
        .filter(|u| u.version > stored && u.version <= current)
        .collect();
    pending.sort_by_key(|u| u.version);
    pending
}

/// Chunks written before the contextualized-FTS column carried raw content
/// there; recompute it as headings + content.
async fn backfill_content_fts(store: &Store) -> Result<()> {
    let chunks = store.query_chunks(None, None, None).await?;
    let mut updated = Vec::new();
    for mut record in chunks {
        let metadata: ChunkMetadata = serde_json::from_str(&record.metadata).unwrap_or_default();
        let expected = crate::types::contextualize(metadata.headings.as_deref(), &record.content);
        if record.content_fts != expected {
            record.content_fts = expected;
            updated.push(record);
        }
    }
    if !updated.is_empty() {
        tracing::info!(rows = updated.len(), "backfilling content_fts");
        store.upsert_chunks(&updated).await?;
    }
    Ok(())
}

/// Older stores could leave gaps in per-document chunk orders after manual
/// imports. Context expansion assumes dense orders starting at 0.
async fn densify_chunk_orders(store: &Store) -> Result<()> {
    let chunks = store.query_chunks(None, None, None).await?;
    let mut by_document: std::collections::HashMap<String, Vec<schema::ChunkRecord>> =
        std::collections::HashMap::new();
    for record in chunks {
        by_document
            .entry(record.document_id.clone())
            .or_default()
            .push(record);
    }
    let mut updated = Vec::new();
    for (_, mut records) in by_document {
        records.sort_by_key(|r| r.order);
        for (expected, mut record) in records.into_iter().enumerate() {
            if record.order != expected as u32 {
                record.order = expected as u32;
                updated.push(record);
            }
        }
    }
    if !updated.is_empty() {
        tracing::info!(rows = updated.len(), "renumbering chunk orders");
        store.upsert_chunks(&updated).await?;
    }
    Ok(())
}
