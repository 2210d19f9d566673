//! Versioned store: four LanceDB tables (documents, chunks, settings,
//! mm_assets) in one directory, each with native version history, plus a
//! derived Tantivy keyword index. Multi-table writes snapshot the affected
//! table versions first and roll all of them back on failure.

pub mod schema;
pub mod text_index;
pub mod upgrades;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use arrow_array::Array;
use futures::TryStreamExt;
use lancedb::index::Index;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::table::OptimizeAction;
use lancedb::DistanceType;
use serde::{Deserialize, Serialize};

use crate::chunker::ChunkerConfig;
use crate::config::{DistanceMetric, RagConfig};
use crate::error::{Error, Result};

pub use schema::{AssetRecord, ChunkRecord, DocumentRecord, TableKind};
pub use text_index::{TextHit, TextIndex};

/// Library version recorded in the settings row and checked on open.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum chunk count before an ANN index is worth building.
pub const MIN_ROWS_FOR_ANN_INDEX: usize = 256;

/// Singleton settings row (id = 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub embedding_model: String,
    pub embedding_vector_dim: usize,
    pub multimodal_vector_dim: usize,
    pub chunker: ChunkerConfig,
    pub engine_version: String,
}

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Create the store directory and tables when absent.
    pub create: bool,
    /// Fail fast on every mutating call; takes no locks.
    pub read_only: bool,
    /// Skip the embedding model/dim check against stored settings.
    pub skip_validation: bool,
    /// Skip the migration gate (used by the migrate command itself).
    pub skip_migration_check: bool,
}

/// Versions of a set of tables captured before a multi-table write.
#[derive(Debug, Clone)]
pub struct Snapshot {
    entries: Vec<(TableKind, u64)>,
}

#[derive(Debug, Clone)]
pub struct TableVersion {
    pub version: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct Store {
    db: lancedb::Connection,
    path: PathBuf,
    read_only: bool,
    vector_dim: usize,
    image_dim: usize,
    metric: DistanceMetric,
    text_index: TextIndex,
    vacuum_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    settings: parking_lot::Mutex<StoreSettings>,
}

impl Store {
    pub async fn open(path: &Path, config: &RagConfig, options: OpenOptions) -> Result<Self> {
        config
            .validate()
            .map_err(Error::ConfigValidation)?;

        if !path.exists() {
            if !options.create {
                return Err(Error::NotFound(format!(
                    "no database at {}",
                    path.display()
                )));
            }
            std::fs::create_dir_all(path).map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let db = lancedb::connect(&path.to_string_lossy())
            .execute()
            .await?;

        let store = Self {
            db,
            path: path.to_path_buf(),
            read_only: options.read_only,
            vector_dim: config.embeddings.vector_dim,
            image_dim: config.multimodal.vector_dim,
            metric: config.search.vector_index_metric,
            text_index: TextIndex::open(path)?,
            vacuum_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            settings: parking_lot::Mutex::new(StoreSettings {
                embedding_model: config.embeddings.model.clone(),
                embedding_vector_dim: config.embeddings.vector_dim,
                multimodal_vector_dim: config.multimodal.vector_dim,
                chunker: config.processing.chunker.clone(),
                engine_version: ENGINE_VERSION.to_string(),
            }),
        };

        store.ensure_tables().await?;
        store.load_and_check_settings(config, &options).await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn vector_dim(&self) -> usize {
        self.vector_dim
    }

    pub fn image_dim(&self) -> usize {
        self.image_dim
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    async fn ensure_tables(&self) -> Result<()> {
        let existing = self.db.table_names().execute().await?;
        for kind in TableKind::ALL {
            if existing.iter().any(|n| n == kind.name()) {
                continue;
            }
            if self.read_only {
                return Err(Error::Storage(format!(
                    "table {} missing from read-only store",
                    kind.name()
                )));
            }
            let schema = match kind {
                TableKind::Documents => schema::documents_schema(),
                TableKind::Chunks => schema::chunks_schema(self.vector_dim),
                TableKind::Settings => schema::settings_schema(),
                TableKind::MmAssets => schema::mm_assets_schema(self.image_dim),
            };
            self.db
                .create_empty_table(kind.name(), schema)
                .execute()
                .await?;
            tracing::debug!(table = kind.name(), "created table");
        }
        Ok(())
    }

    pub(crate) async fn table(&self, kind: TableKind) -> Result<lancedb::Table> {
        self.db
            .open_table(kind.name())
            .execute()
            .await
            .map_err(Into::into)
    }

    async fn load_and_check_settings(
        &self,
        config: &RagConfig,
        options: &OpenOptions,
    ) -> Result<()> {
        let stored = self.read_settings_row().await?;

        let Some(stored) = stored else {
            // Fresh database: record current settings, run nothing.
            if !self.read_only {
                let json = serde_json::to_string(&*self.settings.lock())?;
                let table = self.table(TableKind::Settings).await?;
                table.add(schema::settings_batch(&json)?).execute().await?;
            }
            return Ok(());
        };

        if !options.skip_validation {
            if stored.embedding_vector_dim != config.embeddings.vector_dim {
                return Err(Error::ConfigValidation(format!(
                    "store was embedded at dim {}, config says {}",
                    stored.embedding_vector_dim, config.embeddings.vector_dim
                )));
            }
            if stored.embedding_model != config.embeddings.model {
                return Err(Error::ConfigValidation(format!(
                    "store was embedded with model '{}', config says '{}'",
                    stored.embedding_model, config.embeddings.model
                )));
            }
        }

        *self.settings.lock() = stored.clone();

        if options.skip_migration_check {
            return Ok(());
        }

        let stored_version = upgrades::Version::parse(&stored.engine_version)?;
        let current_version = upgrades::Version::parse(ENGINE_VERSION)?;
        if stored_version >= current_version {
            return Ok(());
        }
        let pending = upgrades::pending_upgrades(stored_version, current_version);
        if !pending.is_empty() {
            return Err(Error::MigrationRequired(format!(
                "stored version {} precedes {} pending upgrade step(s)",
                stored.engine_version,
                pending.len()
            )));
        }
        // Pure version bump: write through when we can, else leave stale.
        if !self.read_only {
            self.set_engine_version(ENGINE_VERSION).await?;
        }
        Ok(())
    }

    async fn read_settings_row(&self) -> Result<Option<StoreSettings>> {
        let table = self.table(TableKind::Settings).await?;
        let stream = table
            .query()
            .only_if("id = 1")
            .limit(1)
            .execute()
            .await?;
        let batches: Vec<_> = stream.try_collect().await.map_err(lancedb::Error::from)?;
        match schema::settings_from_batches(&batches) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn settings(&self) -> StoreSettings {
        self.settings.lock().clone()
    }

    pub async fn save_settings(&self, settings: &StoreSettings) -> Result<()> {
        self.ensure_writable()?;
        let json = serde_json::to_string(settings)?;
        let table = self.table(TableKind::Settings).await?;
        table.delete("id = 1").await?;
        table.add(schema::settings_batch(&json)?).execute().await?;
        *self.settings.lock() = settings.clone();
        Ok(())
    }

    pub fn engine_version(&self) -> String {
        self.settings.lock().engine_version.clone()
    }

    pub async fn set_engine_version(&self, version: &str) -> Result<()> {
        let mut settings = self.settings();
        settings.engine_version = version.to_string();
        self.save_settings(&settings).await
    }

    // ── Version history ────────────────────────────────────────────────

    pub async fn current_version(&self, kind: TableKind) -> Result<u64> {
        let table = self.table(kind).await?;
        Ok(table.version().await?)
    }

    pub async fn list_versions(&self, kind: TableKind) -> Result<Vec<TableVersion>> {
        let table = self.table(kind).await?;
        let versions = table.list_versions().await?;
        Ok(versions
            .into_iter()
            .map(|v| TableVersion {
                version: v.version,
                timestamp: v.timestamp,
            })
            .collect())
    }

    /// Roll a table back so the given version becomes the latest again.
    pub async fn restore_version(&self, kind: TableKind, version: u64) -> Result<()> {
        self.ensure_writable()?;
        self.restore_unguarded(kind, version).await
    }

    /// Restore without the read-only guard. Used by [`rollback`](Self::rollback):
    /// a failed mutation on a read-only store never advanced any version,
    /// so the equality check makes this a no-op there.
    async fn restore_unguarded(&self, kind: TableKind, version: u64) -> Result<()> {
        let table = self.table(kind).await?;
        if table.version().await? != version {
            table.checkout(version).await?;
            table.restore().await?;
        }
        if kind == TableKind::Chunks {
            self.text_index.mark_stale();
        }
        Ok(())
    }

    pub async fn snapshot(&self, tables: &[TableKind]) -> Result<Snapshot> {
        let mut entries = Vec::with_capacity(tables.len());
        for &kind in tables {
            entries.push((kind, self.current_version(kind).await?));
        }
        Ok(Snapshot { entries })
    }

    /// Restore every table recorded in the snapshot. Called on the failure
    /// path of multi-table writes.
    pub async fn rollback(&self, snapshot: &Snapshot) -> Result<()> {
        for &(kind, version) in &snapshot.entries {
            self.restore_unguarded(kind, version).await?;
        }
        tracing::warn!(tables = snapshot.entries.len(), "rolled back to snapshot");
        Ok(())
    }

    pub async fn optimize(&self, kind: TableKind) -> Result<()> {
        self.ensure_writable()?;
        let table = self.table(kind).await?;
        table.optimize(OptimizeAction::All).await?;
        Ok(())
    }

    /// Prune version history older than `retention_seconds`, then compact.
    /// Retention 0 is the only way to fully collapse history. Serialized
    /// against other vacuums and awaited by close.
    pub async fn vacuum(&self, retention_seconds: u64) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.vacuum_lock.lock().await;
        for kind in TableKind::ALL {
            let table = self.table(kind).await?;
            table.optimize(OptimizeAction::All).await?;
            table
                .optimize(OptimizeAction::Prune {
                    older_than: Some(chrono::Duration::seconds(retention_seconds as i64)),
                    delete_unverified: Some(true),
                    error_if_tagged_old_versions: None,
                })
                .await?;
        }
        self.text_index.mark_stale();
        tracing::info!(retention_seconds, "vacuum finished");
        Ok(())
    }

    /// Wait for in-flight vacuum work, then mark the store closed.
    /// Idempotent; the connection itself is dropped with the store.
    pub async fn close(&self) {
        let _guard = self.vacuum_lock.lock().await;
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Documents ──────────────────────────────────────────────────────

    pub async fn append_documents(&self, records: &[DocumentRecord]) -> Result<()> {
        self.ensure_writable()?;
        if records.is_empty() {
            return Ok(());
        }
        let table = self.table(TableKind::Documents).await?;
        table.add(schema::documents_batch(records)?).execute().await?;
        Ok(())
    }

    pub async fn query_documents(
        &self,
        predicate: Option<&str>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<DocumentRecord>> {
        let table = self.table(TableKind::Documents).await?;
        let mut query = table.query();
        if let Some(pred) = predicate {
            query = query.only_if(pred.to_string());
        }
        if let Some(offset) = offset {
            query = query.offset(offset);
        }
        query = query.limit(limit.unwrap_or(u32::MAX as usize));
        let batches: Vec<_> = query
            .execute()
            .await?
            .try_collect()
            .await
            .map_err(lancedb::Error::from)?;
        Ok(schema::documents_from_batches(&batches))
    }

    /// Update document columns by id. Values are SQL expressions; string
    /// values must already be quoted via [`schema::sql_quote`].
    pub async fn update_document_columns(
        &self,
        document_id: &str,
        columns: &[(&str, String)],
    ) -> Result<()> {
        self.ensure_writable()?;
        let table = self.table(TableKind::Documents).await?;
        let mut update = table
            .update()
            .only_if(format!("id = {}", schema::sql_quote(document_id)));
        for (name, expr) in columns {
            update = update.column(*name, expr.clone());
        }
        update.execute().await?;
        Ok(())
    }

    pub async fn delete_documents(&self, predicate: &str) -> Result<()> {
        self.ensure_writable()?;
        let table = self.table(TableKind::Documents).await?;
        table.delete(predicate).await?;
        Ok(())
    }

    pub async fn count_documents(&self) -> Result<usize> {
        let table = self.table(TableKind::Documents).await?;
        Ok(table.count_rows(None).await?)
    }

    // ── Chunks ─────────────────────────────────────────────────────────

    pub async fn append_chunks(&self, records: &[ChunkRecord]) -> Result<()> {
        self.ensure_writable()?;
        if records.is_empty() {
            return Ok(());
        }
        let table = self.table(TableKind::Chunks).await?;
        table
            .add(schema::chunks_batch(records, self.vector_dim)?)
            .execute()
            .await?;
        self.text_index.mark_stale();
        Ok(())
    }

    /// Upsert chunk rows by id (used by embed-only rebuilds).
    pub async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<()> {
        self.ensure_writable()?;
        if records.is_empty() {
            return Ok(());
        }
        let table = self.table(TableKind::Chunks).await?;
        let mut builder = table.merge_insert(&["id"]);
        builder.when_matched_update_all(None);
        builder.when_not_matched_insert_all();
        builder
            .execute(schema::chunks_batch(records, self.vector_dim)?)
            .await?;
        self.text_index.mark_stale();
        Ok(())
    }

    pub async fn query_chunks(
        &self,
        predicate: Option<&str>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<ChunkRecord>> {
        let table = self.table(TableKind::Chunks).await?;
        let mut query = table.query();
        if let Some(pred) = predicate {
            query = query.only_if(pred.to_string());
        }
        if let Some(offset) = offset {
            query = query.offset(offset);
        }
        query = query.limit(limit.unwrap_or(u32::MAX as usize));
        let batches: Vec<_> = query
            .execute()
            .await?
            .try_collect()
            .await
            .map_err(lancedb::Error::from)?;
        Ok(schema::chunks_from_batches(&batches)
            .into_iter()
            .map(|(record, _)| record)
            .collect())
    }

    pub async fn count_chunks(&self, predicate: Option<&str>) -> Result<usize> {
        let table = self.table(TableKind::Chunks).await?;
        Ok(table.count_rows(predicate.map(String::from)).await?)
    }

    pub async fn delete_chunks(&self, predicate: &str) -> Result<()> {
        self.ensure_writable()?;
        let table = self.table(TableKind::Chunks).await?;
        table.delete(predicate).await?;
        self.text_index.mark_stale();
        Ok(())
    }

    fn distance_type(&self) -> DistanceType {
        match self.metric {
            DistanceMetric::Cosine => DistanceType::Cosine,
            DistanceMetric::L2 => DistanceType::L2,
            DistanceMetric::Dot => DistanceType::Dot,
        }
    }

    /// ANN over chunk embeddings; returns `(record, distance)` pairs.
    pub async fn vector_search_chunks(
        &self,
        vector: &[f32],
        k: usize,
        predicate: Option<&str>,
    ) -> Result<Vec<(ChunkRecord, f32)>> {
        if vector.len() != self.vector_dim {
            return Err(Error::InvalidInput(format!(
                "query vector dim {} does not match store dim {}",
                vector.len(),
                self.vector_dim
            )));
        }
        let table = self.table(TableKind::Chunks).await?;
        let mut query = table
            .query()
            .nearest_to(vector)?
            .distance_type(self.distance_type())
            .limit(k.max(1));
        if let Some(pred) = predicate {
            query = query.only_if(pred.to_string());
        }
        let batches: Vec<_> = query
            .execute()
            .await?
            .try_collect()
            .await
            .map_err(lancedb::Error::from)?;
        Ok(schema::chunks_from_batches(&batches)
            .into_iter()
            .map(|(record, distance)| (record, distance.unwrap_or(f32::MAX)))
            .collect())
    }

    /// Build the ANN index over chunk embeddings. Requires at least
    /// [`MIN_ROWS_FOR_ANN_INDEX`] rows; below that it is a warning no-op
    /// (flat search stays exact and fast at that size).
    pub async fn create_vector_index(&self) -> Result<bool> {
        self.ensure_writable()?;
        let rows = self.count_chunks(None).await?;
        if rows < MIN_ROWS_FOR_ANN_INDEX {
            tracing::warn!(
                rows,
                required = MIN_ROWS_FOR_ANN_INDEX,
                "not enough chunks for an ANN index; skipping"
            );
            return Ok(false);
        }
        let table = self.table(TableKind::Chunks).await?;
        table
            .create_index(&["vector"], Index::Auto)
            .execute()
            .await?;
        tracing::info!(rows, "created ANN index on chunk embeddings");
        Ok(true)
    }

    // ── Full-text index ────────────────────────────────────────────────

    pub fn text_index(&self) -> &TextIndex {
        &self.text_index
    }

    /// Rebuild the keyword index from the chunks table when stale. Every
    /// FTS or hybrid search goes through here first.
    pub async fn ensure_fts_index(&self) -> Result<()> {
        if !self.text_index.is_stale() {
            return Ok(());
        }
        let chunks = self.query_chunks(None, None, None).await?;
        let rows: Vec<(String, String, String)> = chunks
            .into_iter()
            .map(|c| (c.id, c.document_id, c.content_fts))
            .collect();
        self.text_index.rebuild(&rows)
    }

    // ── Multimodal assets ──────────────────────────────────────────────

    pub async fn append_assets(&self, records: &[AssetRecord]) -> Result<()> {
        self.ensure_writable()?;
        if records.is_empty() {
            return Ok(());
        }
        let table = self.table(TableKind::MmAssets).await?;
        table
            .add(schema::mm_assets_batch(records, self.image_dim)?)
            .execute()
            .await?;
        Ok(())
    }

    pub async fn delete_assets(&self, predicate: &str) -> Result<()> {
        self.ensure_writable()?;
        let table = self.table(TableKind::MmAssets).await?;
        table.delete(predicate).await?;
        Ok(())
    }

    pub async fn vector_search_assets(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(AssetRecord, f32)>> {
        let table = self.table(TableKind::MmAssets).await?;
        let query = table
            .query()
            .nearest_to(vector)?
            .distance_type(self.distance_type())
            .limit(k.max(1));
        let batches: Vec<_> = query
            .execute()
            .await?
            .try_collect()
            .await
            .map_err(lancedb::Error::from)?;
        Ok(schema::assets_from_batches(&batches)
            .into_iter()
            .map(|(record, distance)| (record, distance.unwrap_or(f32::MAX)))
            .collect())
    }

    // ── Migration ──────────────────────────────────────────────────────

    /// Run pending upgrade steps in ascending target order, each under a
    /// snapshot of its declared tables. Returns the applied descriptions.
    pub async fn migrate(&self) -> Result<Vec<String>> {
        self.ensure_writable()?;
        let stored = upgrades::Version::parse(&self.engine_version())?;
        let current = upgrades::Version::parse(ENGINE_VERSION)?;
        let pending = upgrades::pending_upgrades(stored, current);

        let mut applied = Vec::new();
        for upgrade in pending {
            let snapshot = self.snapshot(upgrade.tables).await?;
            match (upgrade.apply)(self).await {
                Ok(()) => {
                    tracing::info!(
                        version = %upgrade.version,
                        description = upgrade.description,
                        "applied upgrade"
                    );
                    applied.push(upgrade.description.to_string());
                }
                Err(err) => {
                    if let Err(rollback_err) = self.rollback(&snapshot).await {
                        tracing::error!(%rollback_err, "rollback after failed upgrade also failed");
                    }
                    return Err(Error::Storage(format!(
                        "upgrade to {} failed: {err}",
                        upgrade.version
                    )));
                }
            }
        }
        if self.engine_version() != ENGINE_VERSION {
            self.set_engine_version(ENGINE_VERSION).await?;
        }
        Ok(applied)
    }

    /// Dump distinct document ids (used by filter resolution).
    pub async fn document_ids(&self, predicate: Option<&str>) -> Result<Vec<String>> {
        let table = self.table(TableKind::Documents).await?;
        let mut query = table.query().select(Select::columns(&["id"]));
        if let Some(pred) = predicate {
            query = query.only_if(pred.to_string());
        }
        query = query.limit(u32::MAX as usize);
        let batches: Vec<_> = query
            .execute()
            .await?
            .try_collect()
            .await
            .map_err(lancedb::Error::from)?;
        let mut ids = Vec::new();
        for batch in &batches {
            if let Some(col) = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<arrow_array::StringArray>())
            {
                for i in 0..col.len() {
                    ids.push(col.value(i).to_string());
                }
            }
        }
        Ok(ids)
    }
}
