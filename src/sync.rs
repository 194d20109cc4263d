//! Full-table record synchronization.
//!
//! A sync of one source table runs under that table's lock:
//!
//! ```text
//! lock(table) ─▶ ensure structure ─▶ fetch every page ─▶ one write tx ─▶ mark fresh
//! ```
//!
//! Pages are collected in memory before anything is written, so a failure
//! on page N leaves the previous snapshot and its freshness exactly as they
//! were. The write transaction clears the table and inserts every fetched
//! record, so after a sync the table holds exactly what the remote returned.
//! A record deleted remotely stays cached until the next full sync.

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::freshness::{FreshnessPolicy, Scope};
use crate::models::{CacheTableBinding, RemoteRecord};
use crate::schema::{quote_ident, SchemaRegistry};
use crate::stats::PerformanceCounter;
use crate::traits::RemoteSource;
use crate::types::{bind_value, encode_value};

/// Outcome of one successful table sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source_table_id: String,
    pub local_table_name: String,
    pub records: usize,
    pub pages: usize,
    /// Serialized size of the synced field payloads, in bytes.
    pub size_estimate: i64,
    /// Whether the descriptor was fetched (structure was stale or unbound).
    pub schema_refreshed: bool,
    pub synced_at: i64,
    pub expires_at: i64,
}

pub struct Synchronizer {
    pool: SqlitePool,
    source: Arc<dyn RemoteSource>,
    registry: Arc<SchemaRegistry>,
    freshness: Arc<FreshnessPolicy>,
    counter: Arc<PerformanceCounter>,
    page_size: usize,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Synchronizer {
    pub fn new(
        pool: SqlitePool,
        source: Arc<dyn RemoteSource>,
        registry: Arc<SchemaRegistry>,
        freshness: Arc<FreshnessPolicy>,
        counter: Arc<PerformanceCounter>,
        page_size: usize,
    ) -> Self {
        Self {
            pool,
            source,
            registry,
            freshness,
            counter,
            page_size: page_size.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn freshness(&self) -> &FreshnessPolicy {
        &self.freshness
    }

    pub fn counter(&self) -> &PerformanceCounter {
        &self.counter
    }

    fn lock_for(&self, source_table_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(source_table_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Sync a table, waiting for any sync of the same table to finish first.
    pub async fn sync_table(&self, source_table_id: &str) -> Result<SyncReport> {
        let lock = self.lock_for(source_table_id);
        let _guard = lock.lock().await;
        self.sync_locked(source_table_id).await
    }

    /// Sync a table unless another caller is already syncing it.
    pub async fn try_sync_table(&self, source_table_id: &str) -> Result<SyncReport> {
        let lock = self.lock_for(source_table_id);
        let _guard = lock.try_lock().map_err(|_| SyncError::Refreshing {
            source_table_id: source_table_id.to_string(),
        })?;
        self.sync_locked(source_table_id).await
    }

    /// Make sure `records:{id}` is fresh, syncing if it is not.
    ///
    /// Returns `true` when the records were already fresh (a cache hit).
    /// Callers that find the table stale wait on the table lock and check
    /// again, so concurrent cold reads trigger a single sync.
    pub async fn ensure_fresh(&self, source_table_id: &str) -> Result<bool> {
        let scope = Scope::Records(source_table_id.to_string());
        if self.freshness.is_fresh(&scope).await? {
            return Ok(true);
        }

        let lock = self.lock_for(source_table_id);
        let _guard = lock.lock().await;
        if self.freshness.is_fresh(&scope).await? {
            debug!(table = source_table_id, "synced by a concurrent caller");
            return Ok(false);
        }
        self.sync_locked(source_table_id).await?;
        Ok(false)
    }

    async fn sync_locked(&self, source_table_id: &str) -> Result<SyncReport> {
        let started = Instant::now();
        info!(table = source_table_id, "sync started");

        let (binding, schema_refreshed) = self.ensure_structure(source_table_id).await?;
        let (records, pages) = self.fetch_all(source_table_id).await?;
        let (written, size_estimate) = self.write_records(&binding, &records).await?;

        let expires_at = self
            .freshness
            .mark_synced(&Scope::Records(source_table_id.to_string()))
            .await?;
        let synced_at = self.freshness.now();
        self.registry.touch_synced(source_table_id, synced_at).await?;
        self.counter
            .record_sync(source_table_id, written as i64, size_estimate);

        info!(
            table = source_table_id,
            records = written,
            pages,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync finished"
        );

        Ok(SyncReport {
            source_table_id: source_table_id.to_string(),
            local_table_name: binding.local_table_name,
            records: written,
            pages,
            size_estimate,
            schema_refreshed,
            synced_at,
            expires_at,
        })
    }

    /// Reuse the binding while `table:{id}` is fresh, otherwise refetch the
    /// descriptor and let the registry evolve the local table.
    async fn ensure_structure(&self, source_table_id: &str) -> Result<(CacheTableBinding, bool)> {
        let scope = Scope::TableSchema(source_table_id.to_string());
        if self.freshness.is_fresh(&scope).await? {
            if let Some(binding) = self.registry.binding(source_table_id).await? {
                return Ok((binding, false));
            }
        }

        let mut descriptor = self
            .source
            .fetch_table_descriptor(source_table_id)
            .await
            .map_err(|e| SyncError::Descriptor {
                source_table_id: source_table_id.to_string(),
                message: format!("{:#}", e),
            })?;

        if descriptor.source_table_id != source_table_id {
            warn!(
                requested = source_table_id,
                returned = %descriptor.source_table_id,
                "descriptor id mismatch; using requested id"
            );
            descriptor.source_table_id = source_table_id.to_string();
        }

        let binding = self.registry.ensure_table(&descriptor).await?;
        self.freshness.mark_synced(&scope).await?;
        Ok((binding, true))
    }

    async fn fetch_all(&self, source_table_id: &str) -> Result<(Vec<RemoteRecord>, usize)> {
        let mut records: Vec<RemoteRecord> = Vec::new();
        let mut pages = 0usize;

        loop {
            let page = self
                .source
                .fetch_page(source_table_id, records.len(), self.page_size)
                .await
                .map_err(|e| SyncError::Fetch {
                    source_table_id: source_table_id.to_string(),
                    pages_completed: pages,
                    records_fetched: records.len(),
                    message: format!("{:#}", e),
                })?;

            pages += 1;
            let received = page.records.len();
            records.extend(page.records);
            debug!(
                table = source_table_id,
                page = pages,
                received,
                total = records.len(),
                "fetched page"
            );

            if !page.has_more {
                break;
            }
            if received == 0 {
                warn!(
                    table = source_table_id,
                    "source reported more records but sent an empty page; stopping"
                );
                break;
            }
        }

        Ok((records, pages))
    }

    /// Replace the table's rows with `records` in one transaction. Returns
    /// the number of rows written and the payload size.
    async fn write_records(
        &self,
        binding: &CacheTableBinding,
        records: &[RemoteRecord],
    ) -> Result<(usize, i64)> {
        let mut columns = vec![
            "id".to_string(),
            "remote_created_at".to_string(),
            "remote_updated_at".to_string(),
            "cached_at".to_string(),
        ];
        columns.extend(binding.columns.iter().map(|c| quote_ident(&c.column)));

        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_ident(&binding.local_table_name),
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        let now = self.freshness.now();
        let mut size_estimate = 0i64;
        let mut written = 0usize;
        let mut skipped = 0usize;
        let mut tx = self.pool.begin().await?;

        // Rows the remote stopped returning go with the old snapshot
        sqlx::query(&format!(
            "DELETE FROM {}",
            quote_ident(&binding.local_table_name)
        ))
        .execute(&mut *tx)
        .await?;

        for record in records {
            if record.id.trim().is_empty() {
                skipped += 1;
                continue;
            }
            size_estimate += serde_json::to_string(&record.fields)?.len() as i64;

            let mut query = sqlx::query(&sql)
                .bind(&record.id)
                .bind(record.created_at.map(|t| t.timestamp()))
                .bind(record.updated_at.map(|t| t.timestamp()))
                .bind(now);
            for column in &binding.columns {
                let value = encode_value(&column.kind, record.fields.get(&column.slug));
                query = bind_value(query, &value);
            }
            query.execute(&mut *tx).await?;
            written += 1;
        }

        tx.commit().await?;

        if skipped > 0 {
            warn!(
                table = %binding.source_table_id,
                skipped,
                "records without an id were not cached"
            );
        }
        Ok((written, size_estimate))
    }
}

