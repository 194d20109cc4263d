//! The mirror facade.
//!
//! [`Mirror`] wires every component to one SQLite pool and one
//! [`RemoteSource`], and exposes the caller-facing operations:
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | [`Mirror::get_records`] | Filtered, sorted, paged records (syncs when stale) |
//! | [`Mirror::invalidate`] | Force a scope stale |
//! | [`Mirror::refresh_now`] | Invalidate and resync synchronously |
//! | [`Mirror::get_freshness`] | Freshness of one scope |
//! | [`Mirror::get_performance_stats`] | Hit/miss counters per table |
//! | [`Mirror::list_tables`] | Remote table list, cached under `tables` |

use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::error::{CacheError, Result, SyncError};
use crate::filter::FilterExpression;
use crate::freshness::{Clock, FreshnessPolicy, FreshnessReport, Scope, SystemClock, TtlPolicy};
use crate::migrate;
use crate::models::{CacheTableBinding, TableSummary};
use crate::query::{QueryResult, RecordQuery, SortKey};
use crate::schema::SchemaRegistry;
use crate::stats::{PerformanceCounter, TableStats};
use crate::sync::{SyncReport, Synchronizer};
use crate::traits::RemoteSource;

pub struct Mirror {
    pool: SqlitePool,
    source: Arc<dyn RemoteSource>,
    clock: Arc<dyn Clock>,
    freshness: Arc<FreshnessPolicy>,
    registry: Arc<SchemaRegistry>,
    counter: Arc<PerformanceCounter>,
    sync: Synchronizer,
}

impl Mirror {
    /// Open (and migrate) the configured database.
    pub async fn open(config: &Config, source: Arc<dyn RemoteSource>) -> Result<Self> {
        Self::with_clock(config, source, Arc::new(SystemClock)).await
    }

    /// Like [`Mirror::open`], with an explicit clock.
    pub async fn with_clock(
        config: &Config,
        source: Arc<dyn RemoteSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CacheError::Config(format!("{:#}", e)))?;

        let pool = db::connect(config).await.map_err(|e| {
            CacheError::Config(format!(
                "cannot open database {}: {:#}",
                config.db.path.display(),
                e
            ))
        })?;
        migrate::apply(&pool)
            .await
            .map_err(|e| CacheError::Config(format!("migration failed: {:#}", e)))?;

        let freshness = Arc::new(FreshnessPolicy::new(
            pool.clone(),
            TtlPolicy::from_config(&config.cache),
            clock.clone(),
        ));
        let registry = Arc::new(SchemaRegistry::new(pool.clone(), clock.clone()));
        let counter = Arc::new(PerformanceCounter::new(
            pool.clone(),
            &config.stats,
            clock.clone(),
        ));
        let sync = Synchronizer::new(
            pool.clone(),
            source.clone(),
            registry.clone(),
            freshness.clone(),
            counter.clone(),
            config.sync.page_size,
        );

        Ok(Self {
            pool,
            source,
            clock,
            freshness,
            registry,
            counter,
            sync,
        })
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

    pub fn counter(&self) -> Arc<PerformanceCounter> {
        self.counter.clone()
    }

    /// Start flushing counters on their configured interval.
    pub fn start_background_flush(&self) -> JoinHandle<()> {
        self.counter.clone().spawn_periodic_flush()
    }

    /// A query builder with no table selected yet.
    pub fn query(&self) -> RecordQuery<'_> {
        RecordQuery::new(&self.sync)
    }

    pub fn records(&self, source_table_id: &str) -> RecordQuery<'_> {
        self.query().table(source_table_id)
    }

    pub async fn get_records(
        &self,
        source_table_id: &str,
        filter: Option<FilterExpression>,
        sort: Vec<SortKey>,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<QueryResult> {
        let mut query = self.records(source_table_id).sort(sort).offset(offset);
        if let Some(filter) = filter {
            query = query.filter(filter);
        }
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        query.execute().await
    }

    pub async fn sync_table(&self, source_table_id: &str) -> Result<SyncReport> {
        self.sync.sync_table(source_table_id).await
    }

    pub async fn try_sync_table(&self, source_table_id: &str) -> Result<SyncReport> {
        self.sync.try_sync_table(source_table_id).await
    }

    /// Force a scope stale. Returns how many freshness entries changed.
    pub async fn invalidate(&self, scope: &str, target: Option<&str>) -> Result<u64> {
        let scope = Scope::parse(scope, target)?;
        self.freshness.invalidate(&scope).await
    }

    /// Invalidate a scope and resync it before returning.
    ///
    /// `records`/`table` scopes resync that table. `tables` refreshes the
    /// table list and resyncs every bound table.
    pub async fn refresh_now(&self, scope: &str, target: Option<&str>) -> Result<Vec<SyncReport>> {
        let scope = Scope::parse(scope, target)?;
        self.freshness.invalidate(&scope).await?;

        match scope {
            Scope::Tables => {
                self.refresh_table_list().await?;
                let mut reports = Vec::new();
                for binding in self.registry.list_bindings().await? {
                    reports.push(self.sync.sync_table(&binding.source_table_id).await?);
                }
                Ok(reports)
            }
            Scope::TableSchema(id) | Scope::Records(id) => {
                Ok(vec![self.sync.sync_table(&id).await?])
            }
        }
    }

    pub async fn get_freshness(&self, scope: &str, target: Option<&str>) -> Result<FreshnessReport> {
        let scope = Scope::parse(scope, target)?;
        self.freshness.state(&scope).await
    }

    /// Flush pending counters, then read persisted stats.
    pub async fn get_performance_stats(
        &self,
        source_table_id: Option<&str>,
    ) -> Result<Vec<TableStats>> {
        self.counter.flush().await?;
        self.counter.load(source_table_id).await
    }

    pub async fn bindings(&self) -> Result<Vec<CacheTableBinding>> {
        self.registry.list_bindings().await
    }

    /// The remote table list, served from `cache_source_tables` while the
    /// `tables` scope is fresh.
    pub async fn list_tables(&self) -> Result<Vec<TableSummary>> {
        if self.freshness.is_fresh(&Scope::Tables).await? {
            return self.cached_table_list().await;
        }
        self.refresh_table_list().await
    }

    async fn cached_table_list(&self) -> Result<Vec<TableSummary>> {
        let rows = sqlx::query(
            "SELECT source_table_id, display_name FROM cache_source_tables ORDER BY display_name, source_table_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TableSummary {
                source_table_id: row.get("source_table_id"),
                display_name: row.get("display_name"),
            })
            .collect())
    }

    async fn refresh_table_list(&self) -> Result<Vec<TableSummary>> {
        let mut tables = self
            .source
            .list_tables()
            .await
            .map_err(|e| SyncError::Listing {
                message: format!("{:#}", e),
            })?;
        tables.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.source_table_id.cmp(&b.source_table_id))
        });

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache_source_tables")
            .execute(&mut *tx)
            .await?;
        for table in &tables {
            sqlx::query(
                "INSERT OR REPLACE INTO cache_source_tables (source_table_id, display_name, listed_at) VALUES (?, ?, ?)",
            )
            .bind(&table.source_table_id)
            .bind(&table.display_name)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.freshness.mark_synced(&Scope::Tables).await?;
        info!(tables = tables.len(), "refreshed table list");
        Ok(tables)
    }

    /// Flush counters and close the pool.
    pub async fn close(self) -> Result<()> {
        self.counter.flush().await?;
        self.pool.close().await;
        Ok(())
    }
}
