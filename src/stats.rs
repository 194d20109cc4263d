//! Cache performance counters.
//!
//! Every lookup through the query executor counts as a hit (records were
//! already fresh) or a miss (a sync had to run first). Increments land in
//! memory under a mutex and are flushed to `cache_performance` in batches:
//! after `flush_every_ops` operations, after `flush_interval_secs`, or when
//! stats are read.
//!
//! Flushes are additive (`hits = hits + excluded.hits`), so two processes
//! sharing one database never overwrite each other's totals. A failed flush
//! puts its batch back into the pending counters.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StatsConfig;
use crate::error::Result;
use crate::freshness::Clock;

#[derive(Debug, Default, Clone)]
struct PendingCounts {
    hits: u64,
    misses: u64,
    last_access_at: Option<i64>,
    /// Latest `(record_count, size_estimate)` reported by a sync.
    sync: Option<(i64, i64)>,
}

impl PendingCounts {
    fn absorb(&mut self, older: PendingCounts) {
        self.hits += older.hits;
        self.misses += older.misses;
        self.last_access_at = self.last_access_at.max(older.last_access_at);
        if self.sync.is_none() {
            self.sync = older.sync;
        }
    }
}

#[derive(Debug)]
struct CounterState {
    pending: HashMap<String, PendingCounts>,
    ops_since_flush: u64,
    last_flush_at: i64,
}

/// Persisted per-table statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TableStats {
    pub source_table_id: String,
    pub hits: i64,
    pub misses: i64,
    pub last_access_at: Option<i64>,
    pub record_count: i64,
    pub size_estimate: i64,
    pub updated_at: i64,
}

impl TableStats {
    /// Fraction of lookups served without a sync. Zero when never accessed.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Remote syncs that did not have to happen.
    pub fn calls_avoided(&self) -> i64 {
        self.hits
    }
}

pub struct PerformanceCounter {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    flush_every_ops: u64,
    flush_interval_secs: i64,
    state: Mutex<CounterState>,
}

impl PerformanceCounter {
    pub fn new(pool: SqlitePool, config: &StatsConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            pool,
            clock,
            flush_every_ops: config.flush_every_ops,
            flush_interval_secs: config.flush_interval_secs as i64,
            state: Mutex::new(CounterState {
                pending: HashMap::new(),
                ops_since_flush: 0,
                last_flush_at: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        // Counters are plain integers; a panic mid-increment leaves them usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a lookup served from fresh local data. Returns whether a flush
    /// is due.
    pub fn record_hit(&self, source_table_id: &str) -> bool {
        self.record(source_table_id, true)
    }

    /// Count a lookup that needed a sync. Returns whether a flush is due.
    pub fn record_miss(&self, source_table_id: &str) -> bool {
        self.record(source_table_id, false)
    }

    fn record(&self, source_table_id: &str, hit: bool) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        let entry = state
            .pending
            .entry(source_table_id.to_string())
            .or_default();
        if hit {
            entry.hits += 1;
        } else {
            entry.misses += 1;
        }
        entry.last_access_at = Some(now);
        state.ops_since_flush += 1;
        self.due(&state, now)
    }

    /// Remember the size of a table after a successful sync.
    pub fn record_sync(&self, source_table_id: &str, record_count: i64, size_estimate: i64) {
        let mut state = self.lock();
        state
            .pending
            .entry(source_table_id.to_string())
            .or_default()
            .sync = Some((record_count, size_estimate));
    }

    fn due(&self, state: &CounterState, now: i64) -> bool {
        if state.pending.is_empty() {
            return false;
        }
        state.ops_since_flush >= self.flush_every_ops
            || now - state.last_flush_at >= self.flush_interval_secs
    }

    pub fn is_flush_due(&self) -> bool {
        let now = self.clock.now();
        self.due(&self.lock(), now)
    }

    /// Operations recorded since the last flush.
    pub fn pending_ops(&self) -> u64 {
        self.lock().ops_since_flush
    }

    /// Write all pending counters. Returns the number of tables written.
    pub async fn flush(&self) -> Result<usize> {
        let now = self.clock.now();
        let (batch, ops) = {
            let mut state = self.lock();
            let ops = state.ops_since_flush;
            state.ops_since_flush = 0;
            state.last_flush_at = now;
            (std::mem::take(&mut state.pending), ops)
        };

        if batch.is_empty() {
            return Ok(0);
        }

        match self.write_batch(&batch, now).await {
            Ok(()) => {
                debug!(tables = batch.len(), ops, "flushed performance counters");
                Ok(batch.len())
            }
            Err(e) => {
                warn!(error = %e, tables = batch.len(), "counter flush failed; keeping batch");
                let mut state = self.lock();
                state.ops_since_flush += ops;
                for (id, counts) in batch {
                    state.pending.entry(id).or_default().absorb(counts);
                }
                Err(e)
            }
        }
    }

    pub async fn flush_if_due(&self) -> Result<usize> {
        if self.is_flush_due() {
            self.flush().await
        } else {
            Ok(0)
        }
    }

    async fn write_batch(&self, batch: &HashMap<String, PendingCounts>, now: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (id, counts) in batch {
            let record_count = counts.sync.map(|(c, _)| c);
            let size_estimate = counts.sync.map(|(_, s)| s);

            sqlx::query(
                r#"
                INSERT INTO cache_performance
                    (source_table_id, hits, misses, last_access_at, record_count, size_estimate, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source_table_id) DO UPDATE SET
                    hits = cache_performance.hits + excluded.hits,
                    misses = cache_performance.misses + excluded.misses,
                    last_access_at = COALESCE(
                        MAX(cache_performance.last_access_at, excluded.last_access_at),
                        cache_performance.last_access_at,
                        excluded.last_access_at
                    ),
                    record_count = COALESCE(?, cache_performance.record_count),
                    size_estimate = COALESCE(?, cache_performance.size_estimate),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(id)
            .bind(counts.hits as i64)
            .bind(counts.misses as i64)
            .bind(counts.last_access_at)
            .bind(record_count.unwrap_or(0))
            .bind(size_estimate.unwrap_or(0))
            .bind(now)
            .bind(record_count)
            .bind(size_estimate)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Flush on a timer until the returned task is aborted.
    pub fn spawn_periodic_flush(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.flush_interval_secs.max(1) as u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush_if_due().await {
                    warn!(error = %e, "periodic counter flush failed");
                }
            }
        })
    }

    /// Read persisted stats for one table, or all tables.
    pub async fn load(&self, source_table_id: Option<&str>) -> Result<Vec<TableStats>> {
        let rows = match source_table_id {
            Some(id) => {
                sqlx::query("SELECT * FROM cache_performance WHERE source_table_id = ?")
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM cache_performance ORDER BY source_table_id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| TableStats {
                source_table_id: row.get("source_table_id"),
                hits: row.get("hits"),
                misses: row.get("misses"),
                last_access_at: row.get("last_access_at"),
                record_count: row.get("record_count"),
                size_estimate: row.get("size_estimate"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }
}

/// Print a stats table for `mirror stats`.
pub fn print_stats(db_path: &Path, stats: &[TableStats]) {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    println!("Table Mirror — Cache Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Tables:      {}", stats.len());

    if stats.is_empty() {
        println!();
        return;
    }

    println!();
    println!(
        "  {:<28} {:>7} {:>7} {:>7} {:>9} {:>10}   {}",
        "TABLE", "HITS", "MISSES", "RATE", "RECORDS", "SIZE", "LAST ACCESS"
    );
    println!("  {}", "-".repeat(92));

    for s in stats {
        let access = match s.last_access_at {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        };
        println!(
            "  {:<28} {:>7} {:>7} {:>6.1}% {:>9} {:>10}   {}",
            s.source_table_id,
            s.hits,
            s.misses,
            s.hit_rate() * 100.0,
            s.record_count,
            format_bytes(s.size_estimate.max(0) as u64),
            access
        );
    }

    println!();
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = TableStats {
            source_table_id: "t".into(),
            hits: 3,
            misses: 1,
            last_access_at: None,
            record_count: 0,
            size_estimate: 0,
            updated_at: 0,
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.calls_avoided(), 3);

        let idle = TableStats { hits: 0, misses: 0, ..stats };
        assert_eq!(idle.hit_rate(), 0.0);
    }

    #[test]
    fn test_absorb_merges_counts() {
        let mut newer = PendingCounts {
            hits: 2,
            misses: 0,
            last_access_at: Some(20),
            sync: None,
        };
        newer.absorb(PendingCounts {
            hits: 1,
            misses: 4,
            last_access_at: Some(10),
            sync: Some((5, 50)),
        });
        assert_eq!(newer.hits, 3);
        assert_eq!(newer.misses, 4);
        assert_eq!(newer.last_access_at, Some(20));
        assert_eq!(newer.sync, Some((5, 50)));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
    }
}
