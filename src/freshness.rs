//! TTL-governed freshness per scope.
//!
//! A scope is fresh while `now < expires_at`. Only two things move
//! `expires_at`:
//!
//! - a successful sync ([`FreshnessPolicy::mark_synced`]) advances it to
//!   `max(current, now + ttl)`;
//! - an explicit [`FreshnessPolicy::invalidate`] moves it into the past.
//!
//! Writing a record on the remote side never touches freshness. Staleness
//! is bounded purely by the TTL.
//!
//! Structural invalidation cascades downward:
//!
//! ```text
//! tables ──▶ table:{id} ──▶ records:{id}
//! ```

use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Source of "now", in epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// A clock that only moves when told to. Used to simulate TTL expiry.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, ts: i64) {
        self.now.store(ts, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A named unit of cached data with its own TTL window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The remote table list.
    Tables,
    /// One table's structure (its descriptor and binding).
    TableSchema(String),
    /// One table's records.
    Records(String),
}

impl Scope {
    pub fn key(&self) -> String {
        match self {
            Scope::Tables => "tables".to_string(),
            Scope::TableSchema(id) => format!("table:{}", id),
            Scope::Records(id) => format!("records:{}", id),
        }
    }

    /// Parse a scope name with an optional target.
    ///
    /// `("records", Some("tbl1"))` and `("records:tbl1", None)` are
    /// equivalent. `("tables", Some(id))` addresses that table's structure.
    pub fn parse(scope: &str, target: Option<&str>) -> Result<Scope> {
        let (name, inline_target) = match scope.split_once(':') {
            Some((name, rest)) => (name, Some(rest)),
            None => (scope, None),
        };
        let target = inline_target
            .or(target)
            .map(str::trim)
            .filter(|t| !t.is_empty());

        match (name.trim().to_ascii_lowercase().as_str(), target) {
            ("tables", None) => Ok(Scope::Tables),
            ("tables" | "table" | "schema" | "structure", Some(id)) => {
                Ok(Scope::TableSchema(id.to_string()))
            }
            ("records", Some(id)) => Ok(Scope::Records(id.to_string())),
            ("table" | "schema" | "structure" | "records", None) => Err(CacheError::UnknownScope(
                format!("{} (missing table id)", scope),
            )),
            _ => Err(CacheError::UnknownScope(scope.to_string())),
        }
    }

    pub fn source_table_id(&self) -> Option<&str> {
        match self {
            Scope::Tables => None,
            Scope::TableSchema(id) | Scope::Records(id) => Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// TTLs per resource category, with per-table record overrides.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub tables_secs: i64,
    pub schema_secs: i64,
    pub records_secs: i64,
    pub per_table_records: HashMap<String, i64>,
}

impl TtlPolicy {
    pub fn from_config(cache: &CacheConfig) -> Self {
        Self {
            tables_secs: cache.tables_ttl_secs as i64,
            schema_secs: cache.schema_ttl_secs as i64,
            records_secs: cache.records_ttl_secs as i64,
            per_table_records: cache
                .table_ttl
                .iter()
                .map(|(id, ttl)| (id.clone(), *ttl as i64))
                .collect(),
        }
    }

    pub fn ttl_for(&self, scope: &Scope) -> i64 {
        match scope {
            Scope::Tables => self.tables_secs,
            Scope::TableSchema(_) => self.schema_secs,
            Scope::Records(id) => self
                .per_table_records
                .get(id)
                .copied()
                .unwrap_or(self.records_secs),
        }
    }
}

/// Freshness of one scope as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreshnessReport {
    pub scope: String,
    pub fresh: bool,
    pub expires_at: Option<i64>,
    pub last_synced_at: Option<i64>,
}

/// Persisted freshness state, backed by `cache_freshness`.
pub struct FreshnessPolicy {
    pool: SqlitePool,
    ttl: TtlPolicy,
    clock: Arc<dyn Clock>,
}

impl FreshnessPolicy {
    pub fn new(pool: SqlitePool, ttl: TtlPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { pool, ttl, clock }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub async fn is_fresh(&self, scope: &Scope) -> Result<bool> {
        Ok(self.state(scope).await?.fresh)
    }

    pub async fn state(&self, scope: &Scope) -> Result<FreshnessReport> {
        let row =
            sqlx::query("SELECT last_synced_at, expires_at FROM cache_freshness WHERE scope = ?")
                .bind(scope.key())
                .fetch_optional(&self.pool)
                .await?;

        let now = self.clock.now();
        Ok(match row {
            Some(row) => {
                let expires_at: i64 = row.get("expires_at");
                FreshnessReport {
                    scope: scope.key(),
                    fresh: now < expires_at,
                    expires_at: Some(expires_at),
                    last_synced_at: row.get("last_synced_at"),
                }
            }
            None => FreshnessReport {
                scope: scope.key(),
                fresh: false,
                expires_at: None,
                last_synced_at: None,
            },
        })
    }

    /// Record a successful sync of `scope`. Returns the new `expires_at`.
    pub async fn mark_synced(&self, scope: &Scope) -> Result<i64> {
        let now = self.clock.now();
        let expires_at = now + self.ttl.ttl_for(scope);

        sqlx::query(
            r#"
            INSERT INTO cache_freshness (scope, last_synced_at, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(scope) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                expires_at = MAX(cache_freshness.expires_at, excluded.expires_at)
            "#,
        )
        .bind(scope.key())
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        debug!(scope = %scope, expires_at, "scope marked fresh");
        Ok(expires_at)
    }

    /// Force `scope` (and everything beneath it) stale. Idempotent.
    ///
    /// Returns the number of freshness entries that moved into the past.
    pub async fn invalidate(&self, scope: &Scope) -> Result<u64> {
        let past = self.clock.now() - 1;

        let result = match scope {
            Scope::Tables => {
                sqlx::query(
                    r#"
                    UPDATE cache_freshness SET expires_at = ?
                    WHERE (scope = 'tables' OR scope LIKE 'table:%' OR scope LIKE 'records:%')
                      AND expires_at > ?
                    "#,
                )
                .bind(past)
                .bind(past)
                .execute(&self.pool)
                .await?
            }
            Scope::TableSchema(id) => {
                sqlx::query(
                    "UPDATE cache_freshness SET expires_at = ? WHERE scope IN (?, ?) AND expires_at > ?",
                )
                .bind(past)
                .bind(scope.key())
                .bind(Scope::Records(id.clone()).key())
                .bind(past)
                .execute(&self.pool)
                .await?
            }
            Scope::Records(_) => {
                sqlx::query(
                    "UPDATE cache_freshness SET expires_at = ? WHERE scope = ? AND expires_at > ?",
                )
                .bind(past)
                .bind(scope.key())
                .bind(past)
                .execute(&self.pool)
                .await?
            }
        };

        let affected = result.rows_affected();
        info!(scope = %scope, affected, "invalidated");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_keys() {
        assert_eq!(Scope::Tables.key(), "tables");
        assert_eq!(Scope::TableSchema("t1".into()).key(), "table:t1");
        assert_eq!(Scope::Records("t1".into()).key(), "records:t1");
    }

    #[test]
    fn test_scope_parse_forms() {
        assert_eq!(Scope::parse("tables", None).unwrap(), Scope::Tables);
        assert_eq!(
            Scope::parse("records", Some("t1")).unwrap(),
            Scope::Records("t1".into())
        );
        assert_eq!(
            Scope::parse("records:t1", None).unwrap(),
            Scope::Records("t1".into())
        );
        assert_eq!(
            Scope::parse("tables", Some("t1")).unwrap(),
            Scope::TableSchema("t1".into())
        );
        assert_eq!(
            Scope::parse("table:t1", None).unwrap(),
            Scope::TableSchema("t1".into())
        );
        assert!(matches!(
            Scope::parse("records", None),
            Err(CacheError::UnknownScope(_))
        ));
        assert!(matches!(
            Scope::parse("widgets", None),
            Err(CacheError::UnknownScope(_))
        ));
    }

    #[test]
    fn test_ttl_overrides() {
        let mut cache = CacheConfig::default();
        cache.table_ttl.insert("volatile".to_string(), 30);
        let ttl = TtlPolicy::from_config(&cache);

        assert_eq!(ttl.ttl_for(&Scope::Records("volatile".into())), 30);
        assert_eq!(ttl.ttl_for(&Scope::Records("other".into())), 900);
        assert_eq!(ttl.ttl_for(&Scope::TableSchema("volatile".into())), 8 * 3600);
        assert_eq!(ttl.ttl_for(&Scope::Tables), 8 * 3600);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(50);
        assert_eq!(clock.now(), 1_050);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
