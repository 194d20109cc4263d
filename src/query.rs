//! Chainable record queries over materialized tables.
//!
//! ```rust,ignore
//! let result = mirror
//!     .records("tbl_deals")
//!     .clause("status", Comparator::Is, json!("Active"))
//!     .order_by("revenue", SortDirection::Desc)
//!     .limit(20)
//!     .execute()
//!     .await?;
//! println!("{} of {}", result.rows.len(), result.total_count);
//! ```
//!
//! [`RecordQuery::execute`] first makes sure the table's records are fresh
//! (syncing if needed), then runs a page query and a separate `COUNT(*)`
//! with the same WHERE clause.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;

use crate::error::{QueryError, Result, TranslationError};
use crate::filter::{resolve_field, Comparator, FilterClause, FilterExpression, FilterTranslator};
use crate::models::{CacheTableBinding, CachedRecord};
use crate::schema::quote_ident;
use crate::sync::Synchronizer;
use crate::types::{bind_value, decode_column, SqlValue, TypeMapper};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One ORDER BY key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn new(field: &str, direction: SortDirection) -> Self {
        Self {
            field: field.to_string(),
            direction,
        }
    }

    /// Parse `field`, `field:asc` or `field:desc`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (field, direction) = match raw.rsplit_once(':') {
            Some((field, "desc")) => (field, SortDirection::Desc),
            Some((field, "asc")) => (field, SortDirection::Asc),
            Some(_) => return None,
            None => (raw, SortDirection::Asc),
        };
        let field = field.trim();
        if field.is_empty() {
            return None;
        }
        Some(Self::new(field, direction))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub rows: Vec<CachedRecord>,
    /// Rows matching the filter, ignoring limit and offset.
    pub total_count: i64,
}

/// Builder for one query against one source table.
pub struct RecordQuery<'a> {
    sync: &'a Synchronizer,
    table: Option<String>,
    filters: Vec<FilterExpression>,
    sort: Vec<SortKey>,
    limit: Option<i64>,
    offset: i64,
}

impl<'a> RecordQuery<'a> {
    pub fn new(sync: &'a Synchronizer) -> Self {
        Self {
            sync,
            table: None,
            filters: Vec::new(),
            sort: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn table(mut self, source_table_id: &str) -> Self {
        self.table = Some(source_table_id.to_string());
        self
    }

    /// Add a filter expression. Multiple expressions are ANDed together.
    pub fn filter(mut self, expr: FilterExpression) -> Self {
        if !expr.is_empty() {
            self.filters.push(expr);
        }
        self
    }

    /// Add a single AND-ed leaf.
    pub fn clause(self, field: &str, comparator: Comparator, value: Value) -> Self {
        self.filter(FilterExpression::and(vec![FilterClause::new(
            field, comparator, value,
        )]))
    }

    pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.sort.push(SortKey::new(field, direction));
        self
    }

    pub fn sort(mut self, keys: impl IntoIterator<Item = SortKey>) -> Self {
        self.sort.extend(keys);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub async fn execute(self) -> Result<QueryResult> {
        let source_table_id = self.table.clone().ok_or(QueryError::NoTable)?;
        if let Some(limit) = self.limit {
            if limit < 0 {
                return Err(QueryError::InvalidWindow(format!("limit {} is negative", limit)).into());
            }
        }
        if self.offset < 0 {
            return Err(
                QueryError::InvalidWindow(format!("offset {} is negative", self.offset)).into(),
            );
        }

        let hit = self.sync.ensure_fresh(&source_table_id).await?;
        let counter = self.sync.counter();
        let flush_due = if hit {
            counter.record_hit(&source_table_id)
        } else {
            counter.record_miss(&source_table_id)
        };
        if flush_due {
            if let Err(e) = counter.flush().await {
                warn!(error = %e, "counter flush failed");
            }
        }

        let binding = self
            .sync
            .registry()
            .binding(&source_table_id)
            .await?
            .ok_or_else(|| QueryError::UnknownTable(source_table_id.clone()))?;

        let compiled = self.compile(&binding)?;

        // Page and count read the same snapshot
        let mut tx = self.sync.pool().begin().await?;

        let mut page = sqlx::query(&compiled.select);
        for param in &compiled.params {
            page = bind_value(page, param);
        }
        for param in &compiled.window {
            page = bind_value(page, param);
        }
        let rows = page.fetch_all(&mut *tx).await?;

        let mut count = sqlx::query(&compiled.count);
        for param in &compiled.params {
            count = bind_value(count, param);
        }
        let total_count: i64 = count.fetch_one(&mut *tx).await?.try_get(0)?;
        tx.commit().await?;

        let mapper = self.sync.registry().mapper();
        let rows = rows
            .iter()
            .map(|row| decode_row(row, &binding, mapper))
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        Ok(QueryResult { rows, total_count })
    }

    fn compile(&self, binding: &CacheTableBinding) -> std::result::Result<Compiled, TranslationError> {
        let translator = FilterTranslator::new(self.sync.freshness().now());
        let table = quote_ident(&binding.local_table_name);

        let mut params = Vec::new();
        let mut conditions = Vec::new();
        for expr in &self.filters {
            let translated = translator.translate(expr, binding)?;
            if !translated.is_empty() {
                conditions.push(format!("({})", translated.sql));
                params.extend(translated.params);
            }
        }
        let where_sql = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let mut order = Vec::with_capacity(self.sort.len() + 1);
        for key in &self.sort {
            let (column, _) = resolve_field(binding, &key.field).ok_or_else(|| {
                TranslationError::UnknownField {
                    source_table_id: binding.source_table_id.clone(),
                    field: key.field.clone(),
                }
            })?;
            order.push(format!("{} {}", column, key.direction.sql()));
        }
        order.push(format!("{}.id ASC", table));

        let mut columns = vec![
            "id".to_string(),
            "remote_created_at".to_string(),
            "remote_updated_at".to_string(),
            "cached_at".to_string(),
        ];
        columns.extend(binding.columns.iter().map(|c| quote_ident(&c.column)));

        let mut select = format!(
            "SELECT {} FROM {}{} ORDER BY {}",
            columns.join(", "),
            table,
            where_sql,
            order.join(", ")
        );
        let mut window = Vec::new();
        match self.limit {
            Some(limit) => {
                select.push_str(" LIMIT ? OFFSET ?");
                window.push(SqlValue::Integer(limit));
                window.push(SqlValue::Integer(self.offset));
            }
            None if self.offset > 0 => {
                select.push_str(" LIMIT -1 OFFSET ?");
                window.push(SqlValue::Integer(self.offset));
            }
            None => {}
        }

        Ok(Compiled {
            count: format!("SELECT COUNT(*) FROM {}{}", table, where_sql),
            select,
            params,
            window,
        })
    }
}

struct Compiled {
    select: String,
    count: String,
    params: Vec<SqlValue>,
    window: Vec<SqlValue>,
}

fn decode_row(
    row: &SqliteRow,
    binding: &CacheTableBinding,
    mapper: TypeMapper,
) -> std::result::Result<CachedRecord, sqlx::Error> {
    let mut fields = Map::with_capacity(binding.columns.len());
    for column in &binding.columns {
        fields.insert(column.slug.clone(), decode_column(row, column, mapper)?);
    }
    Ok(CachedRecord {
        id: row.try_get("id")?,
        created_at: row.try_get("remote_created_at")?,
        updated_at: row.try_get("remote_updated_at")?,
        cached_at: row.try_get("cached_at")?,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_key_parse() {
        assert_eq!(
            SortKey::parse("revenue:desc"),
            Some(SortKey::new("revenue", SortDirection::Desc))
        );
        assert_eq!(
            SortKey::parse("due"),
            Some(SortKey::new("due", SortDirection::Asc))
        );
        assert_eq!(SortKey::parse("due:sideways"), None);
        assert_eq!(SortKey::parse(":desc"), None);
    }

    #[test]
    fn test_sort_key_deserialize_defaults_to_asc() {
        let key: SortKey = serde_json::from_str(r#"{"field": "due"}"#).unwrap();
        assert_eq!(key.direction, SortDirection::Asc);
    }
}
