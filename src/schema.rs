//! Schema registry and table materializer.
//!
//! The registry maps each source table to a local `src_*` table and each
//! field slug to a column, persisting that mapping in `cache_tables` and
//! `cache_columns`. [`SchemaRegistry::ensure_table`] is the only entry point
//! that changes local schema:
//!
//! 1. fingerprint unchanged → return the stored binding, no DDL;
//! 2. binding exists, new fields → `ALTER TABLE ... ADD COLUMN` per field;
//! 3. no binding → `CREATE TABLE` with every mapped field.
//!
//! Columns are append-only. Fields that disappear from the descriptor keep
//! their (now orphaned) column, and a column is never retyped.
//!
//! All dialect-specific DDL lives behind [`TableMaterializer`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SchemaError};
use crate::freshness::Clock;
use crate::models::{CacheTableBinding, ColumnBinding, FieldDescriptor, SourceTableDescriptor};
use crate::types::{map_field_kind, ColumnType, FieldKind, TypeMapper};

/// Columns every materialized table carries besides the mapped fields.
pub const BOOKKEEPING_COLUMNS: &[&str] =
    &["id", "remote_created_at", "remote_updated_at", "cached_at"];

const MAX_IDENTIFIER_LEN: usize = 60;

/// Words that may not be used verbatim as a column name.
const RESERVED_WORDS: &[&str] = &[
    "abort", "add", "all", "alter", "and", "as", "asc", "begin", "between", "by", "case",
    "cast", "check", "collate", "column", "commit", "constraint", "create", "cross",
    "default", "delete", "desc", "distinct", "drop", "else", "end", "escape", "except",
    "exists", "foreign", "from", "full", "glob", "group", "having", "in", "index", "inner",
    "insert", "intersect", "into", "is", "isnull", "join", "key", "left", "like", "limit",
    "match", "natural", "not", "notnull", "null", "of", "offset", "on", "or", "order",
    "outer", "primary", "references", "regexp", "replace", "right", "rowid", "oid",
    "_rowid_", "select", "set", "table", "then", "to", "transaction", "union", "unique",
    "update", "using", "values", "when", "where", "with",
];

// ═══════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════

/// Lowercase, replace anything outside `[a-z0-9]` with `_`, collapse runs
/// of `_` and trim them from the ends. Identifiers that would start with a
/// digit get an `f_` prefix. May return an empty string.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "f_");
    }
    out.truncate(MAX_IDENTIFIER_LEN);
    while out.ends_with('_') {
        out.pop();
    }
    out
}

pub fn is_reserved(identifier: &str) -> bool {
    let lower = identifier.to_ascii_lowercase();
    RESERVED_WORDS.contains(&lower.as_str()) || BOOKKEEPING_COLUMNS.contains(&lower.as_str())
}

/// Double-quote an identifier for use in SQL text.
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Pick a column name for `field`: sanitized label first, then sanitized
/// slug, then the slug with a numeric suffix.
fn choose_column_name(field: &FieldDescriptor, taken: &HashSet<String>) -> String {
    let usable = |name: &str| !name.is_empty() && !is_reserved(name) && !taken.contains(name);

    let from_label = sanitize_identifier(&field.label);
    if usable(&from_label) {
        return from_label;
    }

    let from_slug = sanitize_identifier(&field.slug);
    if usable(&from_slug) {
        return from_slug;
    }

    let mut base = if from_slug.is_empty() {
        "field".to_string()
    } else {
        from_slug
    };
    if is_reserved(&base) {
        base = format!("f_{}", base);
    }
    if usable(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| usable(candidate))
        .unwrap_or(base)
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    format!("{:x}", digest)[..10].to_string()
}

/// `src_{display}_{id}`, falling back to a hash of the id when the id has
/// no usable characters.
fn base_table_name(descriptor: &SourceTableDescriptor) -> String {
    let mut display = sanitize_identifier(&descriptor.display_name);
    if display.is_empty() {
        display = "table".to_string();
    }
    display.truncate(24);
    while display.ends_with('_') {
        display.pop();
    }

    let mut id = sanitize_identifier(&descriptor.source_table_id);
    if id.is_empty() {
        id = short_hash(&descriptor.source_table_id);
    }
    id.truncate(30);

    format!("src_{}_{}", display, id)
}

/// SHA-256 over everything in a descriptor that affects materialization.
pub fn fingerprint(descriptor: &SourceTableDescriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(descriptor.source_table_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(descriptor.display_name.as_bytes());
    for field in &descriptor.fields {
        hasher.update([0x1eu8]);
        hasher.update(field.slug.as_bytes());
        hasher.update([0u8]);
        hasher.update(field.label.as_bytes());
        hasher.update([0u8]);
        hasher.update(field.kind.as_bytes());
        if let Some(ref choices) = field.choice_values {
            for choice in choices {
                hasher.update([0x1fu8]);
                hasher.update(choice.as_bytes());
            }
        }
    }
    format!("{:x}", hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════
// Materializer
// ═══════════════════════════════════════════════════════════════════════

/// Dialect-specific DDL for materialized tables.
///
/// Calls run on a connection inside the registry's transaction, so DDL and
/// the binding rows it corresponds to commit together.
#[async_trait]
pub trait TableMaterializer: Send + Sync {
    /// Create `table` with the bookkeeping columns plus `columns`. Fails
    /// with [`SchemaError::TableExists`] if a table of that name is left over.
    async fn create_table(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        columns: &[(String, ColumnType)],
    ) -> Result<()>;

    /// Append a column. Returns `false` if the column already existed.
    async fn add_column(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> Result<bool>;

    async fn create_index(&self, conn: &mut SqliteConnection, table: &str, column: &str)
        -> Result<()>;
}

/// SQLite DDL.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteMaterializer;

#[async_trait]
impl TableMaterializer for SqliteMaterializer {
    async fn create_table(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        columns: &[(String, ColumnType)],
    ) -> Result<()> {
        let mut ddl = format!(
            "CREATE TABLE {} (\n    id TEXT PRIMARY KEY,\n    remote_created_at INTEGER,\n    remote_updated_at INTEGER,\n    cached_at INTEGER NOT NULL",
            quote_ident(table)
        );
        for (name, column_type) in columns {
            ddl.push_str(&format!(",\n    {} {}", quote_ident(name), column_type.sql_type()));
        }
        ddl.push_str("\n)");

        debug!(table, columns = columns.len(), "creating materialized table");
        match sqlx::query(&ddl).execute(&mut *conn).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.message().contains("already exists") => {
                Err(SchemaError::TableExists(table.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn add_column(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> Result<bool> {
        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(table),
            quote_ident(column),
            column_type.sql_type()
        );
        match sqlx::query(&ddl).execute(&mut *conn).await {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.message().contains("duplicate column name") => {
                debug!(table, column, "column already present, treating as applied");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_index(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        column: &str,
    ) -> Result<()> {
        let index = format!("idx_{}_{}", table, column);
        let ddl = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            quote_ident(&index),
            quote_ident(table),
            quote_ident(column)
        );
        sqlx::query(&ddl).execute(&mut *conn).await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Owns source table → local table bindings.
pub struct SchemaRegistry {
    pool: SqlitePool,
    materializer: Box<dyn TableMaterializer>,
    mapper: TypeMapper,
    clock: Arc<dyn Clock>,
}

impl SchemaRegistry {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self::with_materializer(pool, clock, Box::new(SqliteMaterializer), map_field_kind)
    }

    pub fn with_materializer(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        materializer: Box<dyn TableMaterializer>,
        mapper: TypeMapper,
    ) -> Self {
        Self {
            pool,
            materializer,
            mapper,
            clock,
        }
    }

    pub fn mapper(&self) -> TypeMapper {
        self.mapper
    }

    /// Load the stored binding for a source table, if any.
    pub async fn binding(&self, source_table_id: &str) -> Result<Option<CacheTableBinding>> {
        let row = sqlx::query(
            "SELECT source_table_id, local_table_name, display_name, schema_fingerprint, created_at, last_synced_at FROM cache_tables WHERE source_table_id = ?",
        )
        .bind(source_table_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let column_rows = sqlx::query(
            "SELECT field_slug, column_name, kind FROM cache_columns WHERE source_table_id = ? ORDER BY position ASC",
        )
        .bind(source_table_id)
        .fetch_all(&self.pool)
        .await?;

        let columns = column_rows
            .iter()
            .map(|r| ColumnBinding {
                slug: r.get("field_slug"),
                column: r.get("column_name"),
                kind: FieldKind::parse(r.get::<&str, _>("kind")),
            })
            .collect();

        Ok(Some(CacheTableBinding {
            source_table_id: row.get("source_table_id"),
            local_table_name: row.get("local_table_name"),
            display_name: row.get("display_name"),
            columns,
            schema_fingerprint: row.get("schema_fingerprint"),
            created_at: row.get("created_at"),
            last_synced_at: row.get("last_synced_at"),
        }))
    }

    pub async fn list_bindings(&self) -> Result<Vec<CacheTableBinding>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT source_table_id FROM cache_tables ORDER BY source_table_id")
                .fetch_all(&self.pool)
                .await?;

        let mut bindings = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(binding) = self.binding(&id).await? {
                bindings.push(binding);
            }
        }
        Ok(bindings)
    }

    pub async fn touch_synced(&self, source_table_id: &str, ts: i64) -> Result<()> {
        sqlx::query("UPDATE cache_tables SET last_synced_at = ? WHERE source_table_id = ?")
            .bind(ts)
            .bind(source_table_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create or evolve the local table for `descriptor`.
    ///
    /// Callers that may race on the same table must serialize (the
    /// synchronizer holds a per-table lock around this).
    pub async fn ensure_table(
        &self,
        descriptor: &SourceTableDescriptor,
    ) -> Result<CacheTableBinding> {
        if descriptor.source_table_id.trim().is_empty() {
            return Err(SchemaError::InvalidIdentifier(descriptor.display_name.clone()).into());
        }
        let fingerprint = fingerprint(descriptor);

        match self.binding(&descriptor.source_table_id).await? {
            Some(binding) if binding.schema_fingerprint == fingerprint => {
                debug!(table = %descriptor.source_table_id, "schema unchanged");
                Ok(binding)
            }
            Some(binding) => self.evolve(binding, descriptor, fingerprint).await,
            None => self.materialize(descriptor, fingerprint).await,
        }
    }

    async fn materialize(
        &self,
        descriptor: &SourceTableDescriptor,
        fingerprint: String,
    ) -> Result<CacheTableBinding> {
        let local_table_name = self.unique_table_name(descriptor).await?;
        let fields = valid_fields(descriptor);

        let mut taken: HashSet<String> = HashSet::new();
        let mut columns = Vec::with_capacity(fields.len());
        for (field, kind) in fields {
            let column = choose_column_name(field, &taken);
            taken.insert(column.clone());
            columns.push(ColumnBinding {
                slug: field.slug.clone(),
                column,
                kind,
            });
        }

        let ddl_columns: Vec<(String, ColumnType)> = columns
            .iter()
            .map(|c| (c.column.clone(), (self.mapper)(&c.kind)))
            .collect();

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        self.materializer
            .create_table(&mut tx, &local_table_name, &ddl_columns)
            .await?;
        for column in columns.iter().filter(|c| c.kind.is_commonly_filtered()) {
            self.materializer
                .create_index(&mut tx, &local_table_name, &column.column)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO cache_tables (source_table_id, local_table_name, display_name, schema_fingerprint, created_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&descriptor.source_table_id)
        .bind(&local_table_name)
        .bind(&descriptor.display_name)
        .bind(&fingerprint)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (position, column) in columns.iter().enumerate() {
            insert_column_row(&mut tx, &descriptor.source_table_id, column, position).await?;
        }

        tx.commit().await?;

        info!(
            table = %descriptor.source_table_id,
            local = %local_table_name,
            columns = columns.len(),
            "materialized table"
        );

        Ok(CacheTableBinding {
            source_table_id: descriptor.source_table_id.clone(),
            local_table_name,
            display_name: descriptor.display_name.clone(),
            columns,
            schema_fingerprint: fingerprint,
            created_at: now,
            last_synced_at: None,
        })
    }

    async fn evolve(
        &self,
        mut binding: CacheTableBinding,
        descriptor: &SourceTableDescriptor,
        fingerprint: String,
    ) -> Result<CacheTableBinding> {
        let mut taken: HashSet<String> = binding
            .columns
            .iter()
            .map(|c| c.column.to_ascii_lowercase())
            .collect();

        let mut added = Vec::new();
        for (field, kind) in valid_fields(descriptor) {
            match binding.column(&field.slug) {
                Some(existing) if existing.kind != kind => {
                    debug!(
                        table = %binding.source_table_id,
                        field = %field.slug,
                        from = %existing.kind,
                        to = %kind,
                        "field kind changed remotely; column keeps its original type"
                    );
                }
                Some(_) => {}
                None => {
                    let column = choose_column_name(field, &taken);
                    taken.insert(column.clone());
                    added.push(ColumnBinding {
                        slug: field.slug.clone(),
                        column,
                        kind,
                    });
                }
            }
        }

        let mut tx = self.pool.begin().await?;

        for column in &added {
            let created = self
                .materializer
                .add_column(
                    &mut tx,
                    &binding.local_table_name,
                    &column.column,
                    (self.mapper)(&column.kind),
                )
                .await?;
            if column.kind.is_commonly_filtered() {
                self.materializer
                    .create_index(&mut tx, &binding.local_table_name, &column.column)
                    .await?;
            }
            let position = binding.columns.len();
            insert_column_row(&mut tx, &binding.source_table_id, column, position).await?;
            binding.columns.push(column.clone());
            debug!(
                table = %binding.source_table_id,
                column = %column.column,
                created,
                "appended column"
            );
        }

        sqlx::query(
            "UPDATE cache_tables SET schema_fingerprint = ?, display_name = ? WHERE source_table_id = ?",
        )
        .bind(&fingerprint)
        .bind(&descriptor.display_name)
        .bind(&binding.source_table_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if !added.is_empty() {
            info!(
                table = %binding.source_table_id,
                added = added.len(),
                "evolved table schema"
            );
        }

        binding.schema_fingerprint = fingerprint;
        binding.display_name = descriptor.display_name.clone();
        Ok(binding)
    }

    async fn unique_table_name(&self, descriptor: &SourceTableDescriptor) -> Result<String> {
        let base = base_table_name(descriptor);
        let taken: Option<String> = sqlx::query_scalar(
            "SELECT source_table_id FROM cache_tables WHERE local_table_name = ?",
        )
        .bind(&base)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match taken {
            Some(owner) if owner != descriptor.source_table_id => {
                format!("{}_{}", base, short_hash(&descriptor.source_table_id))
            }
            _ => base,
        })
    }
}

async fn insert_column_row(
    conn: &mut SqliteConnection,
    source_table_id: &str,
    column: &ColumnBinding,
    position: usize,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO cache_columns (source_table_id, field_slug, column_name, kind, position)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(source_table_id)
    .bind(&column.slug)
    .bind(&column.column)
    .bind(column.kind.as_str())
    .bind(position as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Fields that can be materialized, with their parsed kind. Malformed or
/// duplicate fields are logged and skipped.
fn valid_fields(descriptor: &SourceTableDescriptor) -> Vec<(&FieldDescriptor, FieldKind)> {
    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(descriptor.fields.len());

    for (index, field) in descriptor.fields.iter().enumerate() {
        let reason = if field.slug.trim().is_empty() {
            Some(format!("field #{} has no slug", index))
        } else if field.kind.trim().is_empty() {
            Some(format!("field '{}' has no kind", field.slug))
        } else if !seen.insert(field.slug.as_str()) {
            Some(format!("field '{}' is declared twice", field.slug))
        } else {
            None
        };

        if let Some(reason) = reason {
            let error = SchemaError::MalformedField {
                source_table_id: descriptor.source_table_id.clone(),
                reason,
            };
            warn!(%error, "skipping field");
            continue;
        }

        fields.push((field, FieldKind::parse(&field.kind)));
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(fields: Vec<FieldDescriptor>) -> SourceTableDescriptor {
        SourceTableDescriptor {
            source_table_id: "tbl_01H".to_string(),
            display_name: "Sales Pipeline".to_string(),
            fields,
        }
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Due Date"), "due_date");
        assert_eq!(sanitize_identifier("  Revenue ($) "), "revenue");
        assert_eq!(sanitize_identifier("2024 Budget"), "f_2024_budget");
        assert_eq!(sanitize_identifier("Größe"), "gr_e");
        assert_eq!(sanitize_identifier("!!!"), "");
    }

    #[test]
    fn test_column_name_prefers_label() {
        let taken = HashSet::new();
        let field = FieldDescriptor::new("s1a2b3", "Status", "status");
        assert_eq!(choose_column_name(&field, &taken), "status");
    }

    #[test]
    fn test_column_name_falls_back_to_slug() {
        let mut taken = HashSet::new();
        taken.insert("status".to_string());
        let field = FieldDescriptor::new("s1a2b3", "Status", "status");
        assert_eq!(choose_column_name(&field, &taken), "s1a2b3");

        let reserved = FieldDescriptor::new("order_ref", "Order", "text");
        assert_eq!(choose_column_name(&reserved, &HashSet::new()), "order_ref");

        let id_field = FieldDescriptor::new("id", "ID", "text");
        assert_eq!(choose_column_name(&id_field, &HashSet::new()), "f_id");
    }

    #[test]
    fn test_column_name_suffixes_when_everything_collides() {
        let mut taken = HashSet::new();
        taken.insert("notes".to_string());
        let field = FieldDescriptor::new("notes", "Notes", "text");
        assert_eq!(choose_column_name(&field, &taken), "notes_2");
    }

    #[test]
    fn test_table_name() {
        let d = descriptor(vec![]);
        assert_eq!(base_table_name(&d), "src_sales_pipeline_tbl_01h");

        let odd = SourceTableDescriptor {
            source_table_id: "***".to_string(),
            display_name: String::new(),
            fields: vec![],
        };
        let name = base_table_name(&odd);
        assert!(name.starts_with("src_table_"));
        assert_eq!(name.len(), "src_table_".len() + 10);
    }

    #[test]
    fn test_fingerprint_tracks_fields() {
        let a = descriptor(vec![FieldDescriptor::new("s", "Status", "status")]);
        let mut b = a.clone();
        assert_eq!(fingerprint(&a), fingerprint(&b));

        b.fields.push(FieldDescriptor::new("r", "Revenue", "number"));
        assert_ne!(fingerprint(&a), fingerprint(&b));

        let c = descriptor(vec![
            FieldDescriptor::new("s", "Status", "status").with_choices(&["Active"])
        ]);
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_valid_fields_skips_malformed() {
        let d = descriptor(vec![
            FieldDescriptor::new("", "No slug", "text"),
            FieldDescriptor::new("ok", "Fine", "text"),
            FieldDescriptor::new("nokind", "No kind", ""),
            FieldDescriptor::new("ok", "Duplicate", "number"),
        ]);
        let fields = valid_fields(&d);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].0.slug, "ok");
        assert_eq!(fields[0].1, FieldKind::Text);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("due"), "\"due\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
