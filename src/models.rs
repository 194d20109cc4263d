//! Core data models used throughout the mirror.
//!
//! Descriptors and records arrive from a [`RemoteSource`](crate::traits::RemoteSource);
//! bindings and cached records describe what lives in the local SQLite file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::FieldKind;

/// One field of a remote table, as declared by the remote source.
///
/// `slug` and `kind` are required for materialization; descriptors that
/// lack either are skipped with a warning rather than failing the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub choice_values: Option<Vec<String>>,
    #[serde(default)]
    pub linked_table_ref: Option<String>,
}

impl FieldDescriptor {
    /// Convenience constructor for the common case.
    pub fn new(slug: &str, label: &str, kind: &str) -> Self {
        Self {
            slug: slug.to_string(),
            label: label.to_string(),
            kind: kind.to_string(),
            required: false,
            unique: false,
            is_primary: false,
            choice_values: None,
            linked_table_ref: None,
        }
    }

    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.choice_values = Some(choices.iter().map(|c| c.to_string()).collect());
        self
    }
}

/// Snapshot of a remote table's structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTableDescriptor {
    #[serde(default)]
    pub source_table_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

/// Entry in the remote source's table list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSummary {
    pub source_table_id: String,
    pub display_name: String,
}

/// Raw record produced by the remote source, keyed by field slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl RemoteRecord {
    pub fn new(id: &str, fields: Value) -> Self {
        Self {
            id: id.to_string(),
            created_at: None,
            updated_at: None,
            fields: match fields {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }
}

/// One page of records from [`RemoteSource::fetch_page`](crate::traits::RemoteSource::fetch_page).
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<RemoteRecord>,
    pub has_more: bool,
}

/// Mapping of one source field onto one local column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnBinding {
    pub slug: String,
    pub column: String,
    pub kind: FieldKind,
}

/// Registry entry tying a source table to its materialized local table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheTableBinding {
    pub source_table_id: String,
    pub local_table_name: String,
    pub display_name: String,
    /// Columns in creation order. Only ever appended to.
    pub columns: Vec<ColumnBinding>,
    pub schema_fingerprint: String,
    pub created_at: i64,
    pub last_synced_at: Option<i64>,
}

impl CacheTableBinding {
    pub fn column(&self, slug: &str) -> Option<&ColumnBinding> {
        self.columns.iter().find(|c| c.slug == slug)
    }

    pub fn has_column_name(&self, column: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.column.eq_ignore_ascii_case(column))
    }
}

/// A row read back from a materialized table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedRecord {
    pub id: String,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub cached_at: i64,
    /// Field values keyed by slug, decoded back into structured JSON.
    pub fields: Map<String, Value>,
}
