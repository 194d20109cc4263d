//! Error types for the mirror.
//!
//! Every failure is scoped to a single table or a single operation. The
//! variants group into four families:
//!
//! - [`SchemaError`]: a malformed field descriptor. Non-fatal: the field is
//!   skipped and materialization continues.
//! - [`SyncError`]: the remote source failed. Cached rows and freshness are
//!   left exactly as they were before the sync started.
//! - [`TranslationError`]: a caller mistake in a filter or sort. Surfaces
//!   immediately and is never retried.
//! - [`QueryError`]: the executor chain was incomplete or inconsistent.

use thiserror::Error;

/// A field descriptor that could not be mapped to a column.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("malformed field in table {source_table_id}: {reason}")]
    MalformedField {
        source_table_id: String,
        reason: String,
    },

    #[error("cannot derive a safe identifier from '{0}'")]
    InvalidIdentifier(String),

    #[error("local table {0} already exists without a binding; drop it to rematerialize")]
    TableExists(String),
}

/// Failure while pulling a table from the remote source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("failed to fetch descriptor for table {source_table_id}: {message}")]
    Descriptor {
        source_table_id: String,
        message: String,
    },

    #[error(
        "sync of table {source_table_id} failed after {pages_completed} page(s) \
         ({records_fetched} records fetched); cached snapshot kept: {message}"
    )]
    Fetch {
        source_table_id: String,
        pages_completed: usize,
        records_fetched: usize,
        message: String,
    },

    #[error("failed to list remote tables: {message}")]
    Listing { message: String },

    #[error("table {source_table_id} is currently refreshing")]
    Refreshing { source_table_id: String },
}

/// Filter or sort referencing something the binding cannot express.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    #[error("unknown field '{field}' in table {source_table_id}")]
    UnknownField {
        source_table_id: String,
        field: String,
    },

    #[error("comparator '{comparator}' is not supported for field '{field}' of kind {kind}")]
    UnsupportedComparator {
        field: String,
        comparator: String,
        kind: String,
    },

    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Malformed query-builder state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("query executed without a source table")]
    NoTable,

    #[error("table {0} has not been materialized")]
    UnknownTable(String),

    #[error("invalid page window: {0}")]
    InvalidWindow(String),
}

/// Top-level error for every mirror operation.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown scope '{0}'")]
    UnknownScope(String),
}

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// True when the error came from another caller holding the table lock.
    pub fn is_refreshing(&self) -> bool {
        matches!(self, CacheError::Sync(SyncError::Refreshing { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SyncError::Fetch {
            source_table_id: "tbl1".to_string(),
            pages_completed: 2,
            records_fetched: 2000,
            message: "connection reset".to_string(),
        };
        let text = error.to_string();
        assert!(text.contains("after 2 page(s)"));
        assert!(text.contains("2000 records"));

        let error = TranslationError::UnsupportedComparator {
            field: "revenue".to_string(),
            comparator: "has_any_of".to_string(),
            kind: "number".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "comparator 'has_any_of' is not supported for field 'revenue' of kind number"
        );
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = QueryError::NoTable.into();
        assert!(matches!(error, CacheError::Query(QueryError::NoTable)));

        let error: CacheError = SyncError::Refreshing {
            source_table_id: "tbl1".to_string(),
        }
        .into();
        assert!(error.is_refreshing());
    }
}
