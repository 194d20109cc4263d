//! Remote field kinds and their local column representation.
//!
//! [`map_field_kind`] is the default type mapper. It is a pure function and
//! never fails: anything it does not recognise is stored as serialized JSON
//! text. Once a column has been created with a type it is never retyped, so
//! changing this mapping only affects newly appended columns.
//!
//! This module also owns value encoding (remote JSON → SQL value) and
//! decoding (SQL row → JSON), so the two directions stay symmetric.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat};
use serde::{Serialize, Serializer};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::Row;
use std::fmt;
use tracing::debug;

use crate::models::ColumnBinding;

/// A remote field kind, normalised from the source's own naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Text,
    TextArea,
    RichText,
    Email,
    Phone,
    Url,
    AutoNumber,
    Number,
    Currency,
    Percent,
    Rating,
    Duration,
    Date,
    DateTime,
    Boolean,
    SingleSelect,
    Status,
    MultipleSelect,
    LinkedRecord,
    User,
    Tags,
    Attachment,
    Unknown(String),
}

/// How a kind behaves in filters and in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    String,
    Numeric,
    Date,
    Boolean,
    Enum,
    Array,
}

/// Local column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Real,
    /// Seconds since the Unix epoch, UTC.
    Epoch,
    /// 0 or 1.
    Boolean,
    /// Serialized JSON array or object in a TEXT column.
    Json,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Json => "TEXT",
            ColumnType::Real => "REAL",
            ColumnType::Epoch | ColumnType::Boolean => "INTEGER",
        }
    }
}

/// Signature of a pluggable type mapper.
pub type TypeMapper = fn(&FieldKind) -> ColumnType;

impl FieldKind {
    /// Parse a remote kind name. Never fails; unrecognised names become
    /// [`FieldKind::Unknown`].
    ///
    /// Matching ignores case, separators and a trailing `field` suffix, so
    /// `"singleselectfield"`, `"single_select"` and `"Single Select"` all
    /// resolve to [`FieldKind::SingleSelect`].
    pub fn parse(name: &str) -> FieldKind {
        let mut norm: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if norm.len() > "field".len() && norm.ends_with("field") {
            norm.truncate(norm.len() - "field".len());
        }

        match norm.as_str() {
            "text" | "string" | "singlelinetext" | "recordtitle" | "title" => FieldKind::Text,
            "textarea" | "longtext" | "multilinetext" => FieldKind::TextArea,
            "richtext" | "richtextarea" => FieldKind::RichText,
            "email" => FieldKind::Email,
            "phone" | "phonenumber" => FieldKind::Phone,
            "url" | "link" => FieldKind::Url,
            "autonumber" => FieldKind::AutoNumber,
            "number" | "numeric" | "integer" | "float" | "decimal" => FieldKind::Number,
            "currency" => FieldKind::Currency,
            "percent" | "percentage" | "percentcomplete" => FieldKind::Percent,
            "rating" => FieldKind::Rating,
            "duration" => FieldKind::Duration,
            "date" | "duedate" => FieldKind::Date,
            "datetime" | "timestamp" | "firstcreated" | "lastupdated" | "createdtime"
            | "lastmodifiedtime" => FieldKind::DateTime,
            "boolean" | "bool" | "checkbox" | "yesno" => FieldKind::Boolean,
            "singleselect" | "select" | "enum" | "choice" => FieldKind::SingleSelect,
            "status" => FieldKind::Status,
            "multipleselect" | "multiselect" | "multiplechoice" => FieldKind::MultipleSelect,
            "linkedrecord" | "linktorecord" | "reference" | "foreignkey" => {
                FieldKind::LinkedRecord
            }
            "user" | "assignee" | "collaborator" | "people" => FieldKind::User,
            "tags" | "tag" => FieldKind::Tags,
            "attachment" | "attachments" | "file" | "files" => FieldKind::Attachment,
            _ => FieldKind::Unknown(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldKind::Text => "text",
            FieldKind::TextArea => "textarea",
            FieldKind::RichText => "richtext",
            FieldKind::Email => "email",
            FieldKind::Phone => "phone",
            FieldKind::Url => "url",
            FieldKind::AutoNumber => "autonumber",
            FieldKind::Number => "number",
            FieldKind::Currency => "currency",
            FieldKind::Percent => "percent",
            FieldKind::Rating => "rating",
            FieldKind::Duration => "duration",
            FieldKind::Date => "date",
            FieldKind::DateTime => "datetime",
            FieldKind::Boolean => "boolean",
            FieldKind::SingleSelect => "singleselect",
            FieldKind::Status => "status",
            FieldKind::MultipleSelect => "multipleselect",
            FieldKind::LinkedRecord => "linkedrecord",
            FieldKind::User => "user",
            FieldKind::Tags => "tags",
            FieldKind::Attachment => "attachment",
            FieldKind::Unknown(name) => name.as_str(),
        }
    }

    pub fn class(&self) -> KindClass {
        match self {
            FieldKind::Text
            | FieldKind::TextArea
            | FieldKind::RichText
            | FieldKind::Email
            | FieldKind::Phone
            | FieldKind::Url
            | FieldKind::AutoNumber => KindClass::String,
            FieldKind::Number
            | FieldKind::Currency
            | FieldKind::Percent
            | FieldKind::Rating
            | FieldKind::Duration => KindClass::Numeric,
            FieldKind::Date | FieldKind::DateTime => KindClass::Date,
            FieldKind::Boolean => KindClass::Boolean,
            FieldKind::SingleSelect | FieldKind::Status => KindClass::Enum,
            FieldKind::MultipleSelect
            | FieldKind::LinkedRecord
            | FieldKind::User
            | FieldKind::Tags
            | FieldKind::Attachment
            | FieldKind::Unknown(_) => KindClass::Array,
        }
    }

    /// Kinds worth an index because filters hit them often.
    pub fn is_commonly_filtered(&self) -> bool {
        matches!(
            self,
            FieldKind::SingleSelect
                | FieldKind::Status
                | FieldKind::Date
                | FieldKind::DateTime
                | FieldKind::LinkedRecord
        )
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for FieldKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Default type mapper.
pub fn map_field_kind(kind: &FieldKind) -> ColumnType {
    match kind.class() {
        KindClass::String | KindClass::Enum => ColumnType::Text,
        KindClass::Numeric => ColumnType::Real,
        KindClass::Date => ColumnType::Epoch,
        KindClass::Boolean => ColumnType::Boolean,
        KindClass::Array => ColumnType::Json,
    }
}

/// A value ready to be bound to a SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Real(f64),
    Integer(i64),
}

/// Bind a [`SqlValue`] onto a query.
pub fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Real(f) => query.bind(*f),
        SqlValue::Integer(i) => query.bind(*i),
    }
}

/// Parse a date or datetime string to epoch seconds (UTC).
///
/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS` and
/// `YYYY-MM-DD`.
pub fn parse_date_str(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ndt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc().timestamp())
}

/// Encode a remote field value for storage in a column of the given kind.
pub fn encode_value(kind: &FieldKind, value: Option<&Value>) -> SqlValue {
    let value = match value {
        None | Some(Value::Null) => return SqlValue::Null,
        Some(v) => v,
    };

    match kind.class() {
        KindClass::String => match value {
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        },
        KindClass::Enum => match value {
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Object(map) => ["value", "label", "name"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .map(|s| SqlValue::Text(s.to_string()))
                .unwrap_or_else(|| SqlValue::Text(value.to_string())),
            other => SqlValue::Text(other.to_string()),
        },
        KindClass::Numeric => match value {
            Value::Number(n) => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(f) => SqlValue::Real(f),
                Err(_) => {
                    debug!(value = %s, "non-numeric value for {} field stored as NULL", kind);
                    SqlValue::Null
                }
            },
            _ => SqlValue::Null,
        },
        KindClass::Date => encode_date(value)
            .map(SqlValue::Integer)
            .unwrap_or(SqlValue::Null),
        KindClass::Boolean => match value {
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) => SqlValue::Integer(i64::from(n.as_f64().unwrap_or(0.0) != 0.0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => SqlValue::Integer(1),
                "false" | "no" | "0" => SqlValue::Integer(0),
                _ => SqlValue::Null,
            },
            _ => SqlValue::Null,
        },
        KindClass::Array => SqlValue::Text(value.to_string()),
    }
}

fn encode_date(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => parse_date_str(s),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::Object(map) => ["date", "from_date", "value"]
            .iter()
            .find_map(|k| map.get(*k))
            .and_then(encode_date),
        _ => None,
    }
}

/// Read one bound column from a row and decode it back to JSON.
pub fn decode_column(
    row: &SqliteRow,
    binding: &ColumnBinding,
    mapper: TypeMapper,
) -> Result<Value, sqlx::Error> {
    let column = binding.column.as_str();
    let value = match mapper(&binding.kind) {
        ColumnType::Text => row
            .try_get::<Option<String>, _>(column)?
            .map(Value::String)
            .unwrap_or(Value::Null),
        ColumnType::Real => row
            .try_get::<Option<f64>, _>(column)?
            .map(real_to_json)
            .unwrap_or(Value::Null),
        ColumnType::Epoch => row
            .try_get::<Option<i64>, _>(column)?
            .map(|ts| epoch_to_json(&binding.kind, ts))
            .unwrap_or(Value::Null),
        ColumnType::Boolean => row
            .try_get::<Option<i64>, _>(column)?
            .map(|b| Value::Bool(b != 0))
            .unwrap_or(Value::Null),
        ColumnType::Json => row
            .try_get::<Option<String>, _>(column)?
            .map(|s| serde_json::from_str(&s).unwrap_or(Value::String(s)))
            .unwrap_or(Value::Null),
    };
    Ok(value)
}

/// Integral reals come back as JSON integers so `50` round-trips as `50`.
fn real_to_json(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn epoch_to_json(kind: &FieldKind, ts: i64) -> Value {
    let Some(dt) = DateTime::from_timestamp(ts, 0) else {
        return Value::from(ts);
    };
    match kind {
        FieldKind::Date => Value::String(dt.format("%Y-%m-%d").to_string()),
        _ => Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_normalises_names() {
        assert_eq!(FieldKind::parse("singleselectfield"), FieldKind::SingleSelect);
        assert_eq!(FieldKind::parse("Single Select"), FieldKind::SingleSelect);
        assert_eq!(FieldKind::parse("linked_record"), FieldKind::LinkedRecord);
        assert_eq!(FieldKind::parse("numberfield"), FieldKind::Number);
        assert_eq!(FieldKind::parse("yesnofield"), FieldKind::Boolean);
        assert_eq!(FieldKind::parse("DateTime"), FieldKind::DateTime);
    }

    #[test]
    fn test_unknown_kind_maps_to_json() {
        let kind = FieldKind::parse("hologram");
        assert_eq!(kind, FieldKind::Unknown("hologram".to_string()));
        assert_eq!(map_field_kind(&kind), ColumnType::Json);
        assert_eq!(kind.as_str(), "hologram");
    }

    #[test]
    fn test_column_mapping() {
        assert_eq!(map_field_kind(&FieldKind::Text), ColumnType::Text);
        assert_eq!(map_field_kind(&FieldKind::Email), ColumnType::Text);
        assert_eq!(map_field_kind(&FieldKind::Currency), ColumnType::Real);
        assert_eq!(map_field_kind(&FieldKind::Date), ColumnType::Epoch);
        assert_eq!(map_field_kind(&FieldKind::Boolean), ColumnType::Boolean);
        assert_eq!(map_field_kind(&FieldKind::Status), ColumnType::Text);
        assert_eq!(map_field_kind(&FieldKind::MultipleSelect), ColumnType::Json);
        assert_eq!(map_field_kind(&FieldKind::LinkedRecord), ColumnType::Json);
        assert_eq!(ColumnType::Epoch.sql_type(), "INTEGER");
        assert_eq!(ColumnType::Json.sql_type(), "TEXT");
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date_str("1970-01-02"), Some(86_400));
        assert_eq!(parse_date_str("1970-01-01T00:01:00Z"), Some(60));
        assert_eq!(parse_date_str("1970-01-01 00:00:30"), Some(30));
        assert_eq!(parse_date_str("not a date"), None);
    }

    #[test]
    fn test_encode_values() {
        assert_eq!(
            encode_value(&FieldKind::Number, Some(&json!("12.5"))),
            SqlValue::Real(12.5)
        );
        assert_eq!(
            encode_value(&FieldKind::Number, Some(&json!("n/a"))),
            SqlValue::Null
        );
        assert_eq!(
            encode_value(&FieldKind::Boolean, Some(&json!(true))),
            SqlValue::Integer(1)
        );
        assert_eq!(
            encode_value(&FieldKind::Status, Some(&json!({"value": "done"}))),
            SqlValue::Text("done".to_string())
        );
        assert_eq!(
            encode_value(&FieldKind::Date, Some(&json!({"date": "1970-01-02"}))),
            SqlValue::Integer(86_400)
        );
        assert_eq!(
            encode_value(&FieldKind::Tags, Some(&json!(["a", "b"]))),
            SqlValue::Text("[\"a\",\"b\"]".to_string())
        );
        assert_eq!(encode_value(&FieldKind::Text, Some(&Value::Null)), SqlValue::Null);
        assert_eq!(encode_value(&FieldKind::Text, None), SqlValue::Null);
    }

    #[test]
    fn test_real_to_json_keeps_integers() {
        assert_eq!(real_to_json(50.0), json!(50));
        assert_eq!(real_to_json(2.5), json!(2.5));
    }

    #[test]
    fn test_epoch_to_json_by_kind() {
        assert_eq!(epoch_to_json(&FieldKind::Date, 86_400), json!("1970-01-02"));
        assert_eq!(
            epoch_to_json(&FieldKind::DateTime, 60),
            json!("1970-01-01T00:01:00Z")
        );
    }
}
