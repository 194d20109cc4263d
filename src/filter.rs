//! Typed filter expressions and their translation to parameterized SQL.
//!
//! Filters are a flat AND/OR list of `{field, comparator, value}` leaves,
//! deserialized straight from JSON:
//!
//! ```json
//! {
//!   "operator": "and",
//!   "clauses": [
//!     { "field": "status",  "comparator": "is",              "value": "Active" },
//!     { "field": "due",     "comparator": "is_before",       "value": { "mode": "today" } },
//!     { "field": "revenue", "comparator": "is_greater_than", "value": 50 }
//!   ]
//! }
//! ```
//!
//! Each leaf is validated against the field's [`KindClass`]. Values are
//! always bound as parameters, never spliced into SQL text; only quoted
//! column identifiers taken from the binding are.

use chrono::{DateTime, Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TranslationError;
use crate::models::CacheTableBinding;
use crate::schema::quote_ident;
use crate::types::{parse_date_str, FieldKind, KindClass, SqlValue};

const DAY_SECS: i64 = 86_400;

/// How clauses are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conjunction {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Is,
    IsNot,
    Contains,
    NotContains,
    IsEmpty,
    IsNotEmpty,
    IsGreaterThan,
    IsLessThan,
    IsEqualOrGreaterThan,
    IsEqualOrLessThan,
    IsBefore,
    IsAfter,
    IsOnOrBefore,
    IsOnOrAfter,
    IsAnyOf,
    IsNoneOf,
    HasAnyOf,
    HasAllOf,
    IsExactly,
    HasNoneOf,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Is => "is",
            Comparator::IsNot => "is_not",
            Comparator::Contains => "contains",
            Comparator::NotContains => "not_contains",
            Comparator::IsEmpty => "is_empty",
            Comparator::IsNotEmpty => "is_not_empty",
            Comparator::IsGreaterThan => "is_greater_than",
            Comparator::IsLessThan => "is_less_than",
            Comparator::IsEqualOrGreaterThan => "is_equal_or_greater_than",
            Comparator::IsEqualOrLessThan => "is_equal_or_less_than",
            Comparator::IsBefore => "is_before",
            Comparator::IsAfter => "is_after",
            Comparator::IsOnOrBefore => "is_on_or_before",
            Comparator::IsOnOrAfter => "is_on_or_after",
            Comparator::IsAnyOf => "is_any_of",
            Comparator::IsNoneOf => "is_none_of",
            Comparator::HasAnyOf => "has_any_of",
            Comparator::HasAllOf => "has_all_of",
            Comparator::IsExactly => "is_exactly",
            Comparator::HasNoneOf => "has_none_of",
        }
    }
}

/// One `{field, comparator, value}` leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    #[serde(alias = "field_slug")]
    pub field: String,
    pub comparator: Comparator,
    #[serde(default)]
    pub value: Value,
}

impl FilterClause {
    pub fn new(field: &str, comparator: Comparator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            comparator,
            value,
        }
    }
}

/// A flat list of leaves joined by one conjunction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterExpression {
    #[serde(default, alias = "top_operator")]
    pub operator: Conjunction,
    #[serde(default)]
    pub clauses: Vec<FilterClause>,
}

impl FilterExpression {
    pub fn and(clauses: Vec<FilterClause>) -> Self {
        Self {
            operator: Conjunction::And,
            clauses,
        }
    }

    pub fn or(clauses: Vec<FilterClause>) -> Self {
        Self {
            operator: Conjunction::Or,
            clauses,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// Relative date modes accepted in `{ "mode": ... }` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateMode {
    ExactDate,
    Today,
    Yesterday,
    Tomorrow,
    OneWeekAgo,
    OneWeekFromNow,
    OneMonthAgo,
    OneMonthFromNow,
    NumberOfDaysAgo,
    NumberOfDaysFromNow,
}

#[derive(Debug, Deserialize)]
struct RelativeDate {
    mode: DateMode,
    #[serde(default)]
    literal: Option<String>,
    #[serde(default)]
    days: Option<i64>,
}

/// A compiled WHERE fragment and its positional parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Translated {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Translated {
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Resolve a filter or sort field to a quoted column and its kind.
///
/// Bound slugs win. `id`, `created_at` and `updated_at` fall through to the
/// bookkeeping columns when no field uses those slugs.
pub fn resolve_field(binding: &CacheTableBinding, field: &str) -> Option<(String, FieldKind)> {
    let table = quote_ident(&binding.local_table_name);
    if let Some(column) = binding.column(field) {
        return Some((
            format!("{}.{}", table, quote_ident(&column.column)),
            column.kind.clone(),
        ));
    }
    let (column, kind) = match field {
        "id" => ("id", FieldKind::Text),
        "created_at" => ("remote_created_at", FieldKind::DateTime),
        "updated_at" => ("remote_updated_at", FieldKind::DateTime),
        _ => return None,
    };
    Some((format!("{}.{}", table, column), kind))
}

/// Compiles [`FilterExpression`]s against a binding.
///
/// `now` anchors relative dates (`today`, `one_week_ago`, ...).
#[derive(Debug, Clone, Copy)]
pub struct FilterTranslator {
    now: i64,
}

type Outcome = Result<String, TranslationError>;

impl FilterTranslator {
    pub fn new(now: i64) -> Self {
        Self { now }
    }

    pub fn translate(
        &self,
        expr: &FilterExpression,
        binding: &CacheTableBinding,
    ) -> Result<Translated, TranslationError> {
        let mut params = Vec::new();
        let mut parts = Vec::with_capacity(expr.clauses.len());

        for clause in &expr.clauses {
            let (column, kind) = resolve_field(binding, &clause.field).ok_or_else(|| {
                TranslationError::UnknownField {
                    source_table_id: binding.source_table_id.clone(),
                    field: clause.field.clone(),
                }
            })?;
            let fragment = self.clause_sql(&column, &kind, clause, &mut params)?;
            parts.push(format!("({})", fragment));
        }

        let joiner = match expr.operator {
            Conjunction::And => " AND ",
            Conjunction::Or => " OR ",
        };

        Ok(Translated {
            sql: parts.join(joiner),
            params,
        })
    }

    fn clause_sql(
        &self,
        col: &str,
        kind: &FieldKind,
        clause: &FilterClause,
        params: &mut Vec<SqlValue>,
    ) -> Outcome {
        match kind.class() {
            KindClass::String => string_sql(col, kind, clause, params),
            KindClass::Numeric => numeric_sql(col, kind, clause, params),
            KindClass::Date => self.date_sql(col, kind, clause, params),
            KindClass::Boolean => boolean_sql(col, kind, clause, params),
            KindClass::Enum => enum_sql(col, kind, clause, params),
            KindClass::Array => array_sql(col, kind, clause, params),
        }
    }

    fn date_sql(
        &self,
        col: &str,
        kind: &FieldKind,
        clause: &FilterClause,
        params: &mut Vec<SqlValue>,
    ) -> Outcome {
        use Comparator::*;

        match clause.comparator {
            IsEmpty => return Ok(format!("{} IS NULL", col)),
            IsNotEmpty => return Ok(format!("{} IS NOT NULL", col)),
            _ => {}
        }

        let start = self.resolve_date(&clause.field, &clause.value)?;
        let end = start
            .checked_add(DAY_SECS)
            .ok_or_else(|| invalid_value(clause, "date out of range"))?;

        let sql = match clause.comparator {
            Is => {
                params.push(SqlValue::Integer(start));
                params.push(SqlValue::Integer(end));
                format!("{c} >= ? AND {c} < ?", c = col)
            }
            IsNot => {
                params.push(SqlValue::Integer(start));
                params.push(SqlValue::Integer(end));
                format!("{c} IS NULL OR {c} < ? OR {c} >= ?", c = col)
            }
            IsBefore | IsLessThan => {
                params.push(SqlValue::Integer(start));
                format!("{} < ?", col)
            }
            IsAfter | IsGreaterThan => {
                params.push(SqlValue::Integer(end));
                format!("{} >= ?", col)
            }
            IsOnOrBefore | IsEqualOrLessThan => {
                params.push(SqlValue::Integer(end));
                format!("{} < ?", col)
            }
            IsOnOrAfter | IsEqualOrGreaterThan => {
                params.push(SqlValue::Integer(start));
                format!("{} >= ?", col)
            }
            _ => return Err(unsupported(clause, kind)),
        };
        Ok(sql)
    }

    /// Resolve a date filter value to the start of its day (UTC, epoch secs).
    pub fn resolve_date(&self, field: &str, value: &Value) -> Result<i64, TranslationError> {
        let invalid = |reason: String| TranslationError::InvalidValue {
            field: field.to_string(),
            reason,
        };

        let ts = match value {
            Value::String(s) => {
                parse_date_str(s).ok_or_else(|| invalid(format!("'{}' is not a date", s)))?
            }
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| invalid(format!("{} is not an epoch timestamp", n)))?,
            Value::Object(_) => {
                let relative: RelativeDate = serde_json::from_value(value.clone())
                    .map_err(|e| invalid(format!("bad relative date: {}", e)))?;
                self.resolve_relative(&relative).map_err(invalid)?
            }
            other => return Err(invalid(format!("expected a date, got {}", other))),
        };

        start_of_day(ts).ok_or_else(|| invalid(format!("{} is out of range", ts)))
    }

    fn resolve_relative(&self, relative: &RelativeDate) -> Result<i64, String> {
        let out_of_range = || "date out of range".to_string();
        let today = start_of_day(self.now).ok_or_else(|| "clock out of range".to_string())?;
        let shift_days = |days: i64| {
            days.checked_mul(DAY_SECS)
                .and_then(|secs| today.checked_add(secs))
                .ok_or_else(out_of_range)
        };
        let shift_months = |months: i32| -> Result<i64, String> {
            let date = DateTime::from_timestamp(today, 0)
                .map(|dt| dt.date_naive())
                .ok_or_else(|| "clock out of range".to_string())?;
            let shifted = if months >= 0 {
                date.checked_add_months(Months::new(months as u32))
            } else {
                date.checked_sub_months(Months::new(months.unsigned_abs()))
            };
            shifted
                .and_then(|d: NaiveDate| d.and_hms_opt(0, 0, 0))
                .map(|ndt| ndt.and_utc().timestamp())
                .ok_or_else(out_of_range)
        };
        let days = || {
            relative
                .days
                .ok_or_else(|| "mode requires 'days'".to_string())
        };

        match relative.mode {
            DateMode::ExactDate => {
                let literal = relative
                    .literal
                    .as_deref()
                    .ok_or_else(|| "exact_date requires 'literal'".to_string())?;
                parse_date_str(literal).ok_or_else(|| format!("'{}' is not a date", literal))
            }
            DateMode::Today => Ok(today),
            DateMode::Yesterday => shift_days(-1),
            DateMode::Tomorrow => shift_days(1),
            DateMode::OneWeekAgo => shift_days(-Duration::weeks(1).num_days()),
            DateMode::OneWeekFromNow => shift_days(Duration::weeks(1).num_days()),
            DateMode::OneMonthAgo => shift_months(-1),
            DateMode::OneMonthFromNow => shift_months(1),
            DateMode::NumberOfDaysAgo => shift_days(days()?.checked_neg().ok_or_else(out_of_range)?),
            DateMode::NumberOfDaysFromNow => shift_days(days()?),
        }
    }
}

fn start_of_day(ts: i64) -> Option<i64> {
    ts.div_euclid(DAY_SECS).checked_mul(DAY_SECS)
}

fn unsupported(clause: &FilterClause, kind: &FieldKind) -> TranslationError {
    TranslationError::UnsupportedComparator {
        field: clause.field.clone(),
        comparator: clause.comparator.as_str().to_string(),
        kind: kind.to_string(),
    }
}

fn invalid_value(clause: &FilterClause, reason: impl Into<String>) -> TranslationError {
    TranslationError::InvalidValue {
        field: clause.field.clone(),
        reason: reason.into(),
    }
}

fn text_value(clause: &FilterClause) -> Result<String, TranslationError> {
    match &clause.value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(invalid_value(clause, format!("expected text, got {}", other))),
    }
}

fn text_list(clause: &FilterClause) -> Result<Vec<String>, TranslationError> {
    match &clause.value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(invalid_value(clause, format!("expected text, got {}", other))),
            })
            .collect(),
        Value::Null => Err(invalid_value(clause, "expected a list of values")),
        _ => Ok(vec![text_value(clause)?]),
    }
}

/// Escape `%`, `_` and `\` for a LIKE pattern using `ESCAPE '\'`.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn string_sql(
    col: &str,
    kind: &FieldKind,
    clause: &FilterClause,
    params: &mut Vec<SqlValue>,
) -> Outcome {
    use Comparator::*;

    let sql = match clause.comparator {
        Is => {
            params.push(SqlValue::Text(text_value(clause)?));
            format!("{} = ?", col)
        }
        IsNot => {
            params.push(SqlValue::Text(text_value(clause)?));
            format!("{c} IS NULL OR {c} <> ?", c = col)
        }
        Contains => {
            params.push(SqlValue::Text(format!("%{}%", escape_like(&text_value(clause)?))));
            format!("{} LIKE ? ESCAPE '\\'", col)
        }
        NotContains => {
            params.push(SqlValue::Text(format!("%{}%", escape_like(&text_value(clause)?))));
            format!("{c} IS NULL OR {c} NOT LIKE ? ESCAPE '\\'", c = col)
        }
        IsEmpty => format!("{c} IS NULL OR {c} = ''", c = col),
        IsNotEmpty => format!("{c} IS NOT NULL AND {c} <> ''", c = col),
        _ => return Err(unsupported(clause, kind)),
    };
    Ok(sql)
}

fn numeric_sql(
    col: &str,
    kind: &FieldKind,
    clause: &FilterClause,
    params: &mut Vec<SqlValue>,
) -> Outcome {
    use Comparator::*;

    let op = match clause.comparator {
        IsEmpty => return Ok(format!("{} IS NULL", col)),
        IsNotEmpty => return Ok(format!("{} IS NOT NULL", col)),
        Is => "=",
        IsNot => "<>",
        IsGreaterThan => ">",
        IsLessThan => "<",
        IsEqualOrGreaterThan => ">=",
        IsEqualOrLessThan => "<=",
        _ => return Err(unsupported(clause, kind)),
    };

    let number = match &clause.value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid_value(clause, format!("expected a number, got {}", clause.value)))?;

    params.push(SqlValue::Real(number));
    if clause.comparator == IsNot {
        Ok(format!("{c} IS NULL OR CAST({c} AS REAL) <> ?", c = col))
    } else {
        Ok(format!("CAST({} AS REAL) {} ?", col, op))
    }
}

fn boolean_sql(
    col: &str,
    kind: &FieldKind,
    clause: &FilterClause,
    params: &mut Vec<SqlValue>,
) -> Outcome {
    use Comparator::*;

    let flag = || -> Result<i64, TranslationError> {
        match &clause.value {
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
                Ok(n.as_i64().unwrap_or_default())
            }
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(1),
                "false" | "no" | "0" => Ok(0),
                _ => Err(invalid_value(clause, format!("'{}' is not a boolean", s))),
            },
            other => Err(invalid_value(clause, format!("expected a boolean, got {}", other))),
        }
    };

    let sql = match clause.comparator {
        Is => {
            params.push(SqlValue::Integer(flag()?));
            format!("{} = ?", col)
        }
        IsNot => {
            params.push(SqlValue::Integer(flag()?));
            format!("{c} IS NULL OR {c} <> ?", c = col)
        }
        IsEmpty => format!("{} IS NULL", col),
        IsNotEmpty => format!("{} IS NOT NULL", col),
        _ => return Err(unsupported(clause, kind)),
    };
    Ok(sql)
}

fn enum_sql(
    col: &str,
    kind: &FieldKind,
    clause: &FilterClause,
    params: &mut Vec<SqlValue>,
) -> Outcome {
    use Comparator::*;

    let sql = match clause.comparator {
        Is => {
            params.push(SqlValue::Text(text_value(clause)?));
            format!("{} = ?", col)
        }
        IsNot => {
            params.push(SqlValue::Text(text_value(clause)?));
            format!("{c} IS NULL OR {c} <> ?", c = col)
        }
        IsAnyOf => {
            let values = text_list(clause)?;
            if values.is_empty() {
                return Ok("0".to_string());
            }
            let sql = format!("{} IN ({})", col, placeholders(values.len()));
            params.extend(values.into_iter().map(SqlValue::Text));
            sql
        }
        IsNoneOf => {
            let values = text_list(clause)?;
            if values.is_empty() {
                return Ok("1".to_string());
            }
            let sql = format!(
                "{c} IS NULL OR {c} NOT IN ({p})",
                c = col,
                p = placeholders(values.len())
            );
            params.extend(values.into_iter().map(SqlValue::Text));
            sql
        }
        IsEmpty => format!("{c} IS NULL OR {c} = ''", c = col),
        IsNotEmpty => format!("{c} IS NOT NULL AND {c} <> ''", c = col),
        _ => return Err(unsupported(clause, kind)),
    };
    Ok(sql)
}

/// Element expression over `json_each(...) AS je`. Object elements (linked
/// records, users, attachments) compare on their `id`.
const ARRAY_ELEMENT: &str =
    "CASE WHEN je.type = 'object' THEN json_extract(je.value, '$.id') ELSE je.value END";

fn needle(clause: &FilterClause, item: &Value) -> Result<SqlValue, TranslationError> {
    match item {
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Number(n) => Ok(match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        }),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Object(map) => match map.get("id") {
            Some(id) if !id.is_object() && !id.is_array() => needle(clause, id),
            _ => Err(invalid_value(clause, "object values need a scalar 'id'")),
        },
        other => Err(invalid_value(clause, format!("cannot match array elements against {}", other))),
    }
}

fn needles(clause: &FilterClause) -> Result<Vec<SqlValue>, TranslationError> {
    let raw = match &clause.value {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        Value::Null => return Err(invalid_value(clause, "expected a value or a list of values")),
        single => vec![single],
    };

    let mut out: Vec<SqlValue> = Vec::with_capacity(raw.len());
    for item in raw {
        let value = needle(clause, item)?;
        if !out.contains(&value) {
            out.push(value);
        }
    }
    Ok(out)
}

fn array_sql(
    col: &str,
    kind: &FieldKind,
    clause: &FilterClause,
    params: &mut Vec<SqlValue>,
) -> Outcome {
    use Comparator::*;

    let empty = format!("{c} IS NULL OR json_array_length({c}) = 0", c = col);

    let sql = match clause.comparator {
        IsEmpty => empty,
        IsNotEmpty => format!("{c} IS NOT NULL AND json_array_length({c}) > 0", c = col),
        HasAnyOf | Contains => {
            let values = needles(clause)?;
            if values.is_empty() {
                return Ok("0".to_string());
            }
            let sql = format!(
                "EXISTS (SELECT 1 FROM json_each({}) AS je WHERE {} IN ({}))",
                col,
                ARRAY_ELEMENT,
                placeholders(values.len())
            );
            params.extend(values);
            sql
        }
        HasNoneOf | NotContains => {
            let values = needles(clause)?;
            if values.is_empty() {
                return Ok("1".to_string());
            }
            let sql = format!(
                "NOT EXISTS (SELECT 1 FROM json_each({}) AS je WHERE {} IN ({}))",
                col,
                ARRAY_ELEMENT,
                placeholders(values.len())
            );
            params.extend(values);
            sql
        }
        HasAllOf => {
            let values = needles(clause)?;
            if values.is_empty() {
                return Ok("1".to_string());
            }
            let sql = has_all_sql(col, values.len());
            params.extend(values);
            sql
        }
        IsExactly => {
            let values = needles(clause)?;
            if values.is_empty() {
                return Ok(empty);
            }
            let sql = format!(
                "{} AND NOT EXISTS (SELECT 1 FROM json_each({}) AS je WHERE {} NOT IN ({}))",
                has_all_sql(col, values.len()),
                col,
                ARRAY_ELEMENT,
                placeholders(values.len())
            );
            params.extend(values.iter().cloned());
            params.extend(values);
            sql
        }
        _ => return Err(unsupported(clause, kind)),
    };
    Ok(sql)
}

fn has_all_sql(col: &str, n: usize) -> String {
    format!(
        "(SELECT COUNT(DISTINCT {e}) FROM json_each({c}) AS je WHERE {e} IN ({p})) = {n}",
        e = ARRAY_ELEMENT,
        c = col,
        p = placeholders(n),
        n = n
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnBinding;
    use serde_json::json;

    fn binding() -> CacheTableBinding {
        let col = |slug: &str, column: &str, kind: FieldKind| ColumnBinding {
            slug: slug.to_string(),
            column: column.to_string(),
            kind,
        };
        CacheTableBinding {
            source_table_id: "tbl1".to_string(),
            local_table_name: "src_deals_tbl1".to_string(),
            display_name: "Deals".to_string(),
            columns: vec![
                col("name", "name", FieldKind::Text),
                col("status", "status", FieldKind::Status),
                col("due", "due", FieldKind::Date),
                col("revenue", "revenue", FieldKind::Currency),
                col("done", "done", FieldKind::Boolean),
                col("tags", "tags", FieldKind::MultipleSelect),
            ],
            schema_fingerprint: String::new(),
            created_at: 0,
            last_synced_at: None,
        }
    }

    fn translate(expr: FilterExpression) -> Result<Translated, TranslationError> {
        // 1970-01-11 12:00:00 UTC
        FilterTranslator::new(10 * DAY_SECS + 43_200).translate(&expr, &binding())
    }

    #[test]
    fn test_deserialize_expression() {
        let expr: FilterExpression = serde_json::from_value(json!({
            "operator": "or",
            "clauses": [
                { "field": "status", "comparator": "is_any_of", "value": ["A", "B"] },
                { "field": "done", "comparator": "is_empty" }
            ]
        }))
        .unwrap();
        assert_eq!(expr.operator, Conjunction::Or);
        assert_eq!(expr.clauses[0].comparator, Comparator::IsAnyOf);
        assert_eq!(expr.clauses[1].value, Value::Null);
    }

    #[test]
    fn test_empty_expression_compiles_to_nothing() {
        let t = translate(FilterExpression::default()).unwrap();
        assert!(t.is_empty());
        assert!(t.params.is_empty());
    }

    #[test]
    fn test_clauses_are_parenthesized_and_joined() {
        let t = translate(FilterExpression::or(vec![
            FilterClause::new("status", Comparator::Is, json!("Active")),
            FilterClause::new("revenue", Comparator::IsGreaterThan, json!(50)),
        ]))
        .unwrap();
        assert_eq!(
            t.sql,
            "(\"src_deals_tbl1\".\"status\" = ?) OR (CAST(\"src_deals_tbl1\".\"revenue\" AS REAL) > ?)"
        );
        assert_eq!(
            t.params,
            vec![SqlValue::Text("Active".into()), SqlValue::Real(50.0)]
        );
    }

    #[test]
    fn test_contains_escapes_like_wildcards() {
        let t = translate(FilterExpression::and(vec![FilterClause::new(
            "name",
            Comparator::Contains,
            json!("50%_off\\"),
        )]))
        .unwrap();
        assert!(t.sql.contains("LIKE ? ESCAPE '\\'"));
        assert_eq!(t.params, vec![SqlValue::Text("%50\\%\\_off\\\\%".into())]);
    }

    #[test]
    fn test_relative_dates_resolve_to_start_of_day() {
        let translator = FilterTranslator::new(10 * DAY_SECS + 43_200);
        let today = translator.resolve_date("due", &json!({"mode": "today"})).unwrap();
        assert_eq!(today, 10 * DAY_SECS);
        let yesterday = translator
            .resolve_date("due", &json!({"mode": "yesterday"}))
            .unwrap();
        assert_eq!(yesterday, 9 * DAY_SECS);
        let ago = translator
            .resolve_date("due", &json!({"mode": "number_of_days_ago", "days": 3}))
            .unwrap();
        assert_eq!(ago, 7 * DAY_SECS);
        let exact = translator
            .resolve_date("due", &json!({"mode": "exact_date", "literal": "1970-01-03T18:00:00Z"}))
            .unwrap();
        assert_eq!(exact, 2 * DAY_SECS);
        let month = translator
            .resolve_date("due", &json!({"mode": "one_month_from_now"}))
            .unwrap();
        assert_eq!(month, (10 + 31) * DAY_SECS);
    }

    #[test]
    fn test_out_of_range_dates_are_rejected() {
        let translator = FilterTranslator::new(10 * DAY_SECS + 43_200);
        for value in [
            json!({"mode": "number_of_days_ago", "days": 200_000_000_000_000i64}),
            json!({"mode": "number_of_days_from_now", "days": i64::MAX}),
            json!({"mode": "number_of_days_ago", "days": i64::MIN}),
            json!(i64::MIN),
        ] {
            assert!(
                matches!(
                    translator.resolve_date("due", &value),
                    Err(TranslationError::InvalidValue { .. })
                ),
                "{} should be rejected",
                value
            );
        }

        let err = translate(FilterExpression::and(vec![FilterClause::new(
            "due",
            Comparator::Is,
            json!(i64::MAX),
        )]))
        .unwrap_err();
        assert!(matches!(err, TranslationError::InvalidValue { .. }));
    }

    #[test]
    fn test_uppercase_operator_and_long_field_names() {
        let expr: FilterExpression = serde_json::from_value(json!({
            "top_operator": "OR",
            "clauses": [
                { "field_slug": "status", "comparator": "is", "value": "A" },
                { "field": "done", "comparator": "is_empty" }
            ]
        }))
        .unwrap();
        assert_eq!(expr.operator, Conjunction::Or);
        assert_eq!(expr.clauses[0].field, "status");

        let and: FilterExpression =
            serde_json::from_value(json!({"operator": "AND", "clauses": []})).unwrap();
        assert_eq!(and.operator, Conjunction::And);
    }

    #[test]
    fn test_date_is_covers_whole_day() {
        let t = translate(FilterExpression::and(vec![FilterClause::new(
            "due",
            Comparator::Is,
            json!("1970-01-02"),
        )]))
        .unwrap();
        assert_eq!(
            t.params,
            vec![SqlValue::Integer(DAY_SECS), SqlValue::Integer(2 * DAY_SECS)]
        );
    }

    #[test]
    fn test_empty_lists() {
        let t = translate(FilterExpression::and(vec![
            FilterClause::new("status", Comparator::IsAnyOf, json!([])),
            FilterClause::new("status", Comparator::IsNoneOf, json!([])),
        ]))
        .unwrap();
        assert_eq!(t.sql, "(0) AND (1)");
    }

    #[test]
    fn test_array_has_all_counts_distinct_needles() {
        let t = translate(FilterExpression::and(vec![FilterClause::new(
            "tags",
            Comparator::HasAllOf,
            json!(["a", "b", "a"]),
        )]))
        .unwrap();
        assert!(t.sql.ends_with("= 2)"));
        assert_eq!(t.params.len(), 2);
    }

    #[test]
    fn test_rejections() {
        let err = translate(FilterExpression::and(vec![FilterClause::new(
            "nope",
            Comparator::Is,
            json!(1),
        )]))
        .unwrap_err();
        assert!(matches!(err, TranslationError::UnknownField { .. }));

        let err = translate(FilterExpression::and(vec![FilterClause::new(
            "done",
            Comparator::Contains,
            json!(true),
        )]))
        .unwrap_err();
        assert_eq!(
            err,
            TranslationError::UnsupportedComparator {
                field: "done".into(),
                comparator: "contains".into(),
                kind: "boolean".into(),
            }
        );

        let err = translate(FilterExpression::and(vec![FilterClause::new(
            "revenue",
            Comparator::Is,
            json!("lots"),
        )]))
        .unwrap_err();
        assert!(matches!(err, TranslationError::InvalidValue { .. }));
    }

    #[test]
    fn test_bookkeeping_pseudo_fields() {
        let b = binding();
        let (col, kind) = resolve_field(&b, "created_at").unwrap();
        assert_eq!(col, "\"src_deals_tbl1\".remote_created_at");
        assert_eq!(kind, FieldKind::DateTime);
        assert!(resolve_field(&b, "missing").is_none());
    }
}
