//! Warehouse column types and their mapping to Arrow.

use std::fmt;
use std::sync::Arc;

use datafusion::arrow::datatypes::{DataType, Field, Fields, Schema, TimeUnit};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::sql::quote_identifier;
use crate::error::{BigqueryError, Result};

/// Precision/scale BigQuery uses for NUMERIC.
pub const NUMERIC_PRECISION: u8 = 38;
pub const NUMERIC_SCALE: i8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Bool,
    Int64,
    Float64,
    Numeric,
    BigNumeric,
    String,
    Bytes,
    Date,
    Datetime,
    Time,
    Timestamp,
    Geography,
    Json,
    Interval,
    Record,
}

impl FieldType {
    /// Parse a type name, accepting legacy and SQL aliases. Case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_uppercase();
        let ty = match upper.as_str() {
            "BOOL" | "BOOLEAN" => FieldType::Bool,
            "INT64" | "INT" | "SMALLINT" | "INTEGER" | "BIGINT" | "TINYINT" | "BYTEINT" => {
                FieldType::Int64
            }
            "FLOAT" | "FLOAT64" => FieldType::Float64,
            "NUMERIC" | "DECIMAL" => FieldType::Numeric,
            "BIGNUMERIC" | "BIGDECIMAL" => FieldType::BigNumeric,
            "STRING" => FieldType::String,
            "BYTES" => FieldType::Bytes,
            "DATE" => FieldType::Date,
            "DATETIME" => FieldType::Datetime,
            "TIME" => FieldType::Time,
            "TIMESTAMP" => FieldType::Timestamp,
            "GEOGRAPHY" => FieldType::Geography,
            "JSON" => FieldType::Json,
            "INTERVAL" => FieldType::Interval,
            "STRUCT" | "RECORD" => FieldType::Record,
            _ => return None,
        };
        Some(ty)
    }

    /// Canonical GoogleSQL spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Bool => "BOOL",
            FieldType::Int64 => "INT64",
            FieldType::Float64 => "FLOAT64",
            FieldType::Numeric => "NUMERIC",
            FieldType::BigNumeric => "BIGNUMERIC",
            FieldType::String => "STRING",
            FieldType::Bytes => "BYTES",
            FieldType::Date => "DATE",
            FieldType::Datetime => "DATETIME",
            FieldType::Time => "TIME",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Geography => "GEOGRAPHY",
            FieldType::Json => "JSON",
            FieldType::Interval => "INTERVAL",
            FieldType::Record => "STRUCT",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

impl FieldMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "NULLABLE" => Some(FieldMode::Nullable),
            "REQUIRED" => Some(FieldMode::Required),
            "REPEATED" => Some(FieldMode::Repeated),
            _ => None,
        }
    }
}

/// One column of a warehouse table schema, possibly nested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFieldSchema {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    /// Sub-fields; only set for RECORD
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<TableFieldSchema>,
}

impl TableFieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
            fields: Vec::new(),
        }
    }

    pub fn record(name: impl Into<String>, fields: Vec<TableFieldSchema>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Record,
            mode: FieldMode::Nullable,
            fields,
        }
    }

    pub fn with_mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_repeated(&self) -> bool {
        self.mode == FieldMode::Repeated
    }

    /// Arrow type of a single (non-repeated) value of this field
    pub fn value_type(&self) -> DataType {
        match self.field_type {
            FieldType::Bool => DataType::Boolean,
            FieldType::Int64 => DataType::Int64,
            FieldType::Float64 => DataType::Float64,
            FieldType::Numeric => DataType::Decimal128(NUMERIC_PRECISION, NUMERIC_SCALE),
            FieldType::BigNumeric => DataType::Utf8,
            FieldType::String => DataType::Utf8,
            FieldType::Bytes => DataType::Binary,
            FieldType::Date => DataType::Date32,
            FieldType::Datetime => DataType::Timestamp(TimeUnit::Microsecond, None),
            FieldType::Time => DataType::Time64(TimeUnit::Microsecond),
            FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            FieldType::Geography => DataType::Utf8,
            FieldType::Json => DataType::Utf8,
            FieldType::Interval => DataType::Utf8,
            FieldType::Record => DataType::Struct(Fields::from(
                self.fields
                    .iter()
                    .map(TableFieldSchema::to_arrow_field)
                    .collect::<Vec<_>>(),
            )),
        }
    }

    /// Arrow type of the column, wrapping repeated fields in a list
    pub fn arrow_type(&self) -> DataType {
        let value = self.value_type();
        if self.is_repeated() {
            DataType::List(Arc::new(Field::new_list_field(value, true)))
        } else {
            value
        }
    }

    pub fn to_arrow_field(&self) -> Field {
        Field::new(
            &self.name,
            self.arrow_type(),
            self.mode != FieldMode::Required,
        )
    }

    /// Translate a host column into a warehouse column.
    pub fn from_arrow_field(field: &Field) -> Result<Self> {
        let (field_type, mode, fields) = match field.data_type() {
            DataType::List(inner)
            | DataType::LargeList(inner)
            | DataType::FixedSizeList(inner, _) => {
                let element = Self::from_arrow_field(&Field::new(
                    field.name(),
                    inner.data_type().clone(),
                    true,
                ))?;
                if element.is_repeated() {
                    return Err(BigqueryError::UnsupportedType(format!(
                        "column '{}': nested lists are not supported",
                        field.name()
                    )));
                }
                (element.field_type, FieldMode::Repeated, element.fields)
            }
            DataType::Struct(children) => {
                let fields = children
                    .iter()
                    .map(|c| Self::from_arrow_field(c))
                    .collect::<Result<Vec<_>>>()?;
                (FieldType::Record, required_or_nullable(field), fields)
            }
            other => (
                arrow_to_field_type(other).ok_or_else(|| {
                    BigqueryError::UnsupportedType(format!(
                        "column '{}' has type {} with no BigQuery counterpart",
                        field.name(),
                        other
                    ))
                })?,
                required_or_nullable(field),
                Vec::new(),
            ),
        };
        Ok(Self {
            name: field.name().clone(),
            field_type,
            mode,
            fields,
        })
    }

    /// Type clause for DDL, e.g. `ARRAY<STRUCT<a INT64>>`
    pub fn ddl_type(&self) -> String {
        let base = match self.field_type {
            FieldType::Record => {
                let inner = self
                    .fields
                    .iter()
                    .map(TableFieldSchema::ddl_column)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("STRUCT<{inner}>")
            }
            other => other.as_str().to_string(),
        };
        if self.is_repeated() {
            format!("ARRAY<{base}>")
        } else {
            base
        }
    }

    /// Column definition for DDL: quoted name, type and nullability
    pub fn ddl_column(&self) -> String {
        let mut spec = format!("{} {}", quote_identifier(&self.name), self.ddl_type());
        if self.mode == FieldMode::Required {
            spec.push_str(" NOT NULL");
        }
        spec
    }
}

fn required_or_nullable(field: &Field) -> FieldMode {
    if field.is_nullable() {
        FieldMode::Nullable
    } else {
        FieldMode::Required
    }
}

/// Scalar Arrow type to warehouse type. Nested types are handled by the caller.
pub fn arrow_to_field_type(data_type: &DataType) -> Option<FieldType> {
    let ty = match data_type {
        DataType::Boolean => FieldType::Bool,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => FieldType::Int64,
        DataType::UInt64 => FieldType::Numeric,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => FieldType::Float64,
        DataType::Decimal128(p, s) => {
            let integer_digits = *p as i16 - *s as i16;
            if *s >= 0 && *s <= NUMERIC_SCALE && integer_digits <= 29 {
                FieldType::Numeric
            } else {
                FieldType::BigNumeric
            }
        }
        DataType::Decimal256(_, _) => FieldType::BigNumeric,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => FieldType::String,
        DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_) => FieldType::Bytes,
        DataType::Date32 | DataType::Date64 => FieldType::Date,
        DataType::Timestamp(_, None) => FieldType::Datetime,
        DataType::Timestamp(_, Some(_)) => FieldType::Timestamp,
        DataType::Time32(_) | DataType::Time64(_) => FieldType::Time,
        DataType::Interval(_) => FieldType::Interval,
        _ => return None,
    };
    Some(ty)
}

pub fn fields_to_schema(fields: &[TableFieldSchema]) -> Schema {
    Schema::new(
        fields
            .iter()
            .map(TableFieldSchema::to_arrow_field)
            .collect::<Vec<_>>(),
    )
}

pub fn schema_to_fields(schema: &Schema) -> Result<Vec<TableFieldSchema>> {
    schema
        .fields()
        .iter()
        .map(|f| TableFieldSchema::from_arrow_field(f))
        .collect()
}

/// Convert an INFORMATION_SCHEMA `data_type` string to a column.
///
/// Handles parameterised (`NUMERIC(10,2)`) and nested
/// (`ARRAY<STRUCT<a INT64, b STRING>>`) spellings. Unknown base types fall back
/// to STRING.
pub fn parse_column_type(name: &str, data_type: &str, nullable: bool) -> Result<TableFieldSchema> {
    let mut column = parse_type_expr(name, data_type)?;
    if !nullable && !column.is_repeated() {
        column.mode = FieldMode::Required;
    }
    Ok(column)
}

fn parse_type_expr(name: &str, expr: &str) -> Result<TableFieldSchema> {
    let expr = expr.trim();

    if let Some(inner) = strip_wrapper(expr, "ARRAY") {
        let element = parse_type_expr(name, inner)?;
        if element.is_repeated() {
            return Err(BigqueryError::UnsupportedType(format!(
                "column '{name}': ARRAY of ARRAY is not a valid type"
            )));
        }
        return Ok(element.with_mode(FieldMode::Repeated));
    }

    if let Some(inner) = strip_wrapper(expr, "STRUCT") {
        let mut fields = Vec::new();
        for member in split_top_level(inner) {
            let member = member.trim();
            if member.is_empty() {
                continue;
            }
            let (member_name, rest) = split_member(member).ok_or_else(|| {
                BigqueryError::Decode(format!("malformed STRUCT member '{member}' in '{expr}'"))
            })?;
            let (rest, required) = strip_not_null(rest);
            let mut field = parse_type_expr(&member_name, rest)?;
            if required && !field.is_repeated() {
                field.mode = FieldMode::Required;
            }
            fields.push(field);
        }
        return Ok(TableFieldSchema::record(name, fields));
    }

    let base = expr.split('(').next().unwrap_or(expr).trim();
    let base = base.split('<').next().unwrap_or(base).trim();
    let field_type = match FieldType::from_name(base) {
        Some(t) => t,
        None => {
            warn!(column = name, data_type = expr, "Unknown BigQuery type, reading as STRING");
            FieldType::String
        }
    };
    Ok(TableFieldSchema::new(name, field_type))
}

/// `KEYWORD<...>` -> `...`, case-insensitively
fn strip_wrapper<'a>(expr: &'a str, keyword: &str) -> Option<&'a str> {
    let head = expr.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = expr[keyword.len()..].trim_start();
    rest.strip_prefix('<')?.strip_suffix('>')
}

/// Split on commas that are not nested inside `<>` or `()`.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '<' | '(' => depth += 1,
            '>' | ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// `name TYPE` or `` `na me` TYPE `` -> (name, TYPE)
fn split_member(member: &str) -> Option<(String, &str)> {
    if let Some(rest) = member.strip_prefix('`') {
        let end = rest.find('`')?;
        return Some((rest[..end].to_string(), rest[end + 1..].trim_start()));
    }
    let end = member.find(char::is_whitespace)?;
    Some((member[..end].to_string(), member[end..].trim_start()))
}

fn strip_not_null(s: &str) -> (&str, bool) {
    let trimmed = s.trim_end();
    let upper = trimmed.to_uppercase();
    if upper.ends_with("NOT NULL") {
        (trimmed[..trimmed.len() - "NOT NULL".len()].trim_end(), true)
    } else {
        (trimmed, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrow(data_type: &str) -> DataType {
        parse_column_type("c", data_type, true).unwrap().arrow_type()
    }

    #[test]
    fn test_bigquery_type_aliases() {
        assert!(matches!(arrow("BOOLEAN"), DataType::Boolean));
        assert!(matches!(arrow("bool"), DataType::Boolean));
        assert!(matches!(arrow("INTEGER"), DataType::Int64));
        assert!(matches!(arrow("BYTEINT"), DataType::Int64));
        assert!(matches!(arrow("FLOAT"), DataType::Float64));
        assert!(matches!(arrow("BIGDECIMAL"), DataType::Utf8));
    }

    #[test]
    fn test_bigquery_type_numeric() {
        assert_eq!(arrow("NUMERIC"), DataType::Decimal128(38, 9));
        assert_eq!(arrow("NUMERIC(10,2)"), DataType::Decimal128(38, 9));
        assert_eq!(arrow("STRING(100)"), DataType::Utf8);
    }

    #[test]
    fn test_bigquery_type_temporal() {
        assert_eq!(arrow("DATE"), DataType::Date32);
        assert_eq!(arrow("TIME"), DataType::Time64(TimeUnit::Microsecond));
        match arrow("DATETIME") {
            DataType::Timestamp(unit, tz) => {
                assert!(matches!(unit, TimeUnit::Microsecond));
                assert!(tz.is_none());
            }
            other => panic!("Expected Timestamp without tz, got {:?}", other),
        }
        match arrow("Timestamp") {
            DataType::Timestamp(unit, tz) => {
                assert!(matches!(unit, TimeUnit::Microsecond));
                assert_eq!(tz.as_deref(), Some("UTC"));
            }
            other => panic!("Expected Timestamp with UTC, got {:?}", other),
        }
    }

    #[test]
    fn test_bigquery_type_array() {
        let column = parse_column_type("tags", "ARRAY<STRING>", false).unwrap();
        assert_eq!(column.mode, FieldMode::Repeated);
        match column.arrow_type() {
            DataType::List(item) => assert_eq!(item.data_type(), &DataType::Utf8),
            other => panic!("Expected List, got {:?}", other),
        }
        // repeated columns are never marked REQUIRED
        assert!(column.to_arrow_field().is_nullable());
    }

    #[test]
    fn test_bigquery_type_nested_struct() {
        let column = parse_column_type(
            "payload",
            "ARRAY<STRUCT<id INT64 NOT NULL, `the name` STRING, inner STRUCT<x FLOAT64>>>",
            true,
        )
        .unwrap();
        assert_eq!(column.mode, FieldMode::Repeated);
        assert_eq!(column.field_type, FieldType::Record);
        assert_eq!(column.fields.len(), 3);
        assert_eq!(column.fields[0].mode, FieldMode::Required);
        assert_eq!(column.fields[1].name, "the name");
        assert_eq!(column.fields[2].fields[0].field_type, FieldType::Float64);
    }

    #[test]
    fn test_bigquery_type_array_of_array_rejected() {
        assert!(parse_column_type("c", "ARRAY<ARRAY<INT64>>", true).is_err());
    }

    #[test]
    fn test_bigquery_type_unknown_fallback() {
        assert!(matches!(arrow("UNKNOWN_TYPE"), DataType::Utf8));
        assert!(matches!(arrow("RANGE<DATE>"), DataType::Utf8));
    }

    #[test]
    fn test_arrow_to_bigquery_fields() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("amount", DataType::Decimal128(10, 2), true),
            Field::new("huge", DataType::Decimal128(60, 20), true),
            Field::new(
                "tags",
                DataType::List(Arc::new(Field::new_list_field(DataType::Utf8, true))),
                true,
            ),
            Field::new("at", DataType::Timestamp(TimeUnit::Nanosecond, None), true),
        ]);
        let fields = schema_to_fields(&schema).unwrap();
        assert_eq!(fields[0].field_type, FieldType::Int64);
        assert_eq!(fields[0].mode, FieldMode::Required);
        assert_eq!(fields[1].field_type, FieldType::Numeric);
        assert_eq!(fields[2].field_type, FieldType::BigNumeric);
        assert_eq!(fields[3].mode, FieldMode::Repeated);
        assert_eq!(fields[4].field_type, FieldType::Datetime);
        assert_eq!(fields[0].ddl_column(), "`id` INT64 NOT NULL");
        assert_eq!(fields[3].ddl_column(), "`tags` ARRAY<STRING>");
    }

    #[test]
    fn test_unsupported_arrow_type() {
        let field = Field::new("m", DataType::Null, true);
        let err = TableFieldSchema::from_arrow_field(&field).unwrap_err();
        assert!(matches!(err, BigqueryError::UnsupportedType(_)));
    }
}
