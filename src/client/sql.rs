//! GoogleSQL text rendering: identifiers and literals.

use base64::Engine;
use datafusion::arrow::array::Array;
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::common::ScalarValue;

use super::api::{DatasetName, DatasetResource, TableKind, TableName, TableResource};
use super::types::TableFieldSchema;
use crate::error::{BigqueryError, Result};

/// Backtick-quote an identifier, escaping embedded backticks and backslashes.
pub fn quote_identifier(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('`');
    for ch in identifier.chars() {
        match ch {
            '`' => quoted.push_str("\\`"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('`');
    quoted
}

pub fn quote_dataset(dataset: &DatasetName) -> String {
    format!(
        "{}.{}",
        quote_identifier(&dataset.project_id),
        quote_identifier(&dataset.dataset_id)
    )
}

pub fn quote_table(table: &TableName) -> String {
    format!(
        "{}.{}.{}",
        quote_identifier(&table.project_id),
        quote_identifier(&table.dataset_id),
        quote_identifier(&table.table_id)
    )
}

/// Single-quoted string literal
pub fn quote_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => quoted.push_str("\\'"),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}

/// `CREATE SCHEMA` for a dataset resource
pub fn create_schema_ddl(dataset: &DatasetResource) -> String {
    let mut sql = format!("CREATE SCHEMA {}", quote_dataset(&dataset.name));
    if let Some(location) = &dataset.location {
        sql.push_str(&format!(" OPTIONS(location={})", quote_string(location)));
    }
    sql
}

pub fn drop_schema_ddl(dataset: &DatasetName, cascade: bool) -> String {
    let behavior = if cascade { "CASCADE" } else { "RESTRICT" };
    format!("DROP SCHEMA {} {behavior}", quote_dataset(dataset))
}

/// `CREATE TABLE` or `CREATE VIEW` for a table resource.
///
/// Primary keys are emitted as `NOT ENFORCED`, the only form the warehouse accepts.
pub fn create_table_ddl(table: &TableResource) -> Result<String> {
    match table.kind {
        TableKind::View => {
            let query = table.view_query.as_deref().ok_or_else(|| {
                BigqueryError::InvalidRequest(format!("view {} has no query", table.name))
            })?;
            Ok(format!("CREATE VIEW {} AS {query}", quote_table(&table.name)))
        }
        TableKind::Table => {
            let mut elements: Vec<String> =
                table.fields.iter().map(TableFieldSchema::ddl_column).collect();
            if !table.primary_key.is_empty() {
                let keys: Vec<String> = table
                    .primary_key
                    .iter()
                    .map(|k| quote_identifier(k))
                    .collect();
                elements.push(format!("PRIMARY KEY ({}) NOT ENFORCED", keys.join(", ")));
            }
            Ok(format!(
                "CREATE TABLE {} ({})",
                quote_table(&table.name),
                elements.join(", ")
            ))
        }
    }
}

pub fn drop_table_ddl(table: &TableName, kind: TableKind) -> String {
    let object = match kind {
        TableKind::Table => "TABLE",
        TableKind::View => "VIEW",
    };
    format!("DROP {object} {}", quote_table(table))
}

/// `SELECT` feeding a read session. An empty projection still yields one row per table row.
pub fn select_sql(table: &TableName, columns: &[String], row_restriction: Option<&str>) -> String {
    let projection = if columns.is_empty() {
        "1".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut sql = format!("SELECT {projection} FROM {}", quote_table(table));
    if let Some(predicate) = row_restriction {
        sql.push_str(&format!(" WHERE {predicate}"));
    }
    sql
}

/// Render a value as a GoogleSQL literal. `None` when the type has no literal form.
pub fn render_literal(value: &ScalarValue) -> Option<String> {
    if value.is_null() {
        return Some("NULL".to_string());
    }
    let rendered = match value {
        ScalarValue::Boolean(Some(b)) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        ScalarValue::Int8(Some(v)) => v.to_string(),
        ScalarValue::Int16(Some(v)) => v.to_string(),
        ScalarValue::Int32(Some(v)) => v.to_string(),
        ScalarValue::Int64(Some(v)) => v.to_string(),
        ScalarValue::UInt8(Some(v)) => v.to_string(),
        ScalarValue::UInt16(Some(v)) => v.to_string(),
        ScalarValue::UInt32(Some(v)) => v.to_string(),
        ScalarValue::UInt64(Some(v)) => format!("NUMERIC '{v}'"),
        ScalarValue::Float32(Some(v)) => render_float(*v as f64),
        ScalarValue::Float64(Some(v)) => render_float(*v),
        ScalarValue::Decimal128(Some(_), p, s) => {
            let text = as_text(value)?;
            let integer_digits = *p as i16 - *s as i16;
            if *s <= 9 && integer_digits <= 29 {
                format!("NUMERIC '{text}'")
            } else {
                format!("BIGNUMERIC '{text}'")
            }
        }
        ScalarValue::Utf8(Some(s))
        | ScalarValue::LargeUtf8(Some(s))
        | ScalarValue::Utf8View(Some(s)) => quote_string(s),
        ScalarValue::Binary(Some(b))
        | ScalarValue::LargeBinary(Some(b))
        | ScalarValue::BinaryView(Some(b)) => format!(
            "FROM_BASE64('{}')",
            base64::engine::general_purpose::STANDARD.encode(b)
        ),
        ScalarValue::Date32(Some(_)) | ScalarValue::Date64(Some(_)) => {
            format!("DATE '{}'", as_text(&value.cast_to(&DataType::Date32).ok()?)?)
        }
        ScalarValue::TimestampSecond(Some(_), tz)
        | ScalarValue::TimestampMillisecond(Some(_), tz)
        | ScalarValue::TimestampMicrosecond(Some(_), tz)
        | ScalarValue::TimestampNanosecond(Some(_), tz) => {
            let micros = match value
                .cast_to(&DataType::Timestamp(TimeUnit::Microsecond, tz.clone()))
                .ok()?
            {
                ScalarValue::TimestampMicrosecond(Some(m), _) => m,
                _ => return None,
            };
            if tz.is_some() {
                format!("TIMESTAMP_MICROS({micros})")
            } else {
                format!("DATETIME(TIMESTAMP_MICROS({micros}))")
            }
        }
        ScalarValue::Time32Second(Some(_))
        | ScalarValue::Time32Millisecond(Some(_))
        | ScalarValue::Time64Microsecond(Some(_))
        | ScalarValue::Time64Nanosecond(Some(_)) => {
            format!("TIME {}", quote_string(&as_text(value)?))
        }
        ScalarValue::List(arr) => render_array(arr.value(0))?,
        ScalarValue::LargeList(arr) => render_array(arr.value(0))?,
        ScalarValue::FixedSizeList(arr) => render_array(arr.value(0))?,
        ScalarValue::Struct(arr) => {
            let mut members = Vec::with_capacity(arr.num_columns());
            for (i, field) in arr.fields().iter().enumerate() {
                let child = ScalarValue::try_from_array(arr.column(i), 0).ok()?;
                members.push(format!(
                    "{} AS {}",
                    render_literal(&child)?,
                    quote_identifier(field.name())
                ));
            }
            format!("STRUCT({})", members.join(", "))
        }
        _ => return None,
    };
    Some(rendered)
}

fn render_float(v: f64) -> String {
    if v.is_nan() {
        "CAST('NaN' AS FLOAT64)".to_string()
    } else if v.is_infinite() {
        let sign = if v > 0.0 { "" } else { "-" };
        format!("CAST('{sign}inf' AS FLOAT64)")
    } else {
        format!("{v:?}")
    }
}

fn render_array(values: datafusion::arrow::array::ArrayRef) -> Option<String> {
    let mut items = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let item = ScalarValue::try_from_array(&values, i).ok()?;
        items.push(render_literal(&item)?);
    }
    Some(format!("[{}]", items.join(", ")))
}

fn as_text(value: &ScalarValue) -> Option<String> {
    match value.cast_to(&DataType::Utf8).ok()? {
        ScalarValue::Utf8(Some(s)) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(quote_identifier("a`b"), "`a\\`b`");
        assert_eq!(quote_identifier("plain"), "`plain`");
    }

    #[test]
    fn test_quote_table() {
        let table = DatasetName::new("p", "d").table("t");
        assert_eq!(quote_table(&table), "`p`.`d`.`t`");
    }

    #[test]
    fn test_render_scalars() {
        assert_eq!(render_literal(&ScalarValue::Int64(None)).unwrap(), "NULL");
        assert_eq!(render_literal(&ScalarValue::Boolean(Some(true))).unwrap(), "TRUE");
        assert_eq!(render_literal(&ScalarValue::Int32(Some(-4))).unwrap(), "-4");
        assert_eq!(render_literal(&ScalarValue::Float64(Some(1.0))).unwrap(), "1.0");
        assert_eq!(
            render_literal(&ScalarValue::Utf8(Some("it's".into()))).unwrap(),
            "'it\\'s'"
        );
        assert_eq!(
            render_literal(&ScalarValue::Decimal128(Some(150), 10, 2)).unwrap(),
            "NUMERIC '1.50'"
        );
        assert_eq!(
            render_literal(&ScalarValue::Date32(Some(0))).unwrap(),
            "DATE '1970-01-01'"
        );
        assert_eq!(
            render_literal(&ScalarValue::TimestampMicrosecond(
                Some(1_000_000),
                Some(Arc::from("UTC"))
            ))
            .unwrap(),
            "TIMESTAMP_MICROS(1000000)"
        );
        assert_eq!(
            render_literal(&ScalarValue::Binary(Some(b"hi".to_vec()))).unwrap(),
            "FROM_BASE64('aGk=')"
        );
    }

    #[test]
    fn test_render_list() {
        let list = ScalarValue::List(ScalarValue::new_list_nullable(
            &[ScalarValue::Int64(Some(1)), ScalarValue::Int64(Some(2))],
            &DataType::Int64,
        ));
        assert_eq!(render_literal(&list).unwrap(), "[1, 2]");
    }

    #[test]
    fn test_unrenderable_type() {
        assert!(render_literal(&ScalarValue::IntervalYearMonth(Some(3))).is_none());
    }

    #[test]
    fn test_create_table_ddl_with_primary_key() {
        use crate::client::types::{FieldMode, FieldType};
        let table = TableResource {
            name: DatasetName::new("p", "d").table("t"),
            kind: TableKind::Table,
            fields: vec![
                TableFieldSchema::new("id", FieldType::Int64).with_mode(FieldMode::Required),
                TableFieldSchema::new("name", FieldType::String),
            ],
            primary_key: vec!["id".to_string()],
            view_query: None,
        };
        assert_eq!(
            create_table_ddl(&table).unwrap(),
            "CREATE TABLE `p`.`d`.`t` (`id` INT64 NOT NULL, `name` STRING, PRIMARY KEY (`id`) NOT ENFORCED)"
        );
    }

    #[test]
    fn test_view_without_query_is_rejected() {
        let view = TableResource {
            name: DatasetName::new("p", "d").table("v"),
            kind: TableKind::View,
            fields: vec![],
            primary_key: vec![],
            view_query: None,
        };
        assert!(create_table_ddl(&view).is_err());
    }

    #[test]
    fn test_drop_statements() {
        let ds = DatasetName::new("p", "d");
        assert_eq!(drop_schema_ddl(&ds, true), "DROP SCHEMA `p`.`d` CASCADE");
        assert_eq!(
            drop_table_ddl(&ds.table("v"), TableKind::View),
            "DROP VIEW `p`.`d`.`v`"
        );
    }

    #[test]
    fn test_select_sql() {
        let table = DatasetName::new("p", "d").table("t");
        assert_eq!(
            select_sql(&table, &["a".to_string()], Some("`a` > 1")),
            "SELECT `a` FROM `p`.`d`.`t` WHERE `a` > 1"
        );
        assert_eq!(select_sql(&table, &[], None), "SELECT 1 FROM `p`.`d`.`t`");
    }
}
