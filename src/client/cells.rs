//! Reading REST `tabledata` cells.
//!
//! Every leaf comes back as a JSON string (or null), whatever the column type.

use gcp_bigquery_client::model::table_cell::TableCell;
use serde_json::Value;

/// Extract a string value from a BigQuery TableCell
pub fn cell_to_string(cell: &TableCell) -> Option<String> {
    match &cell.value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}
