//! Arrow IPC message framing for read-session payloads.
//!
//! A session carries one encapsulated schema message and every response one
//! encapsulated record batch message, neither with an end-of-stream marker.
//! Concatenating the two yields a readable IPC stream.

use std::io::Cursor;

use datafusion::arrow::datatypes::{Schema, SchemaRef};
use datafusion::arrow::ipc::reader::StreamReader;
use datafusion::arrow::ipc::writer::StreamWriter;
use datafusion::arrow::record_batch::RecordBatch;

use crate::error::{BigqueryError, Result};

/// Serialize a schema as a bare schema message.
pub fn encode_schema(schema: &Schema) -> Result<Vec<u8>> {
    let writer = StreamWriter::try_new(Vec::new(), schema)?;
    Ok(writer.get_ref().clone())
}

pub fn decode_schema(bytes: &[u8]) -> Result<SchemaRef> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    Ok(reader.schema())
}

/// Serialize one batch as a bare record batch message.
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut writer = StreamWriter::try_new(Vec::new(), &batch.schema())?;
    let header = writer.get_ref().len();
    writer.write(batch)?;
    Ok(writer.get_ref()[header..].to_vec())
}

/// Decode a record batch message against the session's schema message.
pub fn decode_batch(schema_message: &[u8], batch_message: &[u8]) -> Result<RecordBatch> {
    let mut framed = Vec::with_capacity(schema_message.len() + batch_message.len());
    framed.extend_from_slice(schema_message);
    framed.extend_from_slice(batch_message);
    let mut reader = StreamReader::try_new(Cursor::new(framed), None)?;
    match reader.next() {
        Some(batch) => Ok(batch?),
        None => Err(BigqueryError::Decode(
            "response carried no record batch".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int64Array, StringArray};
    use datafusion::arrow::datatypes::{DataType, Field};
    use std::sync::Arc;

    fn sample() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_batch_keeps_nulls() {
        let batch = sample();
        let schema = encode_schema(&batch.schema()).unwrap();
        let message = encode_batch(&batch).unwrap();
        let decoded = decode_batch(&schema, &message).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.column(1).null_count(), 1);
    }

    #[test]
    fn test_batch_message_excludes_schema() {
        let batch = sample();
        let schema = encode_schema(&batch.schema()).unwrap();
        let message = encode_batch(&batch).unwrap();
        assert!(!message.starts_with(&schema));
        assert!(decode_batch(&schema, &[]).is_err());
    }

    #[test]
    fn test_schema_message() {
        let batch = sample();
        let bytes = encode_schema(&batch.schema()).unwrap();
        assert_eq!(decode_schema(&bytes).unwrap(), batch.schema());
    }
}
