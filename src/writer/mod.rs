//! Buffered row writes over one pending write stream.
//!
//! Rows are encoded on append and sent in chunks bounded by row count and
//! encoded size. Nothing is visible to readers until [`commit`] finalizes the
//! stream and commits it. A writer owns its stream; it is not shared.
//!
//! [`commit`]: BigqueryProtoWriter::commit

use std::sync::Arc;

use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::common::ScalarValue;
use tracing::{debug, info, warn};

use crate::client::proto_wire::ProtoSchema;
use crate::client::{
    fields_to_schema, AppendRowsRequest, TableName, WarehouseApi, WriteStreamResource,
};
use crate::config::WriteConfig;
use crate::error::{BigqueryError, PartialWriteError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Committed,
}

#[derive(Debug)]
pub struct BigqueryProtoWriter {
    api: Arc<dyn WarehouseApi>,
    stream: WriteStreamResource,
    proto: ProtoSchema,
    schema: SchemaRef,
    config: WriteConfig,
    pending: Vec<Vec<u8>>,
    pending_bytes: usize,
    /// Rows durably appended; also the offset of the next append
    next_offset: u64,
    state: WriterState,
}

impl BigqueryProtoWriter {
    pub fn new(api: Arc<dyn WarehouseApi>, stream: WriteStreamResource, config: WriteConfig) -> Self {
        let proto = ProtoSchema::from_fields(&stream.fields);
        let schema = Arc::new(fields_to_schema(&stream.fields));
        Self {
            api,
            stream,
            proto,
            schema,
            config,
            pending: Vec::new(),
            pending_bytes: 0,
            next_offset: 0,
            state: WriterState::Open,
        }
    }

    /// Host schema of the target table
    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn stream_name(&self) -> &str {
        &self.stream.name
    }

    pub fn table(&self) -> &TableName {
        &self.stream.table
    }

    /// Encoded rows not yet sent
    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    /// Rows durably appended to the stream (not yet visible before commit)
    pub fn appended_rows(&self) -> u64 {
        self.next_offset
    }

    pub fn is_committed(&self) -> bool {
        self.state == WriterState::Committed
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Committed => Err(BigqueryError::State(format!(
                "write stream {} is already committed",
                self.stream.name
            ))),
        }
    }

    /// Encode and buffer one row given in table column order.
    pub async fn append_row(&mut self, row: &[ScalarValue]) -> Result<()> {
        self.ensure_open()?;
        let encoded = self.proto.encode_row(row)?;
        self.pending_bytes += encoded.len();
        self.pending.push(encoded);
        if self.pending.len() >= self.config.max_chunk_rows
            || self.pending_bytes >= self.config.max_chunk_bytes
        {
            self.flush().await?;
        }
        Ok(())
    }

    /// Append every row of `batch`. Columns are matched by position and cast
    /// to the table's types.
    pub async fn append_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        self.ensure_open()?;
        if batch.num_columns() != self.schema.fields().len() {
            return Err(BigqueryError::Binding(format!(
                "insert into {} expects {} columns, got {}",
                self.stream.table,
                self.schema.fields().len(),
                batch.num_columns()
            )));
        }
        let columns = batch
            .columns()
            .iter()
            .zip(self.schema.fields())
            .map(|(column, field)| {
                if column.data_type() == field.data_type() {
                    Ok(Arc::clone(column))
                } else {
                    cast(column, field.data_type()).map_err(BigqueryError::from)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        for row in 0..batch.num_rows() {
            let values = columns
                .iter()
                .map(|c| ScalarValue::try_from_array(c, row))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            self.append_row(&values).await?;
        }
        Ok(())
    }

    /// Send buffered rows.
    ///
    /// On failure nothing from the buffer was appended: the error names the
    /// stream offsets of the buffered rows, and the buffer is kept so the
    /// caller can retry with `flush` or give up with `clear_pending`.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let count = self.pending.len() as u64;
        let offset = self.next_offset;

        let request = AppendRowsRequest {
            write_stream: self.stream.name.clone(),
            offset,
            serialized_rows: self.pending.clone(),
        };
        let result = self.api.append_rows(request).await;
        let failure = match result {
            Ok(response) if response.row_errors.is_empty() => {
                self.next_offset += count;
                self.clear_pending();
                debug!(stream = %self.stream.name, rows = count, offset, "Appended rows");
                return Ok(());
            }
            Ok(response) => PartialWriteError {
                stream: self.stream.name.clone(),
                accepted_rows: offset,
                failed_offsets: offset..offset + count,
                cause: format!("{} rows rejected", response.row_errors.len()),
                row_errors: response
                    .row_errors
                    .into_iter()
                    .map(|e| (offset + e.index as u64, e.message))
                    .collect(),
            },
            Err(e) => PartialWriteError {
                stream: self.stream.name.clone(),
                accepted_rows: offset,
                failed_offsets: offset..offset + count,
                row_errors: Vec::new(),
                cause: e.to_string(),
            },
        };
        warn!(
            stream = %self.stream.name,
            failed = ?failure.failed_offsets,
            cause = %failure.cause,
            "Append failed"
        );
        Err(failure.into())
    }

    /// Drop buffered rows that were never appended.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }

    /// Flush, finalize and commit the stream, making every appended row
    /// visible at once. Returns the committed row count. The writer accepts
    /// nothing afterwards.
    pub async fn commit(&mut self) -> Result<u64> {
        self.flush().await?;
        let finalized = self.api.finalize_write_stream(&self.stream.name).await?;
        if finalized != self.next_offset {
            return Err(BigqueryError::State(format!(
                "write stream {} finalized with {} rows, expected {}",
                self.stream.name, finalized, self.next_offset
            )));
        }
        self.api
            .batch_commit_write_streams(&self.stream.table, std::slice::from_ref(&self.stream.name))
            .await?;
        self.state = WriterState::Committed;
        info!(table = %self.stream.table, rows = finalized, "Committed write stream");
        Ok(finalized)
    }
}

impl Drop for BigqueryProtoWriter {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            debug!(stream = %self.stream.name, rows = self.next_offset, "Abandoning write stream");
            self.api.release_stream(&self.stream.name);
        }
    }
}
