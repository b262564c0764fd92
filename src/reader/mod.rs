//! Columnar reads over a read session.
//!
//! A session holds a fixed set of streams. Each [`BigqueryStreamReader`] owns
//! one stream's position and yields that stream's batches in order; nothing is
//! guaranteed about the relative order of rows from different streams.

use std::sync::Arc;

use datafusion::arrow::array::{RecordBatch, RecordBatchOptions};
use datafusion::arrow::datatypes::SchemaRef;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::client::arrow_wire::{decode_batch, decode_schema};
use crate::client::{ReadSessionResource, TableName, WarehouseApi};
use crate::error::Result;

/// All streams of one read session.
#[derive(Debug, Clone)]
pub struct BigqueryArrowReader {
    api: Arc<dyn WarehouseApi>,
    session: ReadSessionResource,
    schema: SchemaRef,
    schema_message: Arc<Vec<u8>>,
}

impl BigqueryArrowReader {
    pub fn new(api: Arc<dyn WarehouseApi>, session: ReadSessionResource) -> Result<Self> {
        let schema = decode_schema(&session.arrow_schema)?;
        let schema_message = Arc::new(session.arrow_schema.clone());
        Ok(Self {
            api,
            session,
            schema,
            schema_message,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn table(&self) -> &TableName {
        &self.session.table
    }

    pub fn session_name(&self) -> &str {
        &self.session.name
    }

    /// Fixed at session creation; may be fewer than requested and is zero for
    /// an empty table.
    pub fn stream_count(&self) -> usize {
        self.session.streams.len()
    }

    /// A reader positioned at the start of stream `index`.
    pub fn stream(&self, index: usize) -> Option<BigqueryStreamReader> {
        let info = self.session.streams.get(index)?;
        Some(BigqueryStreamReader {
            api: Arc::clone(&self.api),
            stream: info.name.clone(),
            schema: self.schema(),
            schema_message: Arc::clone(&self.schema_message),
            offset: 0,
            finished: false,
        })
    }

    pub fn streams(&self) -> Vec<BigqueryStreamReader> {
        (0..self.stream_count()).filter_map(|i| self.stream(i)).collect()
    }

    /// Every batch of every stream, interleaved as streams make progress.
    pub fn into_stream(self) -> BoxStream<'static, Result<RecordBatch>> {
        stream::select_all(self.streams().into_iter().map(BigqueryStreamReader::into_stream))
            .boxed()
    }

    /// Drain all streams.
    pub async fn read_all(self) -> Result<Vec<RecordBatch>> {
        self.into_stream().try_collect().await
    }
}

/// Position within one read stream. Not shared: one consumer per stream.
///
/// Dropping a reader before the stream is exhausted releases whatever the
/// transport holds open for it.
#[derive(Debug)]
pub struct BigqueryStreamReader {
    api: Arc<dyn WarehouseApi>,
    stream: String,
    schema: SchemaRef,
    schema_message: Arc<Vec<u8>>,
    offset: u64,
    finished: bool,
}

impl BigqueryStreamReader {
    pub fn name(&self) -> &str {
        &self.stream
    }

    /// Rows consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next batch in stream order; `None` once the stream is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        if self.finished {
            return Ok(None);
        }
        let response = match self.api.read_rows(&self.stream, self.offset).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                debug!(stream = %self.stream, rows = self.offset, "Read stream exhausted");
                self.finished = true;
                return Ok(None);
            }
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };

        let batch = match &response.arrow_record_batch {
            Some(bytes) if !self.schema.fields().is_empty() => {
                decode_batch(&self.schema_message, bytes)?
            }
            // Zero-column projections carry only a row count
            _ => RecordBatch::try_new_with_options(
                Arc::clone(&self.schema),
                vec![],
                &RecordBatchOptions::new().with_row_count(Some(response.row_count as usize)),
            )?,
        };
        self.offset += response.row_count;
        Ok(Some(batch))
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<RecordBatch>> {
        stream::unfold(self, |mut reader| async move {
            match reader.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
        .boxed()
    }
}

impl Drop for BigqueryStreamReader {
    fn drop(&mut self) {
        if !self.finished {
            self.api.release_stream(&self.stream);
        }
    }
}
