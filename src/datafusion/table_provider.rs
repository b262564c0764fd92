use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::array::{RecordBatch, RecordBatchOptions};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::catalog::streaming::StreamingTable;
use datafusion::catalog::Session;
use datafusion::common::{not_impl_err, plan_err, Constraints};
use datafusion::datasource::sink::{DataSink, DataSinkExec};
use datafusion::datasource::{TableProvider, TableType};
use datafusion::error::{DataFusionError, Result as DFResult};
use datafusion::execution::TaskContext;
use datafusion::logical_expr::dml::InsertOp;
use datafusion::logical_expr::{Expr, TableProviderFilterPushDown};
use datafusion::physical_plan::display::{DisplayAs, DisplayFormatType};
use datafusion::physical_plan::empty::EmptyExec;
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::streaming::PartitionStream;
use datafusion::physical_plan::{ExecutionPlan, SendableRecordBatchStream};
use futures::StreamExt;
use tracing::debug;

use super::filters::{filter_to_sql, row_restriction};
use crate::catalog::BigqueryTableRef;
use crate::reader::BigqueryArrowReader;
use crate::transaction::BigqueryTransactionManager;

/// A warehouse table or view, read through read sessions and written through
/// pending write streams of the connection's active transaction.
#[derive(Debug)]
pub struct BigqueryTableProvider {
    manager: Arc<BigqueryTransactionManager>,
    connection_id: String,
    table: Arc<BigqueryTableRef>,
}

impl BigqueryTableProvider {
    pub fn new(
        manager: Arc<BigqueryTransactionManager>,
        connection_id: String,
        table: Arc<BigqueryTableRef>,
    ) -> Self {
        Self {
            manager,
            connection_id,
            table,
        }
    }

    pub fn table(&self) -> &Arc<BigqueryTableRef> {
        &self.table
    }
}

#[async_trait]
impl TableProvider for BigqueryTableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.table.schema)
    }

    fn constraints(&self) -> Option<&Constraints> {
        Some(&self.table.constraints)
    }

    fn table_type(&self) -> TableType {
        if self.table.is_view() {
            TableType::View
        } else {
            TableType::Base
        }
    }

    fn get_table_definition(&self) -> Option<&str> {
        self.table.view_query.as_deref()
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let (schema, columns) = match projection {
            Some(indices) => {
                let projected = Arc::new(self.table.schema.project(indices)?);
                let names = projected.fields().iter().map(|f| f.name().clone()).collect();
                (projected, Some(names))
            }
            None => (self.schema(), None),
        };

        let transaction = self.manager.current(&self.connection_id);
        let max_streams = self.manager.catalog().options().read.max_streams;
        let reader = transaction
            .create_arrow_reader(
                &self.table.name.dataset_id,
                &self.table.name.table_id,
                max_streams,
                columns,
                row_restriction(filters),
            )
            .await?;
        debug!(
            table = %self.table.name,
            streams = reader.stream_count(),
            "Planning warehouse scan"
        );

        if reader.stream_count() == 0 {
            return Ok(Arc::new(EmptyExec::new(schema)));
        }

        let reader = Arc::new(reader);
        let partitions = (0..reader.stream_count())
            .map(|index| {
                Arc::new(ReadStreamPartition {
                    reader: Arc::clone(&reader),
                    index,
                    schema: Arc::clone(&schema),
                }) as Arc<dyn PartitionStream>
            })
            .collect();
        StreamingTable::try_new(Arc::clone(&schema), partitions)?
            .scan(state, None, &[], limit)
            .await
    }

    fn supports_filters_pushdown(
        &self,
        filters: &[&Expr],
    ) -> DFResult<Vec<TableProviderFilterPushDown>> {
        Ok(filters
            .iter()
            .map(|f| match filter_to_sql(f) {
                Some(_) => TableProviderFilterPushDown::Inexact,
                None => TableProviderFilterPushDown::Unsupported,
            })
            .collect())
    }

    async fn insert_into(
        &self,
        _state: &dyn Session,
        input: Arc<dyn ExecutionPlan>,
        insert_op: InsertOp,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        if insert_op != InsertOp::Append {
            return not_impl_err!("{insert_op} is not supported for warehouse tables");
        }
        if self.table.is_view() {
            return plan_err!("cannot insert into view {}", self.table.name);
        }
        self.manager
            .current(&self.connection_id)
            .require_writable("insert into tables")?;

        let sink = BigqueryInsertSink {
            manager: Arc::clone(&self.manager),
            connection_id: self.connection_id.clone(),
            table: Arc::clone(&self.table),
            schema: self.schema(),
        };
        Ok(Arc::new(DataSinkExec::new(input, Arc::new(sink), None)))
    }
}

/// One read stream exposed as a DataFusion partition. Each execution opens
/// the stream from its start.
#[derive(Debug)]
struct ReadStreamPartition {
    reader: Arc<BigqueryArrowReader>,
    index: usize,
    schema: SchemaRef,
}

impl PartitionStream for ReadStreamPartition {
    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn execute(&self, _ctx: Arc<TaskContext>) -> SendableRecordBatchStream {
        let schema = Arc::clone(&self.schema);
        let batches = match self.reader.stream(self.index) {
            Some(stream) => stream.into_stream(),
            None => futures::stream::empty().boxed(),
        };
        let stream = batches.map(move |batch| -> DFResult<RecordBatch> {
            let batch = batch?;
            // Materialized view results can carry wider types than the declared schema
            let columns = batch
                .columns()
                .iter()
                .zip(schema.fields())
                .map(|(column, field)| {
                    if column.data_type() == field.data_type() {
                        Ok(Arc::clone(column))
                    } else {
                        cast(column, field.data_type())
                    }
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
            Ok(RecordBatch::try_new_with_options(
                Arc::clone(&schema),
                columns,
                &options,
            )?)
        });
        Box::pin(RecordBatchStreamAdapter::new(
            Arc::clone(&self.schema),
            stream,
        ))
    }
}

/// Streams an INSERT's input into one write stream, committed once when the
/// input is exhausted.
struct BigqueryInsertSink {
    manager: Arc<BigqueryTransactionManager>,
    connection_id: String,
    table: Arc<BigqueryTableRef>,
    schema: SchemaRef,
}

impl fmt::Debug for BigqueryInsertSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigqueryInsertSink")
            .field("table", &self.table.name)
            .finish()
    }
}

impl DisplayAs for BigqueryInsertSink {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => {
                write!(f, "BigqueryInsertSink(table={})", self.table.name)
            }
            DisplayFormatType::TreeRender => write!(f, "table={}", self.table.name),
        }
    }
}

#[async_trait]
impl DataSink for BigqueryInsertSink {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    async fn write_all(
        &self,
        mut data: SendableRecordBatchStream,
        _context: &Arc<TaskContext>,
    ) -> DFResult<u64> {
        let transaction = self.manager.current(&self.connection_id);
        let mut writer = transaction
            .create_proto_writer(&self.table.name.dataset_id, &self.table.name.table_id)
            .await?;
        while let Some(batch) = data.next().await.transpose()? {
            writer.append_batch(&batch).await?;
        }
        let rows = writer.commit().await.map_err(DataFusionError::from)?;
        debug!(table = %self.table.name, rows, "Committed insert");
        Ok(rows)
    }
}
