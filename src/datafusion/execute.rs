//! `bigquery_execute(database, sql)`: run arbitrary SQL as a warehouse job.
//!
//! Binding (database lookup, catalog type, access mode) happens when the call
//! is planned; the job itself runs when the plan is executed. The result is a
//! single row with one BOOLEAN column `success`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::array::{ArrayRef, BooleanArray, RecordBatch, RecordBatchOptions};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::catalog::{CatalogProviderList, Session, TableFunctionImpl};
use datafusion::common::internal_err;
use datafusion::datasource::{TableProvider, TableType};
use datafusion::error::Result as DFResult;
use datafusion::execution::TaskContext;
use datafusion::logical_expr::Expr;
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::display::{DisplayAs, DisplayFormatType};
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    ExecutionPlan, Partitioning, PlanProperties, SendableRecordBatchStream,
};
use tracing::info;

use super::catalog_provider::BigqueryCatalogProvider;
use crate::catalog::BigqueryCatalog;
use crate::error::{BigqueryError, Result};
use crate::transaction::BigqueryTransaction;

pub const EXECUTE_FUNCTION_NAME: &str = "bigquery_execute";

#[derive(Debug)]
pub struct BigqueryExecuteFunction {
    catalogs: Arc<dyn CatalogProviderList>,
}

impl BigqueryExecuteFunction {
    pub fn new(catalogs: Arc<dyn CatalogProviderList>) -> Self {
        Self { catalogs }
    }

    fn bind(&self, args: &[Expr]) -> Result<BigqueryExecuteTable> {
        let (database, sql) = parse_args(args)?;
        let provider = self.catalogs.catalog(&database).ok_or_else(|| {
            BigqueryError::Binding(format!("Failed to find attached database \"{database}\""))
        })?;
        let bigquery = provider
            .as_any()
            .downcast_ref::<BigqueryCatalogProvider>()
            .ok_or_else(|| {
                BigqueryError::Binding(format!(
                    "Database \"{database}\" is not a BigQuery database"
                ))
            })?;

        let transaction = bigquery.transaction();
        transaction.require_writable("execute queries")?;
        Ok(BigqueryExecuteTable {
            catalog: Arc::clone(bigquery.catalog()),
            transaction,
            sql,
        })
    }
}

impl TableFunctionImpl for BigqueryExecuteFunction {
    fn call(&self, args: &[Expr]) -> DFResult<Arc<dyn TableProvider>> {
        Ok(Arc::new(self.bind(args)?))
    }
}

fn parse_args(args: &[Expr]) -> Result<(String, String)> {
    let strings: Vec<Option<&str>> = args
        .iter()
        .map(|arg| match arg {
            Expr::Literal(value, _) => value.try_as_str().flatten(),
            _ => None,
        })
        .collect();
    match strings.as_slice() {
        [Some(database), Some(sql)] => Ok((database.to_string(), sql.to_string())),
        _ => Err(BigqueryError::Binding(format!(
            "{EXECUTE_FUNCTION_NAME} expects two string literals (database, sql), got {} arguments",
            args.len()
        ))),
    }
}

fn result_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new(
        "success",
        DataType::Boolean,
        false,
    )]))
}

/// A bound `bigquery_execute` call. Planning it is free; the job runs when
/// the plan executes.
#[derive(Debug)]
struct BigqueryExecuteTable {
    catalog: Arc<BigqueryCatalog>,
    transaction: Arc<BigqueryTransaction>,
    sql: String,
}

#[async_trait]
impl TableProvider for BigqueryExecuteTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        result_schema()
    }

    fn table_type(&self) -> TableType {
        TableType::Temporary
    }

    async fn scan(
        &self,
        _state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        _limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let schema = match projection {
            Some(indices) => Arc::new(result_schema().project(indices)?),
            None => result_schema(),
        };
        Ok(Arc::new(BigqueryExecuteExec::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.transaction),
            self.sql.clone(),
            schema,
        )))
    }
}

/// Leaf plan that submits the SQL as one job and yields the `success` row.
#[derive(Debug)]
pub struct BigqueryExecuteExec {
    catalog: Arc<BigqueryCatalog>,
    transaction: Arc<BigqueryTransaction>,
    sql: String,
    schema: SchemaRef,
    properties: PlanProperties,
}

impl BigqueryExecuteExec {
    fn new(
        catalog: Arc<BigqueryCatalog>,
        transaction: Arc<BigqueryTransaction>,
        sql: String,
        schema: SchemaRef,
    ) -> Self {
        let properties = PlanProperties::new(
            EquivalenceProperties::new(Arc::clone(&schema)),
            Partitioning::UnknownPartitioning(1),
            EmissionType::Final,
            Boundedness::Bounded,
        );
        Self {
            catalog,
            transaction,
            sql,
            schema,
            properties,
        }
    }
}

impl DisplayAs for BigqueryExecuteExec {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => write!(
                f,
                "BigqueryExecuteExec: database={}, sql={}",
                self.catalog.name(),
                self.sql
            ),
            DisplayFormatType::TreeRender => write!(f, "database={}", self.catalog.name()),
        }
    }
}

impl ExecutionPlan for BigqueryExecuteExec {
    fn name(&self) -> &str {
        "BigqueryExecuteExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn properties(&self) -> &PlanProperties {
        &self.properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        if !children.is_empty() {
            return internal_err!("BigqueryExecuteExec has no children");
        }
        Ok(self)
    }

    fn execute(
        &self,
        partition: usize,
        _context: Arc<TaskContext>,
    ) -> DFResult<SendableRecordBatchStream> {
        if partition != 0 {
            return internal_err!("BigqueryExecuteExec has one partition, got {partition}");
        }
        let catalog = Arc::clone(&self.catalog);
        let transaction = Arc::clone(&self.transaction);
        let sql = self.sql.clone();
        let schema = Arc::clone(&self.schema);
        let run = async move {
            let result = transaction.execute_query(&sql, None).await;
            // Arbitrary SQL may have changed any dataset or table
            catalog.clear_cache();
            let job = result?;
            info!(database = %catalog.name(), job_id = %job.job_id, "Executed passthrough SQL");
            success_batch(schema)
        };
        Ok(Box::pin(RecordBatchStreamAdapter::new(
            Arc::clone(&self.schema),
            futures::stream::once(run),
        )))
    }
}

fn success_batch(schema: SchemaRef) -> DFResult<RecordBatch> {
    let columns: Vec<ArrayRef> = if schema.fields().is_empty() {
        vec![]
    } else {
        vec![Arc::new(BooleanArray::from(vec![true]))]
    };
    let options = RecordBatchOptions::new().with_row_count(Some(1));
    Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
}
