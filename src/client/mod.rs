//! Warehouse client: metadata, DDL, query jobs and stream factories.
//!
//! `BigqueryClient` is a cheap handle over a [`WarehouseApi`] transport. It is
//! `Clone`; clones share the transport.

pub mod api;
pub mod arrow_wire;
pub mod auth;
pub mod cells;
pub mod job;
pub mod memory;
pub mod proto_wire;
pub mod rest;
pub mod storage;
pub mod sql;
pub mod types;

use std::sync::Arc;

use datafusion::arrow::datatypes::{Schema, SchemaRef};
use datafusion::common::Constraints;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, Span};

pub use api::{
    AppendRowsRequest, AppendRowsResponse, DatasetName, DatasetResource, ErrorProto, JobRequest,
    JobResource, JobState, ReadRowsResponse, ReadSessionRequest, ReadSessionResource,
    ReadStreamInfo, RowError, TableKind, TableListEntry, TableName, TableResource, WarehouseApi,
    WarehouseConnector, WriteStreamResource,
};
pub use auth::{Credentials, TokenSource};
pub use job::JobPoller;
pub use memory::{CallCounts, InMemoryWarehouse, MemoryConnector};
pub use rest::{GcpConnector, GcpWarehouse};
pub use types::{
    fields_to_schema, parse_column_type, schema_to_fields, FieldMode, FieldType, TableFieldSchema,
};

use crate::catalog::{table_resource, BigqueryDatasetRef, BigqueryTableRef};
use crate::config::BigqueryOptions;
use crate::error::{BigqueryError, Result};
use crate::reader::BigqueryArrowReader;
use crate::writer::BigqueryProtoWriter;

#[derive(Debug, Clone)]
pub struct BigqueryClient {
    api: Arc<dyn WarehouseApi>,
    options: Arc<BigqueryOptions>,
}

impl BigqueryClient {
    pub fn new(api: Arc<dyn WarehouseApi>, options: Arc<BigqueryOptions>) -> Self {
        Self { api, options }
    }

    /// Build a transport through `connector` and wrap it.
    pub async fn connect(
        options: Arc<BigqueryOptions>,
        credentials: &Credentials,
        connector: &dyn WarehouseConnector,
    ) -> Result<Self> {
        let api = connector.connect(&options, credentials).await?;
        debug!(project_id = %options.project_id, "Warehouse client connected");
        Ok(Self::new(api, options))
    }

    pub fn project_id(&self) -> &str {
        &self.options.project_id
    }

    pub fn options(&self) -> &BigqueryOptions {
        &self.options
    }

    pub fn api(&self) -> &Arc<dyn WarehouseApi> {
        &self.api
    }

    /// Unique job id, led by `prefix` when given.
    pub fn generate_job_id(&self, prefix: Option<&str>) -> String {
        crate::id::generate_job_id(prefix)
    }

    fn dataset_name(&self, dataset_id: &str) -> DatasetName {
        DatasetName::new(self.project_id(), dataset_id)
    }

    fn table_name(&self, dataset_id: &str, table_id: &str) -> TableName {
        self.dataset_name(dataset_id).table(table_id)
    }

    /// `false` when absent; transport and auth failures are errors.
    pub async fn dataset_exists(&self, dataset_id: &str) -> Result<bool> {
        match self.api.get_dataset(&self.dataset_name(dataset_id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `false` when the table or its dataset is absent.
    pub async fn table_exists(&self, dataset_id: &str, table_id: &str) -> Result<bool> {
        match self.api.get_table(&self.table_name(dataset_id, table_id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_datasets(&self) -> Result<Vec<BigqueryDatasetRef>> {
        let datasets = self.api.list_datasets(self.project_id()).await?;
        Ok(datasets.into_iter().map(BigqueryDatasetRef::from).collect())
    }

    pub async fn get_dataset(&self, dataset_id: &str) -> Result<BigqueryDatasetRef> {
        let resource = self.api.get_dataset(&self.dataset_name(dataset_id)).await?;
        Ok(resource.into())
    }

    pub async fn get_tables(&self, dataset_id: &str) -> Result<Vec<TableListEntry>> {
        self.api.list_tables(&self.dataset_name(dataset_id)).await
    }

    /// Table metadata translated to host columns and constraints.
    #[instrument(skip(self))]
    pub async fn get_table(&self, dataset_id: &str, table_id: &str) -> Result<BigqueryTableRef> {
        let resource = self
            .api
            .get_table(&self.table_name(dataset_id, table_id))
            .await?;
        BigqueryTableRef::from_resource(resource)
    }

    pub async fn get_table_info(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<(SchemaRef, Constraints)> {
        let table = self.get_table(dataset_id, table_id).await?;
        Ok((table.schema, table.constraints))
    }

    /// Not idempotent: fails with `AlreadyExists` when the dataset exists.
    #[instrument(skip(self))]
    pub async fn create_dataset(
        &self,
        dataset_id: &str,
        location: Option<&str>,
    ) -> Result<BigqueryDatasetRef> {
        let resource = DatasetResource {
            name: self.dataset_name(dataset_id),
            location: location
                .map(str::to_string)
                .or_else(|| self.options.default_location.clone()),
        };
        let created = self.api.insert_dataset(resource).await?;
        info!(dataset = %created.name, "Created dataset");
        Ok(created.into())
    }

    /// Not idempotent: fails with `AlreadyExists` when the table exists.
    #[instrument(skip(self, schema, constraints))]
    pub async fn create_table(
        &self,
        dataset_id: &str,
        table_id: &str,
        schema: &Schema,
        constraints: &Constraints,
    ) -> Result<BigqueryTableRef> {
        let resource = table_resource(self.table_name(dataset_id, table_id), schema, constraints)?;
        let created = self.api.insert_table(resource).await?;
        info!(table = %created.name, "Created table");
        BigqueryTableRef::from_resource(created)
    }

    #[instrument(skip(self, query))]
    pub async fn create_view(&self, dataset_id: &str, view_id: &str, query: &str) -> Result<()> {
        let resource = TableResource {
            name: self.table_name(dataset_id, view_id),
            kind: TableKind::View,
            fields: Vec::new(),
            primary_key: Vec::new(),
            view_query: Some(query.to_string()),
        };
        let created = self.api.insert_table(resource).await?;
        info!(view = %created.name, "Created view");
        Ok(())
    }

    /// With `cascade`, contained tables and views are dropped too; without it a
    /// non-empty dataset is an error.
    #[instrument(skip(self))]
    pub async fn drop_dataset(&self, dataset_id: &str, cascade: bool) -> Result<()> {
        let name = self.dataset_name(dataset_id);
        self.api.delete_dataset(&name, cascade).await?;
        info!(dataset = %name, "Dropped dataset");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn drop_table(&self, dataset_id: &str, table_id: &str) -> Result<()> {
        let name = self.table_name(dataset_id, table_id);
        self.api.delete_table(&name, TableKind::Table).await?;
        info!(table = %name, "Dropped table");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn drop_view(&self, dataset_id: &str, view_id: &str) -> Result<()> {
        let name = self.table_name(dataset_id, view_id);
        self.api.delete_table(&name, TableKind::View).await?;
        info!(view = %name, "Dropped view");
        Ok(())
    }

    /// Submit `sql` as a job and poll it to a terminal state.
    ///
    /// `location` falls back to the configured default location. A job that
    /// finishes with an error result fails with [`BigqueryError::JobFailed`].
    pub async fn execute_query(&self, sql: &str, location: Option<&str>) -> Result<JobResource> {
        self.execute_query_with_cancel(sql, location, CancellationToken::new())
            .await
    }

    /// Like [`execute_query`](Self::execute_query), abandoning the poll loop when
    /// `cancel` fires. The remote job keeps running.
    #[instrument(
        name = "execute_job",
        skip(self, sql, cancel),
        fields(job_id = tracing::field::Empty, sql = tracing::field::Empty)
    )]
    pub async fn execute_query_with_cancel(
        &self,
        sql: &str,
        location: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<JobResource> {
        let job_id = self.generate_job_id(None);
        let span = Span::current();
        span.record("job_id", job_id.as_str());
        if crate::telemetry::include_sql_in_traces() {
            span.record("sql", sql);
        }

        let request = JobRequest {
            project_id: self.project_id().to_string(),
            job_id,
            query: sql.to_string(),
            location: location
                .map(str::to_string)
                .or_else(|| self.options.default_location.clone()),
        };
        let submitted = self.api.insert_job(request).await?;
        info!(job_id = %submitted.job_id, "Submitted query job");

        let done = JobPoller::new(self.api.as_ref(), &self.options.jobs)
            .with_cancellation(cancel)
            .wait(submitted)
            .await?;
        info!(
            job_id = %done.job_id,
            total_rows = ?done.total_rows,
            affected_rows = ?done.num_dml_affected_rows,
            "Query job finished"
        );
        Ok(done)
    }

    /// Open a read session of at most `max_streams` streams.
    ///
    /// `row_restriction` is advisory: the warehouse may ignore it, so callers
    /// must re-apply the predicate to what they read.
    #[instrument(skip(self, columns, row_restriction))]
    pub async fn create_read_session(
        &self,
        dataset_id: &str,
        table_id: &str,
        max_streams: usize,
        columns: Option<Vec<String>>,
        row_restriction: Option<String>,
    ) -> Result<ReadSessionResource> {
        if max_streams == 0 {
            return Err(BigqueryError::InvalidRequest(
                "a read session needs at least one stream".to_string(),
            ));
        }
        let session = self
            .api
            .create_read_session(ReadSessionRequest {
                table: self.table_name(dataset_id, table_id),
                max_streams,
                selected_fields: columns,
                row_restriction,
            })
            .await?;
        debug!(
            session = %session.name,
            streams = session.streams.len(),
            "Opened read session"
        );
        Ok(session)
    }

    /// Open a pending write stream; rows stay invisible until committed.
    pub async fn create_write_stream(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<WriteStreamResource> {
        self.api
            .create_write_stream(&self.table_name(dataset_id, table_id))
            .await
    }

    pub async fn create_arrow_reader(
        &self,
        dataset_id: &str,
        table_id: &str,
        max_streams: usize,
        columns: Option<Vec<String>>,
        row_restriction: Option<String>,
    ) -> Result<BigqueryArrowReader> {
        let session = self
            .create_read_session(dataset_id, table_id, max_streams, columns, row_restriction)
            .await?;
        BigqueryArrowReader::new(Arc::clone(&self.api), session)
    }

    pub async fn create_proto_writer(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<BigqueryProtoWriter> {
        let stream = self.create_write_stream(dataset_id, table_id).await?;
        Ok(BigqueryProtoWriter::new(
            Arc::clone(&self.api),
            stream,
            self.options.write.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::datatypes::{DataType, Field};
    use datafusion::common::Constraint;

    fn client() -> (Arc<InMemoryWarehouse>, BigqueryClient) {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let client = BigqueryClient::new(
            warehouse.clone(),
            Arc::new(BigqueryOptions::new("proj")),
        );
        (warehouse, client)
    }

    #[tokio::test]
    async fn test_exists_checks() {
        let (warehouse, client) = client();
        assert!(!client.dataset_exists("ds").await.unwrap());
        warehouse.seed_dataset(DatasetName::new("proj", "ds"));
        assert!(client.dataset_exists("ds").await.unwrap());
        assert!(!client.table_exists("ds", "t").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_table_is_not_found() {
        let (warehouse, client) = client();
        warehouse.seed_dataset(DatasetName::new("proj", "ds1"));
        let err = client.get_table("ds1", "missing_table").await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[tokio::test]
    async fn test_create_table_round_trips_primary_key() {
        let (_warehouse, client) = client();
        client.create_dataset("ds", None).await.unwrap();
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("v", DataType::Utf8, true),
        ]);
        let constraints = Constraints::new_unverified(vec![Constraint::PrimaryKey(vec![0])]);
        client
            .create_table("ds", "t", &schema, &constraints)
            .await
            .unwrap();

        let (fetched, fetched_constraints) = client.get_table_info("ds", "t").await.unwrap();
        assert_eq!(fetched.fields().len(), 2);
        assert!(!fetched.field(0).is_nullable());
        assert_eq!(fetched_constraints, constraints);

        let again = client.create_table("ds", "t", &schema, &constraints).await;
        assert!(matches!(again, Err(BigqueryError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_drop_missing_objects_fail() {
        let (_warehouse, client) = client();
        client.create_dataset("ds", None).await.unwrap();
        assert!(client.drop_table("ds", "nope").await.unwrap_err().is_not_found());
        assert!(client.drop_dataset("other", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_drop_view_on_table_is_rejected() {
        let (_warehouse, client) = client();
        client.create_dataset("ds", None).await.unwrap();
        let schema = Schema::new(vec![Field::new("a", DataType::Int64, true)]);
        client
            .create_table("ds", "t", &schema, &Constraints::default())
            .await
            .unwrap();
        let err = client.drop_view("ds", "t").await.unwrap_err();
        assert!(matches!(err, BigqueryError::InvalidRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_query_failure_is_execution_error() {
        let (warehouse, client) = client();
        warehouse.set_polls_until_done(2);
        warehouse.fail_jobs_matching("DROP TABLE", "notFound", "Not found: Table proj:ds.x");

        let err = client
            .execute_query("DROP TABLE ds.x", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Execution);
        assert!(err.to_string().contains("Not found: Table proj:ds.x"));
    }

    #[tokio::test]
    async fn test_job_ids_are_unique() {
        let (warehouse, client) = client();
        client.execute_query("SELECT 1", None).await.unwrap();
        client.execute_query("SELECT 1", None).await.unwrap();
        assert_eq!(warehouse.executed_queries().len(), 2);
        assert_ne!(client.generate_job_id(None), client.generate_job_id(None));
    }

    #[tokio::test]
    async fn test_zero_stream_session_is_rejected() {
        let (_warehouse, client) = client();
        let err = client
            .create_read_session("ds", "t", 0, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BigqueryError::InvalidRequest(_)));
    }
}
