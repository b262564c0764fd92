//! The warehouse RPC surface the bridge speaks, independent of transport.
//!
//! Resources mirror the published REST/Storage API shapes closely enough that
//! each transport only has to move bytes. Columnar payloads are bare Arrow IPC
//! messages and write payloads are serialized proto rows.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::auth::Credentials;
use super::types::TableFieldSchema;
use crate::config::BigqueryOptions;
use crate::error::{BigqueryError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetName {
    pub project_id: String,
    pub dataset_id: String,
}

impl DatasetName {
    pub fn new(project_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
        }
    }

    pub fn table(&self, table_id: impl Into<String>) -> TableName {
        TableName {
            project_id: self.project_id.clone(),
            dataset_id: self.dataset_id.clone(),
            table_id: table_id.into(),
        }
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project_id, self.dataset_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableName {
    pub fn dataset(&self) -> DatasetName {
        DatasetName::new(&self.project_id, &self.dataset_id)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetResource {
    pub name: DatasetName,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    Table,
    View,
}

impl TableKind {
    /// Parse INFORMATION_SCHEMA.TABLES.table_type
    pub fn from_table_type(table_type: &str) -> Self {
        if table_type.to_uppercase().contains("VIEW") {
            TableKind::View
        } else {
            TableKind::Table
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableResource {
    pub name: TableName,
    pub kind: TableKind,
    pub fields: Vec<TableFieldSchema>,
    /// Columns of the NOT ENFORCED primary key, in key order
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Defining query, views only
    pub view_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableListEntry {
    pub table_id: String,
    pub kind: TableKind,
}

/// Remote job status enum; wire values are `PENDING`, `RUNNING`, `DONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl JobState {
    pub fn from_wire(state: &str) -> Result<Self> {
        match state {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "DONE" => Ok(JobState::Done),
            other => Err(BigqueryError::Decode(format!("unknown job state '{other}'"))),
        }
    }
}

/// Error payload of a failed job, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorProto {
    pub reason: String,
    pub message: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub project_id: String,
    pub job_id: String,
    pub query: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResource {
    pub project_id: String,
    pub job_id: String,
    pub location: Option<String>,
    pub state: JobState,
    /// Set when a DONE job failed
    pub error_result: Option<ErrorProto>,
    pub total_rows: Option<u64>,
    pub num_dml_affected_rows: Option<u64>,
}

impl JobResource {
    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSessionRequest {
    pub table: TableName,
    /// Upper bound; the warehouse may return fewer streams
    pub max_streams: usize,
    /// Selected columns in output order; `None` reads all columns
    pub selected_fields: Option<Vec<String>>,
    /// SQL predicate the warehouse may apply. Not guaranteed: callers re-filter.
    pub row_restriction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStreamInfo {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ReadSessionResource {
    pub name: String,
    pub table: TableName,
    /// Arrow IPC schema message shared by every stream of the session
    pub arrow_schema: Vec<u8>,
    pub streams: Vec<ReadStreamInfo>,
}

#[derive(Debug, Clone)]
pub struct ReadRowsResponse {
    pub row_count: u64,
    /// Arrow IPC record batch message; absent for zero-column reads
    pub arrow_record_batch: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStreamResource {
    pub name: String,
    pub table: TableName,
    pub fields: Vec<TableFieldSchema>,
}

#[derive(Debug, Clone)]
pub struct AppendRowsRequest {
    pub write_stream: String,
    /// Stream offset of the first row; appends at the wrong offset are rejected
    pub offset: u64,
    pub serialized_rows: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Index within the request
    pub index: usize,
    pub message: String,
}

/// A request with any row errors appends nothing.
#[derive(Debug, Clone, Default)]
pub struct AppendRowsResponse {
    pub row_errors: Vec<RowError>,
}

#[async_trait]
pub trait WarehouseApi: Send + Sync + fmt::Debug {
    async fn get_dataset(&self, dataset: &DatasetName) -> Result<DatasetResource>;

    async fn list_datasets(&self, project_id: &str) -> Result<Vec<DatasetResource>>;

    async fn insert_dataset(&self, dataset: DatasetResource) -> Result<DatasetResource>;

    async fn delete_dataset(&self, dataset: &DatasetName, delete_contents: bool) -> Result<()>;

    async fn get_table(&self, table: &TableName) -> Result<TableResource>;

    async fn list_tables(&self, dataset: &DatasetName) -> Result<Vec<TableListEntry>>;

    async fn insert_table(&self, table: TableResource) -> Result<TableResource>;

    async fn delete_table(&self, table: &TableName, kind: TableKind) -> Result<()>;

    async fn insert_job(&self, request: JobRequest) -> Result<JobResource>;

    async fn get_job(
        &self,
        project_id: &str,
        job_id: &str,
        location: Option<&str>,
    ) -> Result<JobResource>;

    async fn create_read_session(&self, request: ReadSessionRequest)
        -> Result<ReadSessionResource>;

    /// Next response of a read stream starting at row `offset`; `None` at end of stream.
    async fn read_rows(&self, stream: &str, offset: u64) -> Result<Option<ReadRowsResponse>>;

    /// Pending stream: rows stay invisible until batch-committed.
    async fn create_write_stream(&self, table: &TableName) -> Result<WriteStreamResource>;

    async fn append_rows(&self, request: AppendRowsRequest) -> Result<AppendRowsResponse>;

    /// Returns the final row count of the stream.
    async fn finalize_write_stream(&self, stream: &str) -> Result<u64>;

    async fn batch_commit_write_streams(&self, table: &TableName, streams: &[String])
        -> Result<()>;

    /// Drop client-side state held for a read or write stream the caller abandoned.
    fn release_stream(&self, _stream: &str) {}
}

/// Builds a transport for one client handle.
#[async_trait]
pub trait WarehouseConnector: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        options: &BigqueryOptions,
        credentials: &Credentials,
    ) -> Result<Arc<dyn WarehouseApi>>;
}
