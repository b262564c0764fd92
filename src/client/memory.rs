//! In-process warehouse for tests and local development.
//!
//! Implements the full `WarehouseApi` surface against in-memory state, counts
//! every call, and can be scripted to fail or delay so the bridging layer can
//! be exercised without a network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::catalog::{
    CatalogProvider, MemTable, MemoryCatalogProvider, MemorySchemaProvider, SchemaProvider,
};
use datafusion::common::ScalarValue;
use datafusion::prelude::{SessionConfig, SessionContext};

use super::api::{
    AppendRowsRequest, AppendRowsResponse, DatasetName, DatasetResource, ErrorProto, JobRequest,
    JobResource, JobState, ReadRowsResponse, ReadSessionRequest, ReadSessionResource,
    ReadStreamInfo, RowError, TableKind, TableListEntry, TableName, TableResource, WarehouseApi,
    WarehouseConnector, WriteStreamResource,
};
use super::arrow_wire::{encode_batch, encode_schema};
use super::auth::Credentials;
use super::proto_wire::ProtoSchema;
use super::types::{fields_to_schema, schema_to_fields, FieldMode};
use crate::config::BigqueryOptions;
use crate::error::{BigqueryError, Result};

/// Number of calls made to each RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get_dataset: usize,
    pub list_datasets: usize,
    pub insert_dataset: usize,
    pub delete_dataset: usize,
    pub get_table: usize,
    pub list_tables: usize,
    pub insert_table: usize,
    pub delete_table: usize,
    pub insert_job: usize,
    pub get_job: usize,
    pub create_read_session: usize,
    pub read_rows: usize,
    pub create_write_stream: usize,
    pub append_rows: usize,
    pub finalize_write_stream: usize,
    pub batch_commit_write_streams: usize,
    pub release_stream: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.get_dataset
            + self.list_datasets
            + self.insert_dataset
            + self.delete_dataset
            + self.get_table
            + self.list_tables
            + self.insert_table
            + self.delete_table
            + self.insert_job
            + self.get_job
            + self.create_read_session
            + self.read_rows
            + self.create_write_stream
            + self.append_rows
            + self.finalize_write_stream
            + self.batch_commit_write_streams
    }
}

#[derive(Debug)]
struct StoredTable {
    resource: TableResource,
    batches: Vec<RecordBatch>,
}

#[derive(Debug)]
struct StoredJob {
    resource: JobResource,
    /// Polls left before DONE; `None` never finishes
    polls_remaining: Option<u32>,
    outcome: Option<ErrorProto>,
}

#[derive(Debug)]
struct ReadStream {
    batches: Vec<RecordBatch>,
}

#[derive(Debug)]
struct PendingStream {
    table: TableName,
    proto: ProtoSchema,
    schema: SchemaRef,
    rows: Vec<Vec<ScalarValue>>,
    finalized: bool,
    committed: bool,
}

#[derive(Debug, Default)]
struct Script {
    polls_until_done: u32,
    hang_jobs: bool,
    job_failures: Vec<(String, ErrorProto)>,
    poll_failures: u32,
    append_failures: VecDeque<BigqueryError>,
    metadata_failures: VecDeque<BigqueryError>,
    get_table_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<DatasetName, DatasetResource>,
    tables: BTreeMap<TableName, StoredTable>,
    jobs: HashMap<String, StoredJob>,
    read_streams: HashMap<String, ReadStream>,
    write_streams: HashMap<String, PendingStream>,
    executed: Vec<String>,
}

/// Warehouse state shared by every client connected to it.
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    state: Mutex<State>,
    script: Mutex<Script>,
    calls: Mutex<CallCounts>,
    next_id: AtomicUsize,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, f: impl FnOnce(&mut CallCounts)) {
        f(&mut self.calls.lock().unwrap());
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Snapshot of call counters.
    pub fn calls(&self) -> CallCounts {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        *self.calls.lock().unwrap() = CallCounts::default();
    }

    /// SQL text of every submitted job, in order.
    pub fn executed_queries(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    /// Jobs report RUNNING for `polls` status calls before DONE.
    pub fn set_polls_until_done(&self, polls: u32) {
        self.script.lock().unwrap().polls_until_done = polls;
    }

    /// Jobs never leave RUNNING.
    pub fn set_hang_jobs(&self, hang: bool) {
        self.script.lock().unwrap().hang_jobs = hang;
    }

    /// Jobs whose SQL contains `pattern` finish DONE with the given error result.
    pub fn fail_jobs_matching(&self, pattern: &str, reason: &str, message: &str) {
        self.script.lock().unwrap().job_failures.push((
            pattern.to_string(),
            ErrorProto {
                reason: reason.to_string(),
                message: message.to_string(),
                location: None,
            },
        ));
    }

    /// The next `count` job status calls fail with a quota error.
    pub fn fail_next_polls(&self, count: u32) {
        self.script.lock().unwrap().poll_failures = count;
    }

    /// The next append call fails with `error` without appending anything.
    pub fn fail_next_append(&self, error: BigqueryError) {
        self.script.lock().unwrap().append_failures.push_back(error);
    }

    /// The next dataset or table metadata call fails with `error`.
    pub fn fail_next_metadata(&self, error: BigqueryError) {
        self.script.lock().unwrap().metadata_failures.push_back(error);
    }

    /// Delay table metadata responses, to widen race windows in tests.
    pub fn set_get_table_delay(&self, delay: Option<Duration>) {
        self.script.lock().unwrap().get_table_delay = delay;
    }

    /// Create a dataset directly, bypassing call counters.
    pub fn seed_dataset(&self, dataset: DatasetName) {
        self.state.lock().unwrap().datasets.insert(
            dataset.clone(),
            DatasetResource {
                name: dataset,
                location: None,
            },
        );
    }

    /// Create a table with data directly, bypassing call counters.
    pub fn seed_table(&self, resource: TableResource, batches: Vec<RecordBatch>) {
        let mut state = self.state.lock().unwrap();
        let dataset = resource.name.dataset();
        state
            .datasets
            .entry(dataset.clone())
            .or_insert(DatasetResource {
                name: dataset,
                location: None,
            });
        state
            .tables
            .insert(resource.name.clone(), StoredTable { resource, batches });
    }

    /// Committed rows of a table.
    pub fn table_batches(&self, table: &TableName) -> Vec<RecordBatch> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.batches.clone())
            .unwrap_or_default()
    }

    pub fn table_row_count(&self, table: &TableName) -> usize {
        self.table_batches(table).iter().map(|b| b.num_rows()).sum()
    }

    /// Write streams neither committed nor released.
    pub fn open_write_streams(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .write_streams
            .values()
            .filter(|s| !s.committed)
            .count()
    }

    /// Every table of `project_id` with its committed rows.
    fn snapshot_project(&self, project_id: &str) -> Vec<(TableResource, Vec<RecordBatch>)> {
        self.state
            .lock()
            .unwrap()
            .tables
            .values()
            .filter(|t| t.resource.name.project_id == project_id && t.resource.kind == TableKind::Table)
            .map(|t| (t.resource.clone(), t.batches.clone()))
            .collect()
    }

    /// Evaluate a view's query over the current contents of its project.
    async fn evaluate_view(&self, view: &TableName, query: &str) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let catalog = MemoryCatalogProvider::new();
        let mut schemas: BTreeMap<String, Arc<MemorySchemaProvider>> = BTreeMap::new();
        for (resource, batches) in self.snapshot_project(&view.project_id) {
            let schema = Arc::new(fields_to_schema(&resource.fields));
            let table = MemTable::try_new(schema, vec![batches])?;
            schemas
                .entry(resource.name.dataset_id.clone())
                .or_insert_with(|| Arc::new(MemorySchemaProvider::new()))
                .register_table(resource.name.table_id.clone(), Arc::new(table))?;
        }
        schemas
            .entry(view.dataset_id.clone())
            .or_insert_with(|| Arc::new(MemorySchemaProvider::new()));
        for (name, schema) in schemas {
            catalog.register_schema(&name, schema)?;
        }

        let config = SessionConfig::new()
            .with_default_catalog_and_schema(view.project_id.as_str(), view.dataset_id.as_str());
        let ctx = SessionContext::new_with_config(config);
        ctx.register_catalog(view.project_id.as_str(), Arc::new(catalog));

        let frame = ctx.sql(query).await.map_err(|e| {
            BigqueryError::InvalidRequest(format!("view {view} has an invalid query: {e}"))
        })?;
        let schema = Arc::clone(frame.schema().inner());
        let batches = frame.collect().await?;
        Ok((schema, batches))
    }

    fn job_outcome(&self, sql: &str) -> (Option<u32>, Option<ErrorProto>) {
        let script = self.script.lock().unwrap();
        let outcome = script
            .job_failures
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, err)| err.clone());
        let polls = if script.hang_jobs {
            None
        } else {
            Some(script.polls_until_done)
        };
        (polls, outcome)
    }
}

fn table_missing(table: &TableName) -> BigqueryError {
    BigqueryError::NotFound(format!("Table {table}"))
}

fn dataset_missing(dataset: &DatasetName) -> BigqueryError {
    BigqueryError::NotFound(format!("Dataset {dataset}"))
}

#[async_trait]
impl WarehouseApi for InMemoryWarehouse {
    async fn get_dataset(&self, dataset: &DatasetName) -> Result<DatasetResource> {
        self.record(|c| c.get_dataset += 1);
        if let Some(err) = self.script.lock().unwrap().metadata_failures.pop_front() {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        state
            .datasets
            .get(dataset)
            .cloned()
            .ok_or_else(|| dataset_missing(dataset))
    }

    async fn list_datasets(&self, project_id: &str) -> Result<Vec<DatasetResource>> {
        self.record(|c| c.list_datasets += 1);
        let state = self.state.lock().unwrap();
        Ok(state
            .datasets
            .values()
            .filter(|d| d.name.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_dataset(&self, dataset: DatasetResource) -> Result<DatasetResource> {
        self.record(|c| c.insert_dataset += 1);
        let mut state = self.state.lock().unwrap();
        if state.datasets.contains_key(&dataset.name) {
            return Err(BigqueryError::AlreadyExists(format!(
                "Dataset {}",
                dataset.name
            )));
        }
        state.datasets.insert(dataset.name.clone(), dataset.clone());
        Ok(dataset)
    }

    async fn delete_dataset(&self, dataset: &DatasetName, delete_contents: bool) -> Result<()> {
        self.record(|c| c.delete_dataset += 1);
        let mut state = self.state.lock().unwrap();
        if !state.datasets.contains_key(dataset) {
            return Err(dataset_missing(dataset));
        }
        let contained: Vec<TableName> = state
            .tables
            .keys()
            .filter(|t| &t.dataset() == dataset)
            .cloned()
            .collect();
        if !contained.is_empty() && !delete_contents {
            return Err(BigqueryError::InvalidRequest(format!(
                "Dataset {dataset} is still in use"
            )));
        }
        for table in contained {
            state.tables.remove(&table);
        }
        state.datasets.remove(dataset);
        Ok(())
    }

    async fn get_table(&self, table: &TableName) -> Result<TableResource> {
        self.record(|c| c.get_table += 1);
        let (delay, failure) = {
            let mut script = self.script.lock().unwrap();
            (script.get_table_delay, script.metadata_failures.pop_front())
        };
        if let Some(err) = failure {
            return Err(err);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .map(|t| t.resource.clone())
            .ok_or_else(|| table_missing(table))
    }

    async fn list_tables(&self, dataset: &DatasetName) -> Result<Vec<TableListEntry>> {
        self.record(|c| c.list_tables += 1);
        let state = self.state.lock().unwrap();
        if !state.datasets.contains_key(dataset) {
            return Err(dataset_missing(dataset));
        }
        Ok(state
            .tables
            .values()
            .filter(|t| &t.resource.name.dataset() == dataset)
            .map(|t| TableListEntry {
                table_id: t.resource.name.table_id.clone(),
                kind: t.resource.kind,
            })
            .collect())
    }

    async fn insert_table(&self, mut table: TableResource) -> Result<TableResource> {
        self.record(|c| c.insert_table += 1);
        if table.kind == TableKind::View && table.fields.is_empty() {
            let query = table.view_query.clone().ok_or_else(|| {
                BigqueryError::InvalidRequest(format!("view {} has no query", table.name))
            })?;
            let (schema, _) = self.evaluate_view(&table.name, &query).await?;
            table.fields = schema_to_fields(&schema)?;
        }
        let mut state = self.state.lock().unwrap();
        let dataset = table.name.dataset();
        if !state.datasets.contains_key(&dataset) {
            return Err(dataset_missing(&dataset));
        }
        if state.tables.contains_key(&table.name) {
            return Err(BigqueryError::AlreadyExists(format!("Table {}", table.name)));
        }
        for key in &table.primary_key {
            if !table.fields.iter().any(|f| &f.name == key) {
                return Err(BigqueryError::InvalidRequest(format!(
                    "primary key column '{key}' is not in table {}",
                    table.name
                )));
            }
        }
        state.tables.insert(
            table.name.clone(),
            StoredTable {
                resource: table.clone(),
                batches: Vec::new(),
            },
        );
        Ok(table)
    }

    async fn delete_table(&self, table: &TableName, kind: TableKind) -> Result<()> {
        self.record(|c| c.delete_table += 1);
        let mut state = self.state.lock().unwrap();
        match state.tables.get(table) {
            None => Err(table_missing(table)),
            Some(stored) if stored.resource.kind != kind => Err(BigqueryError::InvalidRequest(
                format!("{table} is a {:?}, not a {kind:?}", stored.resource.kind),
            )),
            Some(_) => {
                state.tables.remove(table);
                Ok(())
            }
        }
    }

    async fn insert_job(&self, request: JobRequest) -> Result<JobResource> {
        self.record(|c| c.insert_job += 1);
        let (polls_remaining, outcome) = self.job_outcome(&request.query);
        let done = polls_remaining == Some(0);
        let resource = JobResource {
            project_id: request.project_id,
            job_id: request.job_id.clone(),
            location: request.location,
            state: if done { JobState::Done } else { JobState::Pending },
            error_result: if done { outcome.clone() } else { None },
            total_rows: None,
            num_dml_affected_rows: None,
        };
        let mut state = self.state.lock().unwrap();
        if state.jobs.contains_key(&request.job_id) {
            return Err(BigqueryError::AlreadyExists(format!(
                "Job {}",
                request.job_id
            )));
        }
        state.executed.push(request.query);
        state.jobs.insert(
            request.job_id,
            StoredJob {
                resource: resource.clone(),
                polls_remaining,
                outcome,
            },
        );
        Ok(resource)
    }

    async fn get_job(
        &self,
        _project_id: &str,
        job_id: &str,
        _location: Option<&str>,
    ) -> Result<JobResource> {
        self.record(|c| c.get_job += 1);
        {
            let mut script = self.script.lock().unwrap();
            if script.poll_failures > 0 {
                script.poll_failures -= 1;
                return Err(BigqueryError::Quota("rateLimitExceeded".to_string()));
            }
        }
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BigqueryError::NotFound(format!("Job {job_id}")))?;
        match job.polls_remaining {
            Some(0) | Some(1) => {
                job.polls_remaining = Some(0);
                job.resource.state = JobState::Done;
                job.resource.error_result = job.outcome.clone();
            }
            Some(n) => {
                job.polls_remaining = Some(n - 1);
                job.resource.state = JobState::Running;
            }
            None => job.resource.state = JobState::Running,
        }
        Ok(job.resource.clone())
    }

    async fn create_read_session(
        &self,
        request: ReadSessionRequest,
    ) -> Result<ReadSessionResource> {
        self.record(|c| c.create_read_session += 1);
        let session_name = format!("sessions/{}", self.next_id());
        let (resource, stored_batches) = {
            let state = self.state.lock().unwrap();
            let stored = state
                .tables
                .get(&request.table)
                .ok_or_else(|| table_missing(&request.table))?;
            (stored.resource.clone(), stored.batches.clone())
        };
        let (full_schema, source_batches) = match (&resource.kind, &resource.view_query) {
            (TableKind::View, Some(query)) => self.evaluate_view(&request.table, query).await?,
            (TableKind::View, None) => {
                return Err(BigqueryError::InvalidRequest(format!(
                    "view {} has no query",
                    request.table
                )))
            }
            (TableKind::Table, _) => (Arc::new(fields_to_schema(&resource.fields)), stored_batches),
        };

        let indices: Vec<usize> = match &request.selected_fields {
            None => (0..full_schema.fields().len()).collect(),
            Some(names) => names
                .iter()
                .map(|n| {
                    full_schema.index_of(n).map_err(|_| {
                        BigqueryError::InvalidRequest(format!(
                            "column '{n}' is not in {}",
                            request.table
                        ))
                    })
                })
                .collect::<Result<_>>()?,
        };
        let schema = full_schema.project(&indices)?;
        let batches = source_batches
            .iter()
            .filter(|b| b.num_rows() > 0)
            .map(|b| b.project(&indices))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Row restrictions are ignored; callers always re-filter.
        let stream_count = request.max_streams.max(1).min(batches.len());
        let mut assigned: Vec<Vec<RecordBatch>> = vec![Vec::new(); stream_count];
        for (i, batch) in batches.into_iter().enumerate() {
            assigned[i % stream_count].push(batch);
        }

        let mut state = self.state.lock().unwrap();
        let mut streams = Vec::with_capacity(stream_count);
        for (i, batches) in assigned.into_iter().enumerate() {
            let name = format!("{session_name}/streams/{i}");
            state
                .read_streams
                .insert(name.clone(), ReadStream { batches });
            streams.push(ReadStreamInfo { name });
        }

        Ok(ReadSessionResource {
            name: session_name,
            table: request.table,
            arrow_schema: encode_schema(&schema)?,
            streams,
        })
    }

    async fn read_rows(&self, stream: &str, offset: u64) -> Result<Option<ReadRowsResponse>> {
        self.record(|c| c.read_rows += 1);
        let batch = {
            let state = self.state.lock().unwrap();
            let read = state
                .read_streams
                .get(stream)
                .ok_or_else(|| BigqueryError::NotFound(format!("Read stream {stream}")))?;
            let mut start = 0u64;
            let mut found = None;
            for batch in &read.batches {
                if start == offset {
                    found = Some(batch.clone());
                    break;
                }
                start += batch.num_rows() as u64;
            }
            match found {
                Some(batch) => batch,
                None if start == offset => return Ok(None),
                None => {
                    return Err(BigqueryError::InvalidRequest(format!(
                        "offset {offset} is not a response boundary of {stream}"
                    )))
                }
            }
        };
        let arrow_record_batch = if batch.num_columns() == 0 {
            None
        } else {
            Some(encode_batch(&batch)?)
        };
        Ok(Some(ReadRowsResponse {
            row_count: batch.num_rows() as u64,
            arrow_record_batch,
        }))
    }

    async fn create_write_stream(&self, table: &TableName) -> Result<WriteStreamResource> {
        self.record(|c| c.create_write_stream += 1);
        let name = format!("{table}/streams/w{}", self.next_id());
        let mut state = self.state.lock().unwrap();
        let stored = state.tables.get(table).ok_or_else(|| table_missing(table))?;
        if stored.resource.kind == TableKind::View {
            return Err(BigqueryError::InvalidRequest(format!(
                "{table} is a view and cannot be written"
            )));
        }
        let fields = stored.resource.fields.clone();
        state.write_streams.insert(
            name.clone(),
            PendingStream {
                table: table.clone(),
                proto: ProtoSchema::from_fields(&fields),
                schema: Arc::new(fields_to_schema(&fields)),
                rows: Vec::new(),
                finalized: false,
                committed: false,
            },
        );
        Ok(WriteStreamResource {
            name,
            table: table.clone(),
            fields,
        })
    }

    async fn append_rows(&self, request: AppendRowsRequest) -> Result<AppendRowsResponse> {
        self.record(|c| c.append_rows += 1);
        if let Some(err) = self.script.lock().unwrap().append_failures.pop_front() {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        let stream = state
            .write_streams
            .get_mut(&request.write_stream)
            .ok_or_else(|| {
                BigqueryError::NotFound(format!("Write stream {}", request.write_stream))
            })?;
        if stream.finalized {
            return Err(BigqueryError::InvalidRequest(format!(
                "Write stream {} is finalized",
                request.write_stream
            )));
        }
        if request.offset != stream.rows.len() as u64 {
            return Err(BigqueryError::InvalidRequest(format!(
                "offset {} does not match stream length {}",
                request.offset,
                stream.rows.len()
            )));
        }

        let mut decoded = Vec::with_capacity(request.serialized_rows.len());
        let mut row_errors = Vec::new();
        for (index, bytes) in request.serialized_rows.iter().enumerate() {
            match stream.proto.decode_row(bytes) {
                Ok(values) => {
                    let missing = stream
                        .proto
                        .columns()
                        .zip(&values)
                        .find(|(col, v)| col.mode == FieldMode::Required && v.is_null());
                    if let Some((col, _)) = missing {
                        row_errors.push(RowError {
                            index,
                            message: format!("missing required field '{}'", col.name),
                        });
                    } else {
                        decoded.push(values);
                    }
                }
                Err(e) => row_errors.push(RowError {
                    index,
                    message: e.to_string(),
                }),
            }
        }
        if row_errors.is_empty() {
            stream.rows.extend(decoded);
        }
        Ok(AppendRowsResponse { row_errors })
    }

    async fn finalize_write_stream(&self, stream: &str) -> Result<u64> {
        self.record(|c| c.finalize_write_stream += 1);
        let mut state = self.state.lock().unwrap();
        let pending = state
            .write_streams
            .get_mut(stream)
            .ok_or_else(|| BigqueryError::NotFound(format!("Write stream {stream}")))?;
        pending.finalized = true;
        Ok(pending.rows.len() as u64)
    }

    async fn batch_commit_write_streams(
        &self,
        table: &TableName,
        streams: &[String],
    ) -> Result<()> {
        self.record(|c| c.batch_commit_write_streams += 1);
        let mut state = self.state.lock().unwrap();

        let mut batches = Vec::new();
        for name in streams {
            let pending = state
                .write_streams
                .get(name)
                .ok_or_else(|| BigqueryError::NotFound(format!("Write stream {name}")))?;
            if &pending.table != table {
                return Err(BigqueryError::InvalidRequest(format!(
                    "stream {name} belongs to {}",
                    pending.table
                )));
            }
            if !pending.finalized || pending.committed {
                return Err(BigqueryError::InvalidRequest(format!(
                    "stream {name} is not finalized or already committed"
                )));
            }
            if !pending.rows.is_empty() {
                batches.push(rows_to_batch(&pending.schema, &pending.rows)?);
            }
        }

        let stored = state.tables.get_mut(table).ok_or_else(|| table_missing(table))?;
        stored.batches.extend(batches);
        for name in streams {
            if let Some(pending) = state.write_streams.get_mut(name) {
                pending.committed = true;
            }
        }
        Ok(())
    }

    fn release_stream(&self, stream: &str) {
        self.record(|c| c.release_stream += 1);
        let mut state = self.state.lock().unwrap();
        if state.write_streams.get(stream).is_some_and(|s| !s.committed) {
            state.write_streams.remove(stream);
        }
    }
}

fn rows_to_batch(schema: &SchemaRef, rows: &[Vec<ScalarValue>]) -> Result<RecordBatch> {
    let columns = (0..schema.fields().len())
        .map(|i| ScalarValue::iter_to_array(rows.iter().map(|r| r[i].clone())))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
}

/// Hands out the shared warehouse to every client.
#[derive(Debug)]
pub struct MemoryConnector {
    warehouse: Arc<InMemoryWarehouse>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(warehouse: Arc<InMemoryWarehouse>) -> Self {
        Self {
            warehouse,
            connects: AtomicUsize::new(0),
        }
    }

    /// How many client handles have been built.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WarehouseConnector for MemoryConnector {
    async fn connect(
        &self,
        _options: &BigqueryOptions,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn WarehouseApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.warehouse.clone() as Arc<dyn WarehouseApi>)
    }
}
