//! Warehouse transport over BigQuery using gcp-bigquery-client.
//!
//! Metadata comes from `tables.get`/`datasets.get` and `INFORMATION_SCHEMA`;
//! DDL and user SQL run as query jobs. Rows move through the Storage API (see
//! [`super::storage`]). A view has no storage of its own, so reading one first
//! runs its query and then reads the job's anonymous result table.

use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::Schema;
use gcp_bigquery_client::client_builder::ClientBuilder;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::table_row::TableRow;
use gcp_bigquery_client::Client;
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::api::{
    AppendRowsRequest, AppendRowsResponse, DatasetName, DatasetResource, ErrorProto, JobRequest,
    JobResource, JobState, ReadRowsResponse, ReadSessionRequest, ReadSessionResource,
    TableKind, TableListEntry, TableName, TableResource, WarehouseApi,
    WarehouseConnector, WriteStreamResource,
};
use super::arrow_wire::encode_schema;
use super::auth::{Credentials, TokenSource};
use super::cells::cell_to_string;
use super::job::JobPoller;
use super::proto_wire::ProtoSchema;
use super::sql;
use super::storage::{storage_channel, StorageTransport};
use super::types::{parse_column_type, FieldMode, FieldType, TableFieldSchema};
use crate::config::{BigqueryOptions, JobPollConfig};
use crate::error::{BigqueryError, Result};

/// Location used for region-qualified `INFORMATION_SCHEMA` when none is configured
const DEFAULT_REGION: &str = "us";

/// Translate a client error into the bridge taxonomy by HTTP status.
fn map_bq_error(err: BQError) -> BigqueryError {
    match err {
        BQError::ResponseError { error } => {
            let message = error.error.message.clone();
            match error.error.code {
                401 => BigqueryError::Auth(message),
                403 if is_quota_message(&message) => BigqueryError::Quota(message),
                403 => BigqueryError::Auth(message),
                404 => BigqueryError::NotFound(message),
                409 => BigqueryError::AlreadyExists(message),
                429 => BigqueryError::Quota(message),
                400 if message.starts_with("Already Exists") => {
                    BigqueryError::AlreadyExists(message)
                }
                400 if message.starts_with("Not found") => BigqueryError::NotFound(message),
                400 => BigqueryError::InvalidRequest(message),
                _ => BigqueryError::Transport(message),
            }
        }
        other => BigqueryError::Transport(other.to_string()),
    }
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("quota") || lower.contains("ratelimit") || lower.contains("rate limit")
}

/// Job errors of a failed query come back as 400 responses; keep their payload.
fn job_error(err: &BQError) -> Option<ErrorProto> {
    match err {
        BQError::ResponseError { error } if error.error.code == 400 => Some(ErrorProto {
            reason: error
                .error
                .errors
                .first()
                .and_then(|e| e.get("reason"))
                .cloned()
                .unwrap_or_else(|| "invalidQuery".to_string()),
            message: error.error.message.clone(),
            location: error
                .error
                .errors
                .first()
                .and_then(|e| e.get("location"))
                .cloned(),
        }),
        _ => None,
    }
}

/// REST client sharing `tokens` with the storage channels.
async fn build_client(options: &BigqueryOptions, tokens: Arc<TokenSource>) -> Result<Client> {
    let mut builder = ClientBuilder::new();
    if let Some(endpoint) = &options.api_endpoint {
        builder.with_v2_base_url(endpoint.clone());
    }
    builder
        .build_from_authenticator(tokens)
        .await
        .map_err(|e| BigqueryError::Auth(format!("Failed to create BigQuery client: {}", e)))
}

/// Warehouse transport: REST for metadata and jobs, the Storage API for rows.
pub struct GcpWarehouse {
    client: Client,
    storage: StorageTransport,
    project_id: String,
    default_location: Option<String>,
    jobs: JobPollConfig,
}

impl std::fmt::Debug for GcpWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpWarehouse")
            .field("project_id", &self.project_id)
            .field("default_location", &self.default_location)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl GcpWarehouse {
    pub fn new(client: Client, storage: StorageTransport, options: &BigqueryOptions) -> Self {
        Self {
            client,
            storage,
            project_id: options.project_id.clone(),
            default_location: options.default_location.clone(),
            jobs: options.jobs.clone(),
        }
    }

    fn region(&self) -> String {
        self.default_location
            .as_deref()
            .unwrap_or(DEFAULT_REGION)
            .to_lowercase()
    }

    /// Run a statement and collect every result row, following pagination.
    async fn query_all(&self, project_id: &str, sql_text: &str) -> Result<Vec<TableRow>> {
        let mut request = QueryRequest::new(sql_text);
        request.location = self.default_location.clone();

        let response = self
            .client
            .job()
            .query(project_id, request)
            .await
            .map_err(map_bq_error)?;

        let mut rows = response.rows.unwrap_or_default();
        let mut complete = response.job_complete.unwrap_or(true);
        let mut page_token = response.page_token;
        if complete && page_token.is_none() {
            return Ok(rows);
        }

        let job_ref = response.job_reference.ok_or_else(|| {
            BigqueryError::Decode("No job_reference in query response".to_string())
        })?;
        let job_id = job_ref
            .job_id
            .ok_or_else(|| BigqueryError::Decode("No job_id in query response".to_string()))?;

        while !complete || page_token.is_some() {
            let result = self
                .client
                .job()
                .get_query_results(
                    project_id,
                    &job_id,
                    GetQueryResultsParameters {
                        page_token: page_token.take(),
                        location: job_ref.location.clone(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(map_bq_error)?;
            complete = result.job_complete.unwrap_or(true);
            if let Some(page) = result.rows {
                rows.extend(page);
            }
            page_token = result.page_token;
        }
        Ok(rows)
    }

    /// Run DDL or DML to completion, discarding any rows.
    async fn run_statement(&self, project_id: &str, sql_text: &str) -> Result<()> {
        info!(project_id, "Running statement");
        self.query_all(project_id, sql_text).await.map(|_| ())
    }

    /// Run `query` as a job and return the anonymous table holding its result.
    async fn materialize(&self, query: String) -> Result<TableName> {
        let request = JobRequest {
            project_id: self.project_id.clone(),
            job_id: crate::id::generate_job_id(Some("bqbridge_view_")),
            query,
            location: self.default_location.clone(),
        };
        let job = self.insert_job(request).await?;
        let job = JobPoller::new(self, &self.jobs).wait(job).await?;
        let resource = self
            .client
            .job()
            .get_job(&job.project_id, &job.job_id, job.location.as_deref())
            .await
            .map_err(map_bq_error)?;
        let destination = resource
            .configuration
            .and_then(|c| c.query)
            .and_then(|q| q.destination_table)
            .ok_or_else(|| {
                BigqueryError::Decode(format!("job {} has no destination table", job.job_id))
            })?;
        debug!(job_id = %job.job_id, table = %destination.table_id, "View materialized");
        Ok(DatasetName::new(destination.project_id, destination.dataset_id)
            .table(destination.table_id))
    }
}

/// Parse the REST `schema.fields` array.
fn fields_from_json(fields: &Value) -> Result<Vec<TableFieldSchema>> {
    let Some(items) = fields.as_array() else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .map(|item| {
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| BigqueryError::Decode("schema field without name".to_string()))?;
            let type_name = item.get("type").and_then(Value::as_str).unwrap_or("STRING");
            let field_type = FieldType::from_name(type_name).unwrap_or_else(|| {
                tracing::warn!(type_name, "Unknown BigQuery type, treating as STRING");
                FieldType::String
            });
            let mode = item
                .get("mode")
                .and_then(Value::as_str)
                .and_then(FieldMode::from_name)
                .unwrap_or_default();
            let children = match item.get("fields") {
                Some(nested) => fields_from_json(nested)?,
                None => Vec::new(),
            };
            Ok(TableFieldSchema {
                name: name.to_string(),
                field_type,
                mode,
                fields: children,
            })
        })
        .collect()
}

/// Decode a `tables.get` resource.
fn table_from_json(name: &TableName, resource: &Value) -> Result<TableResource> {
    let kind = resource
        .get("type")
        .and_then(Value::as_str)
        .map(TableKind::from_table_type)
        .unwrap_or(TableKind::Table);
    let fields = match resource.pointer("/schema/fields") {
        Some(fields) => fields_from_json(fields)?,
        None => Vec::new(),
    };
    let primary_key = resource
        .pointer("/tableConstraints/primaryKey/columns")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let view_query = resource
        .pointer("/view/query")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(TableResource {
        name: name.clone(),
        kind,
        fields,
        primary_key,
        view_query,
    })
}

#[async_trait]
impl WarehouseApi for GcpWarehouse {
    #[instrument(skip(self), fields(dataset = %dataset))]
    async fn get_dataset(&self, dataset: &DatasetName) -> Result<DatasetResource> {
        let resource = self
            .client
            .dataset()
            .get(&dataset.project_id, &dataset.dataset_id)
            .await
            .map_err(map_bq_error)?;
        let location = serde_json::to_value(&resource)
            .ok()
            .and_then(|v| v.get("location").and_then(Value::as_str).map(str::to_string));
        Ok(DatasetResource {
            name: dataset.clone(),
            location,
        })
    }

    #[instrument(skip(self))]
    async fn list_datasets(&self, project_id: &str) -> Result<Vec<DatasetResource>> {
        let query_sql = format!(
            r#"
            SELECT schema_name, location
            FROM {}.{}.INFORMATION_SCHEMA.SCHEMATA
            ORDER BY schema_name
            "#,
            sql::quote_identifier(project_id),
            sql::quote_identifier(&format!("region-{}", self.region())),
        );
        let rows = self.query_all(project_id, &query_sql).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let cells = row.columns.as_ref()?;
                let name = cell_to_string(cells.first()?)?;
                Some(DatasetResource {
                    name: DatasetName::new(project_id, name),
                    location: cells.get(1).and_then(cell_to_string),
                })
            })
            .collect())
    }

    #[instrument(skip(self), fields(dataset = %dataset.name))]
    async fn insert_dataset(&self, dataset: DatasetResource) -> Result<DatasetResource> {
        self.run_statement(&dataset.name.project_id, &sql::create_schema_ddl(&dataset))
            .await?;
        Ok(dataset)
    }

    #[instrument(skip(self), fields(dataset = %dataset))]
    async fn delete_dataset(&self, dataset: &DatasetName, delete_contents: bool) -> Result<()> {
        self.run_statement(
            &dataset.project_id,
            &sql::drop_schema_ddl(dataset, delete_contents),
        )
        .await
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn get_table(&self, table: &TableName) -> Result<TableResource> {
        let resource = self
            .client
            .table()
            .get(&table.project_id, &table.dataset_id, &table.table_id, None)
            .await
            .map_err(map_bq_error)?;
        let json = serde_json::to_value(&resource)
            .map_err(|e| BigqueryError::Decode(format!("table resource: {}", e)))?;
        let mut decoded = table_from_json(table, &json)?;

        if decoded.fields.is_empty() {
            decoded.fields = self.information_schema_columns(table).await?;
        }
        // Some API versions omit constraints from tables.get
        if decoded.kind == TableKind::Table && decoded.primary_key.is_empty() {
            decoded.primary_key = self.primary_key_columns(table).await?;
        }
        Ok(decoded)
    }

    #[instrument(skip(self), fields(dataset = %dataset))]
    async fn list_tables(&self, dataset: &DatasetName) -> Result<Vec<TableListEntry>> {
        // Surface a missing dataset as NotFound rather than an empty listing
        self.get_dataset(dataset).await?;

        let query_sql = format!(
            r#"
            SELECT table_name, table_type
            FROM {}.INFORMATION_SCHEMA.TABLES
            ORDER BY table_name
            "#,
            sql::quote_dataset(dataset),
        );
        let rows = self.query_all(&dataset.project_id, &query_sql).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let cells = row.columns.as_ref()?;
                let table_id = cell_to_string(cells.first()?)?;
                let table_type =
                    cells.get(1).and_then(cell_to_string).unwrap_or_else(|| "BASE TABLE".to_string());
                Some(TableListEntry {
                    table_id,
                    kind: TableKind::from_table_type(&table_type),
                })
            })
            .collect())
    }

    #[instrument(skip(self), fields(table = %table.name))]
    async fn insert_table(&self, table: TableResource) -> Result<TableResource> {
        let ddl = sql::create_table_ddl(&table)?;
        self.run_statement(&table.name.project_id, &ddl).await?;
        Ok(table)
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn delete_table(&self, table: &TableName, kind: TableKind) -> Result<()> {
        self.run_statement(&table.project_id, &sql::drop_table_ddl(table, kind))
            .await
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    async fn insert_job(&self, request: JobRequest) -> Result<JobResource> {
        let mut query = QueryRequest::new(&request.query);
        query.location = request.location.clone();
        query.request_id = Some(request.job_id.clone());

        let response = match self.client.job().query(&request.project_id, query).await {
            Ok(response) => response,
            Err(e) => match job_error(&e) {
                Some(error_result) => {
                    return Ok(JobResource {
                        project_id: request.project_id,
                        job_id: request.job_id,
                        location: request.location,
                        state: JobState::Done,
                        error_result: Some(error_result),
                        total_rows: None,
                        num_dml_affected_rows: None,
                    })
                }
                None => return Err(map_bq_error(e)),
            },
        };

        let job_ref = response.job_reference.as_ref();
        let job_id = job_ref
            .and_then(|r| r.job_id.clone())
            .unwrap_or_else(|| request.job_id.clone());
        let location = job_ref
            .and_then(|r| r.location.clone())
            .or(request.location);
        let complete = response.job_complete.unwrap_or(false);
        debug!(job_id = %job_id, complete, "Job submitted");

        Ok(JobResource {
            project_id: request.project_id,
            job_id,
            location,
            state: if complete {
                JobState::Done
            } else {
                JobState::Running
            },
            error_result: None,
            total_rows: response.total_rows.as_deref().and_then(|s| s.parse().ok()),
            num_dml_affected_rows: response
                .num_dml_affected_rows
                .as_deref()
                .and_then(|s| s.parse().ok()),
        })
    }

    #[instrument(skip(self))]
    async fn get_job(
        &self,
        project_id: &str,
        job_id: &str,
        location: Option<&str>,
    ) -> Result<JobResource> {
        let result = self
            .client
            .job()
            .get_query_results(
                project_id,
                job_id,
                GetQueryResultsParameters {
                    location: location.map(str::to_string),
                    max_results: Some(0),
                    ..Default::default()
                },
            )
            .await;

        let (state, error_result) = match result {
            Ok(r) if r.job_complete.unwrap_or(false) => (JobState::Done, None),
            Ok(_) => (JobState::Running, None),
            Err(e) => match job_error(&e) {
                Some(err) => (JobState::Done, Some(err)),
                None => return Err(map_bq_error(e)),
            },
        };
        Ok(JobResource {
            project_id: project_id.to_string(),
            job_id: job_id.to_string(),
            location: location.map(str::to_string),
            state,
            error_result,
            total_rows: None,
            num_dml_affected_rows: None,
        })
    }

    #[instrument(skip(self, request), fields(table = %request.table))]
    async fn create_read_session(
        &self,
        request: ReadSessionRequest,
    ) -> Result<ReadSessionResource> {
        let table = self.get_table(&request.table).await?;
        let count_only = matches!(&request.selected_fields, Some(names) if names.is_empty());

        let (source, selected, restriction) = match table.kind {
            TableKind::Table => {
                let selected = match request.selected_fields {
                    // Zero-column reads still need one column to carry row counts
                    Some(names) if names.is_empty() => {
                        table.fields.iter().take(1).map(|f| f.name.clone()).collect()
                    }
                    Some(names) => names,
                    None => Vec::new(),
                };
                (request.table.clone(), selected, request.row_restriction)
            }
            // Views have no storage; read the result of querying them instead
            TableKind::View => {
                let columns = request
                    .selected_fields
                    .unwrap_or_else(|| table.fields.iter().map(|f| f.name.clone()).collect());
                let query =
                    sql::select_sql(&request.table, &columns, request.row_restriction.as_deref());
                (self.materialize(query).await?, Vec::new(), None)
            }
        };

        let mut session = self
            .storage
            .create_read_session(
                &self.project_id,
                &source,
                selected,
                restriction,
                request.max_streams,
            )
            .await?;
        session.table = request.table;
        if count_only {
            session.arrow_schema = encode_schema(&Schema::empty())?;
        }
        Ok(session)
    }

    async fn read_rows(&self, stream: &str, offset: u64) -> Result<Option<ReadRowsResponse>> {
        self.storage.read_rows(stream, offset).await
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn create_write_stream(&self, table: &TableName) -> Result<WriteStreamResource> {
        let resource = self.get_table(table).await?;
        if resource.kind == TableKind::View {
            return Err(BigqueryError::InvalidRequest(format!(
                "{table} is a view and cannot be written"
            )));
        }
        let proto = ProtoSchema::from_fields(&resource.fields);
        let name = self.storage.create_write_stream(table, &proto).await?;
        Ok(WriteStreamResource {
            name,
            table: table.clone(),
            fields: resource.fields,
        })
    }

    async fn append_rows(&self, request: AppendRowsRequest) -> Result<AppendRowsResponse> {
        self.storage.append_rows(request).await
    }

    async fn finalize_write_stream(&self, stream: &str) -> Result<u64> {
        self.storage.finalize_write_stream(stream).await
    }

    async fn batch_commit_write_streams(
        &self,
        table: &TableName,
        streams: &[String],
    ) -> Result<()> {
        self.storage.batch_commit_write_streams(table, streams).await
    }

    fn release_stream(&self, stream: &str) {
        self.storage.release(stream);
    }
}

impl GcpWarehouse {
    /// NOT ENFORCED primary key columns, in key order.
    async fn primary_key_columns(&self, table: &TableName) -> Result<Vec<String>> {
        let query_sql = format!(
            r#"
            SELECT k.column_name
            FROM {ds}.INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
            JOIN {ds}.INFORMATION_SCHEMA.TABLE_CONSTRAINTS c
                ON k.constraint_name = c.constraint_name
                AND k.table_name = c.table_name
            WHERE c.constraint_type = 'PRIMARY KEY'
                AND k.table_name = {table}
            ORDER BY k.ordinal_position
            "#,
            ds = sql::quote_dataset(&table.dataset()),
            table = sql::quote_string(&table.table_id),
        );
        let rows = self.query_all(&table.project_id, &query_sql).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.columns.as_ref()?.first().and_then(cell_to_string))
            .collect())
    }

    /// Column list of a table from `INFORMATION_SCHEMA.COLUMNS`, including
    /// nested types, for tables whose REST resource omits the schema.
    async fn information_schema_columns(&self, table: &TableName) -> Result<Vec<TableFieldSchema>> {
        let query_sql = format!(
            r#"
            SELECT column_name, data_type, is_nullable
            FROM {}.INFORMATION_SCHEMA.COLUMNS
            WHERE table_name = {}
            ORDER BY ordinal_position
            "#,
            sql::quote_dataset(&table.dataset()),
            sql::quote_string(&table.table_id),
        );
        let rows = self.query_all(&table.project_id, &query_sql).await?;
        rows.iter()
            .filter_map(|row| {
                let cells = row.columns.as_ref()?;
                let name = cell_to_string(cells.first()?)?;
                let data_type = cells
                    .get(1)
                    .and_then(cell_to_string)
                    .unwrap_or_else(|| "STRING".to_string());
                let nullable = cells
                    .get(2)
                    .and_then(cell_to_string)
                    .map(|s| s.to_uppercase() == "YES")
                    .unwrap_or(true);
                Some(parse_column_type(&name, &data_type, nullable))
            })
            .collect()
    }
}

/// Connects clients to BigQuery over REST and the Storage API.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcpConnector;

#[async_trait]
impl WarehouseConnector for GcpConnector {
    async fn connect(
        &self,
        options: &BigqueryOptions,
        credentials: &Credentials,
    ) -> Result<Arc<dyn WarehouseApi>> {
        let tokens = TokenSource::from_credentials(credentials).await?;
        let channel = storage_channel(options.grpc_endpoint.as_deref())?;
        let client = build_client(options, Arc::clone(&tokens)).await?;
        let storage = StorageTransport::new(channel, tokens);
        Ok(Arc::new(GcpWarehouse::new(client, storage, options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_from_json() {
        let name = DatasetName::new("p", "d").table("t");
        let resource = json!({
            "type": "TABLE",
            "schema": {"fields": [
                {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
                {"name": "tags", "type": "STRING", "mode": "REPEATED"},
                {"name": "point", "type": "RECORD", "fields": [
                    {"name": "x", "type": "FLOAT"}
                ]}
            ]},
            "tableConstraints": {"primaryKey": {"columns": ["id"]}}
        });

        let table = table_from_json(&name, &resource).unwrap();
        assert_eq!(table.kind, TableKind::Table);
        assert_eq!(table.fields.len(), 3);
        assert_eq!(table.fields[0].field_type, FieldType::Int64);
        assert_eq!(table.fields[0].mode, FieldMode::Required);
        assert!(table.fields[1].is_repeated());
        assert_eq!(table.fields[2].fields[0].field_type, FieldType::Float64);
        assert_eq!(table.primary_key, vec!["id".to_string()]);
    }

    #[test]
    fn test_view_from_json() {
        let name = DatasetName::new("p", "d").table("v");
        let resource = json!({
            "type": "VIEW",
            "schema": {"fields": [{"name": "a", "type": "STRING"}]},
            "view": {"query": "SELECT 'x' AS a"}
        });
        let table = table_from_json(&name, &resource).unwrap();
        assert_eq!(table.kind, TableKind::View);
        assert_eq!(table.view_query.as_deref(), Some("SELECT 'x' AS a"));
    }

    #[tokio::test]
    async fn test_connector_rejects_bad_key_before_connecting() {
        let mut options = BigqueryOptions::new("p");
        options.api_endpoint = Some("http://127.0.0.1:9050/bigquery/v2".to_string());
        options.grpc_endpoint = Some("http://127.0.0.1:9060".to_string());
        let err = GcpConnector
            .connect(&options, &Credentials::ServiceAccountKey("[]".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, BigqueryError::Auth(_)), "{err}");
    }

    #[test]
    fn test_quota_message_detection() {
        assert!(is_quota_message("Exceeded rate limits: too many table update operations"));
        assert!(is_quota_message("Quota exceeded: Your project exceeded quota"));
        assert!(!is_quota_message("Access Denied: Table p:d.t"));
    }
}
