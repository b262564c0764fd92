//! BigQuery Storage Read and Write APIs over gRPC.
//!
//! Reads open an Arrow read session and follow each stream's server-streamed
//! responses. Writes go through PENDING streams: appended rows stay invisible
//! until the streams are finalized and committed together, so a commit either
//! makes every stream visible or none of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use gcp_bigquery_client::auth::Authenticator;
use gcp_bigquery_client::google::cloud::bigquery::storage::v1 as wire;
use gcp_bigquery_client::google::cloud::bigquery::storage::v1::big_query_read_client::BigQueryReadClient;
use gcp_bigquery_client::google::cloud::bigquery::storage::v1::big_query_write_client::BigQueryWriteClient;
use prost_types::DescriptorProto;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::{Code, Status, Streaming};
use tracing::{debug, instrument};

use super::api::{
    AppendRowsRequest, AppendRowsResponse, ReadRowsResponse, ReadSessionResource,
    ReadStreamInfo, RowError, TableName,
};
use super::proto_wire::ProtoSchema;
use crate::error::{BigqueryError, Result};

pub const STORAGE_API_URL: &str = "https://bigquerystorage.googleapis.com";

/// `projects/{p}/datasets/{d}/tables/{t}`
pub fn table_path(table: &TableName) -> String {
    format!(
        "projects/{}/datasets/{}/tables/{}",
        table.project_id, table.dataset_id, table.table_id
    )
}

/// Lazily connected channel to the storage endpoint. `https` endpoints get
/// TLS with the native roots for their host; plain `http` is left as is.
pub fn storage_channel(endpoint: Option<&str>) -> Result<Channel> {
    let url = endpoint.unwrap_or(STORAGE_API_URL);
    let mut builder = Channel::from_shared(url.to_string()).map_err(|e| {
        BigqueryError::InvalidRequest(format!("storage endpoint '{url}' is not a URI: {e}"))
    })?;
    if builder.uri().scheme_str() == Some("https") {
        let host = builder.uri().host().unwrap_or_default().to_string();
        let tls = ClientTlsConfig::new().domain_name(host).with_native_roots();
        builder = builder
            .tls_config(tls)
            .map_err(|e| BigqueryError::Transport(format!("storage TLS setup: {e}")))?;
    }
    Ok(builder.connect_lazy())
}

pub(crate) fn map_code(code: Code, message: String) -> BigqueryError {
    match code {
        Code::NotFound => BigqueryError::NotFound(message),
        Code::AlreadyExists => BigqueryError::AlreadyExists(message),
        Code::PermissionDenied | Code::Unauthenticated => BigqueryError::Auth(message),
        Code::ResourceExhausted => BigqueryError::Quota(message),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            BigqueryError::InvalidRequest(message)
        }
        _ => BigqueryError::Transport(message),
    }
}

fn map_status(status: Status) -> BigqueryError {
    map_code(status.code(), status.message().to_string())
}

/// Row errors reject the whole request; any other error status fails the call.
fn append_outcome(response: wire::AppendRowsResponse) -> Result<AppendRowsResponse> {
    if !response.row_errors.is_empty() {
        let row_errors = response
            .row_errors
            .into_iter()
            .map(|e| RowError {
                index: e.index.max(0) as usize,
                message: e.message,
            })
            .collect();
        return Ok(AppendRowsResponse { row_errors });
    }
    match response.response {
        Some(wire::append_rows_response::Response::AppendResult(_)) => {
            Ok(AppendRowsResponse::default())
        }
        Some(wire::append_rows_response::Response::Error(status)) => {
            Err(map_code(Code::from_i32(status.code), status.message))
        }
        None => Err(BigqueryError::Transport(
            "append response carried no result".to_string(),
        )),
    }
}

/// A commit with stream errors commits nothing.
fn commit_outcome(response: wire::BatchCommitWriteStreamsResponse) -> Result<()> {
    if !response.stream_errors.is_empty() {
        let details: Vec<String> = response
            .stream_errors
            .iter()
            .map(|e| format!("{}: {}", e.entity, e.error_message))
            .collect();
        return Err(BigqueryError::InvalidRequest(format!(
            "batch commit rejected: {}",
            details.join("; ")
        )));
    }
    if response.commit_time.is_none() {
        return Err(BigqueryError::Transport(
            "batch commit returned no commit time".to_string(),
        ));
    }
    Ok(())
}

fn session_resource(session: wire::ReadSession, table: TableName) -> Result<ReadSessionResource> {
    let arrow_schema = match session.schema {
        Some(wire::read_session::Schema::ArrowSchema(schema)) => schema.serialized_schema,
        _ => {
            return Err(BigqueryError::Decode(format!(
                "read session {} has no Arrow schema",
                session.name
            )))
        }
    };
    Ok(ReadSessionResource {
        name: session.name,
        table,
        arrow_schema,
        streams: session
            .streams
            .into_iter()
            .map(|s| ReadStreamInfo { name: s.name })
            .collect(),
    })
}

/// Open server stream of one read stream, positioned after `position` rows.
struct ReadCursor {
    position: u64,
    responses: Streaming<wire::ReadRowsResponse>,
}

/// Storage API clients plus the per-stream state a connection keeps.
pub struct StorageTransport {
    read: BigQueryReadClient<Channel>,
    write: BigQueryWriteClient<Channel>,
    auth: Arc<dyn Authenticator>,
    cursors: Mutex<HashMap<String, ReadCursor>>,
    descriptors: Mutex<HashMap<String, DescriptorProto>>,
}

impl std::fmt::Debug for StorageTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageTransport")
            .field("open_cursors", &self.cursors.lock().map(|c| c.len()).unwrap_or(0))
            .field(
                "open_write_streams",
                &self.descriptors.lock().map(|d| d.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl StorageTransport {
    pub fn new(channel: Channel, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            read: BigQueryReadClient::new(channel.clone()),
            write: BigQueryWriteClient::new(channel),
            auth,
            cursors: Mutex::new(HashMap::new()),
            descriptors: Mutex::new(HashMap::new()),
        }
    }

    fn cursors(&self) -> Result<MutexGuard<'_, HashMap<String, ReadCursor>>> {
        self.cursors
            .lock()
            .map_err(|_| BigqueryError::State("read cursor registry poisoned".to_string()))
    }

    fn descriptors(&self) -> Result<MutexGuard<'_, HashMap<String, DescriptorProto>>> {
        self.descriptors
            .lock()
            .map_err(|_| BigqueryError::State("write stream registry poisoned".to_string()))
    }

    async fn authorized<T>(&self, message: T) -> Result<tonic::Request<T>> {
        let token = self
            .auth
            .access_token()
            .await
            .map_err(|e| BigqueryError::Auth(e.to_string()))?;
        let bearer = MetadataValue::<Ascii>::try_from(format!("Bearer {token}"))
            .map_err(|_| BigqueryError::Auth("access token is not valid header text".to_string()))?;
        let mut request = tonic::Request::new(message);
        request.metadata_mut().insert("authorization", bearer);
        Ok(request)
    }

    /// Arrow read session over `table`, billed to `project_id`.
    #[instrument(skip(self, selected_fields, row_restriction), fields(table = %table))]
    pub async fn create_read_session(
        &self,
        project_id: &str,
        table: &TableName,
        selected_fields: Vec<String>,
        row_restriction: Option<String>,
        max_streams: usize,
    ) -> Result<ReadSessionResource> {
        let request = wire::CreateReadSessionRequest {
            parent: format!("projects/{project_id}"),
            read_session: Some(wire::ReadSession {
                table: table_path(table),
                data_format: wire::DataFormat::Arrow as i32,
                read_options: Some(wire::read_session::TableReadOptions {
                    selected_fields,
                    row_restriction: row_restriction.unwrap_or_default(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            max_stream_count: i32::try_from(max_streams).unwrap_or(i32::MAX),
            ..Default::default()
        };
        let session = self
            .read
            .clone()
            .create_read_session(self.authorized(request).await?)
            .await
            .map_err(map_status)?
            .into_inner();
        debug!(session = %session.name, streams = session.streams.len(), "Read session created");
        session_resource(session, table.clone())
    }

    async fn open_cursor(&self, stream: &str, offset: u64) -> Result<ReadCursor> {
        let request = wire::ReadRowsRequest {
            read_stream: stream.to_string(),
            offset: offset as i64,
        };
        let responses = self
            .read
            .clone()
            .read_rows(self.authorized(request).await?)
            .await
            .map_err(map_status)?
            .into_inner();
        Ok(ReadCursor {
            position: offset,
            responses,
        })
    }

    /// Next batch of `stream` at `offset`. A cursor at a different position is
    /// reopened there.
    pub async fn read_rows(&self, stream: &str, offset: u64) -> Result<Option<ReadRowsResponse>> {
        let existing = self.cursors()?.remove(stream);
        let mut cursor = match existing {
            Some(cursor) if cursor.position == offset => cursor,
            _ => self.open_cursor(stream, offset).await?,
        };

        loop {
            let Some(response) = cursor.responses.message().await.map_err(map_status)? else {
                // Exhausted: the cursor is not put back
                return Ok(None);
            };
            match response.rows {
                Some(wire::read_rows_response::Rows::ArrowRecordBatch(batch)) => {
                    let row_count = response.row_count.max(0) as u64;
                    cursor.position += row_count;
                    self.cursors()?.insert(stream.to_string(), cursor);
                    return Ok(Some(ReadRowsResponse {
                        row_count,
                        arrow_record_batch: Some(batch.serialized_record_batch),
                    }));
                }
                Some(wire::read_rows_response::Rows::AvroRows(_)) => {
                    return Err(BigqueryError::Decode(format!(
                        "stream {stream} returned Avro rows"
                    )))
                }
                // Progress-only responses
                None => continue,
            }
        }
    }

    /// PENDING write stream on `table`; rows are invisible until committed.
    #[instrument(skip(self, proto), fields(table = %table))]
    pub async fn create_write_stream(&self, table: &TableName, proto: &ProtoSchema) -> Result<String> {
        let request = wire::CreateWriteStreamRequest {
            parent: table_path(table),
            write_stream: Some(wire::WriteStream {
                r#type: wire::write_stream::Type::Pending as i32,
                ..Default::default()
            }),
        };
        let stream = self
            .write
            .clone()
            .create_write_stream(self.authorized(request).await?)
            .await
            .map_err(map_status)?
            .into_inner();
        self.descriptors()?
            .insert(stream.name.clone(), proto.descriptor());
        Ok(stream.name)
    }

    /// One append at an explicit offset; a retried offset is rejected rather than duplicated.
    pub async fn append_rows(&self, request: AppendRowsRequest) -> Result<AppendRowsResponse> {
        let descriptor = self
            .descriptors()?
            .get(&request.write_stream)
            .cloned()
            .ok_or_else(|| {
                BigqueryError::NotFound(format!("Write stream {}", request.write_stream))
            })?;
        let message = wire::AppendRowsRequest {
            write_stream: request.write_stream,
            offset: Some(request.offset as i64),
            rows: Some(wire::append_rows_request::Rows::ProtoRows(
                wire::append_rows_request::ProtoData {
                    writer_schema: Some(wire::ProtoSchema {
                        proto_descriptor: Some(descriptor),
                    }),
                    rows: Some(wire::ProtoRows {
                        serialized_rows: request.serialized_rows,
                    }),
                },
            )),
            ..Default::default()
        };
        let outbound = self
            .authorized(futures::stream::iter(vec![message]))
            .await?;
        let mut responses = self
            .write
            .clone()
            .append_rows(outbound)
            .await
            .map_err(map_status)?
            .into_inner();
        let response = responses.message().await.map_err(map_status)?.ok_or_else(|| {
            BigqueryError::Transport("append stream closed without a response".to_string())
        })?;
        append_outcome(response)
    }

    pub async fn finalize_write_stream(&self, stream: &str) -> Result<u64> {
        let request = wire::FinalizeWriteStreamRequest {
            name: stream.to_string(),
        };
        let response = self
            .write
            .clone()
            .finalize_write_stream(self.authorized(request).await?)
            .await
            .map_err(map_status)?
            .into_inner();
        Ok(response.row_count.max(0) as u64)
    }

    #[instrument(skip(self, streams), fields(table = %table, streams = streams.len()))]
    pub async fn batch_commit_write_streams(
        &self,
        table: &TableName,
        streams: &[String],
    ) -> Result<()> {
        let request = wire::BatchCommitWriteStreamsRequest {
            parent: table_path(table),
            write_streams: streams.to_vec(),
        };
        let response = self
            .write
            .clone()
            .batch_commit_write_streams(self.authorized(request).await?)
            .await
            .map_err(map_status)?
            .into_inner();
        commit_outcome(response)?;
        let mut descriptors = self.descriptors()?;
        for stream in streams {
            descriptors.remove(stream);
        }
        Ok(())
    }

    pub fn release(&self, stream: &str) {
        if let Ok(mut cursors) = self.cursors.lock() {
            cursors.remove(stream);
        }
        if let Ok(mut descriptors) = self.descriptors.lock() {
            descriptors.remove(stream);
        }
    }

    #[cfg(test)]
    fn open_streams(&self) -> usize {
        self.cursors.lock().unwrap().len() + self.descriptors.lock().unwrap().len()
    }
}
