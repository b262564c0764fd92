//! Error types for warehouse bridging operations

use std::ops::Range;
use std::time::Duration;

use datafusion::arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use thiserror::Error;

pub type Result<T, E = BigqueryError> = std::result::Result<T, E>;

/// Coarse error category, used by callers that only care about how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected locally before any remote call
    Binding,
    /// Auth, network or quota failure talking to the warehouse
    Transport,
    /// Object missing, already present, or request malformed
    Schema,
    /// Remote job failed, timed out or was abandoned
    Execution,
    /// Some appended rows were not durably accepted
    PartialWrite,
    /// Operation not valid in the current object state
    State,
    /// Wire decoding or type conversion failure
    Codec,
}

/// Errors that can occur while talking to the warehouse
#[derive(Debug, Error)]
pub enum BigqueryError {
    /// Unknown attached database, wrong catalog type, bad arguments
    #[error("binding failed: {0}")]
    Binding(String),

    /// Mutating operation attempted in a read-only transaction
    #[error("permission denied: {0}")]
    ReadOnly(String),

    /// Column type with no warehouse counterpart
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// Credentials rejected or could not be loaded
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network or server-side failure
    #[error("transport failed: {0}")]
    Transport(String),

    /// Rate limit or quota exceeded; safe to retry with backoff
    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Remote job reached DONE with an error result
    #[error("job {job_id} failed ({reason}): {message}")]
    JobFailed {
        job_id: String,
        reason: String,
        message: String,
    },

    /// Job did not reach a terminal state within the polling budget
    #[error("job {job_id} did not finish within {waited:?}")]
    JobTimeout { job_id: String, waited: Duration },

    /// Polling was abandoned; the remote job keeps running
    #[error("job {job_id} polling cancelled")]
    JobCancelled { job_id: String },

    #[error(transparent)]
    PartialWrite(#[from] PartialWriteError),

    #[error("invalid state: {0}")]
    State(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("datafusion error: {0}")]
    DataFusion(#[from] DataFusionError),
}

/// Rows of a write stream the warehouse did not accept.
///
/// `failed_offsets` is the half-open range of stream offsets that were not
/// durably appended. Everything below `accepted_rows` is safe.
#[derive(Debug, Error)]
#[error(
    "write to stream {stream} failed at offsets {}..{} ({} rows accepted): {cause}",
    failed_offsets.start,
    failed_offsets.end,
    accepted_rows
)]
pub struct PartialWriteError {
    pub stream: String,
    pub accepted_rows: u64,
    pub failed_offsets: Range<u64>,
    /// Per-row rejections reported by the warehouse, keyed by stream offset
    pub row_errors: Vec<(u64, String)>,
    pub cause: String,
}

impl BigqueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Binding(_) | Self::ReadOnly(_) | Self::UnsupportedType(_) => ErrorKind::Binding,
            Self::Auth(_) | Self::Transport(_) | Self::Quota(_) => ErrorKind::Transport,
            Self::NotFound(_) | Self::AlreadyExists(_) | Self::InvalidRequest(_) => {
                ErrorKind::Schema
            }
            Self::JobFailed { .. } | Self::JobTimeout { .. } | Self::JobCancelled { .. } => {
                ErrorKind::Execution
            }
            Self::PartialWrite(_) => ErrorKind::PartialWrite,
            Self::State(_) => ErrorKind::State,
            Self::Decode(_) | Self::Arrow(_) | Self::DataFusion(_) => ErrorKind::Codec,
        }
    }

    /// Only quota errors are worth retrying; everything else fails the same way twice.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Quota(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<prost::DecodeError> for BigqueryError {
    fn from(e: prost::DecodeError) -> Self {
        BigqueryError::Decode(e.to_string())
    }
}

impl From<BigqueryError> for DataFusionError {
    fn from(e: BigqueryError) -> Self {
        match e {
            BigqueryError::DataFusion(inner) => inner,
            other => DataFusionError::External(Box::new(other)),
        }
    }
}
