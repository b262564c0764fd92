pub mod catalog;
pub mod client;
pub mod config;
pub mod datafusion;
mod engine;
pub mod error;
pub mod id;
pub mod reader;
pub mod telemetry;
pub mod transaction;
pub mod writer;

pub use catalog::BigqueryCatalog;
pub use client::{BigqueryClient, Credentials};
pub use config::{AccessMode, BigqueryOptions};
pub use engine::{BigqueryEngine, BigqueryEngineBuilder, QueryResponse};
pub use error::{BigqueryError, ErrorKind, PartialWriteError};
pub use transaction::{BigqueryTransaction, BigqueryTransactionManager, TransactionState};
