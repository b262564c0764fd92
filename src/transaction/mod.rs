//! Per-connection transactions over an attached warehouse database.
//!
//! The warehouse has no multi-statement transactions. Commit and rollback are
//! local bookkeeping: they end the transaction and release its client, but
//! they never undo DDL, jobs or committed writes already sent to the
//! warehouse. The transaction boundary only decides whether mutating
//! operations are permitted, not whether they are reversible.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catalog::BigqueryCatalog;
use crate::client::{BigqueryClient, JobResource};
use crate::config::AccessMode;
use crate::error::{BigqueryError, Result};
use crate::id::generate_transaction_id;
use crate::reader::BigqueryArrowReader;
use crate::writer::BigqueryProtoWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// One connection's transaction. Owns the warehouse client for its lifetime;
/// the client is built on first use.
#[derive(Debug)]
pub struct BigqueryTransaction {
    id: String,
    catalog: Arc<BigqueryCatalog>,
    access_mode: AccessMode,
    implicit: bool,
    client: OnceCell<BigqueryClient>,
    state: Mutex<TransactionState>,
}

impl BigqueryTransaction {
    fn new(catalog: Arc<BigqueryCatalog>, access_mode: AccessMode, implicit: bool) -> Self {
        Self {
            id: generate_transaction_id(),
            catalog,
            access_mode,
            implicit,
            client: OnceCell::new(),
            state: Mutex::new(TransactionState::Active),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn catalog(&self) -> &Arc<BigqueryCatalog> {
        &self.catalog
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn is_read_only(&self) -> bool {
        self.access_mode == AccessMode::ReadOnly
    }

    /// Started automatically for a single statement rather than by `begin`
    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap()
    }

    pub fn ensure_active(&self) -> Result<()> {
        match self.state() {
            TransactionState::Active => Ok(()),
            finished => Err(BigqueryError::State(format!(
                "transaction {} is {:?}",
                self.id, finished
            ))),
        }
    }

    /// Fail fast, before any remote call, when `operation` would mutate a
    /// read-only database.
    pub fn require_writable(&self, operation: &str) -> Result<()> {
        self.ensure_active()?;
        if self.is_read_only() {
            return Err(BigqueryError::ReadOnly(format!(
                "cannot {operation} in read-only transaction on database '{}'",
                self.catalog.name()
            )));
        }
        Ok(())
    }

    /// The transaction's client, connecting on first call.
    pub async fn client(&self) -> Result<&BigqueryClient> {
        self.ensure_active()?;
        self.client
            .get_or_try_init(|| async {
                debug!(transaction = %self.id, database = %self.catalog.name(), "Connecting client");
                self.catalog.connect().await
            })
            .await
    }

    pub fn has_client(&self) -> bool {
        self.client.initialized()
    }

    /// Run SQL as a warehouse job. Rejected in read-only transactions.
    pub async fn execute_query(&self, sql: &str, location: Option<&str>) -> Result<JobResource> {
        self.execute_query_with_cancel(sql, location, CancellationToken::new())
            .await
    }

    pub async fn execute_query_with_cancel(
        &self,
        sql: &str,
        location: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<JobResource> {
        self.require_writable("execute queries")?;
        self.client()
            .await?
            .execute_query_with_cancel(sql, location, cancel)
            .await
    }

    /// Read sessions are allowed in either access mode.
    pub async fn create_arrow_reader(
        &self,
        dataset_id: &str,
        table_id: &str,
        max_streams: usize,
        columns: Option<Vec<String>>,
        row_restriction: Option<String>,
    ) -> Result<BigqueryArrowReader> {
        self.client()
            .await?
            .create_arrow_reader(dataset_id, table_id, max_streams, columns, row_restriction)
            .await
    }

    pub async fn create_proto_writer(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<BigqueryProtoWriter> {
        self.require_writable("write to tables")?;
        self.client()
            .await?
            .create_proto_writer(dataset_id, table_id)
            .await
    }

    fn finish(&self, outcome: TransactionState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != TransactionState::Active {
            return Err(BigqueryError::State(format!(
                "transaction {} is already {:?}",
                self.id, *state
            )));
        }
        *state = outcome;
        Ok(())
    }
}

/// Tracks the single active transaction of each connection to one attached
/// database.
#[derive(Debug)]
pub struct BigqueryTransactionManager {
    catalog: Arc<BigqueryCatalog>,
    transactions: Mutex<HashMap<String, Arc<BigqueryTransaction>>>,
}

impl BigqueryTransactionManager {
    pub fn new(catalog: Arc<BigqueryCatalog>) -> Self {
        Self {
            catalog,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<BigqueryCatalog> {
        &self.catalog
    }

    /// Start an explicit transaction. `access_mode` can narrow the attached
    /// mode to read-only but never widen it.
    pub fn begin(
        &self,
        connection_id: &str,
        access_mode: Option<AccessMode>,
    ) -> Result<Arc<BigqueryTransaction>> {
        let attached = self.catalog.access_mode();
        let mode = match (attached, access_mode) {
            (AccessMode::ReadOnly, Some(AccessMode::ReadWrite)) => {
                return Err(BigqueryError::ReadOnly(format!(
                    "database '{}' is attached read-only",
                    self.catalog.name()
                )))
            }
            (_, Some(requested)) => requested,
            (attached, None) => attached,
        };

        let mut transactions = self.transactions.lock().unwrap();
        if let Some(existing) = transactions.get(connection_id) {
            if !existing.is_implicit() {
                return Err(BigqueryError::State(format!(
                    "connection {connection_id} already has active transaction {}",
                    existing.id()
                )));
            }
        }
        let transaction = Arc::new(BigqueryTransaction::new(
            Arc::clone(&self.catalog),
            mode,
            false,
        ));
        debug!(connection_id, transaction = %transaction.id(), %mode, "Begin transaction");
        transactions.insert(connection_id.to_string(), Arc::clone(&transaction));
        Ok(transaction)
    }

    /// The connection's active transaction, starting an implicit one with the
    /// attached access mode if there is none.
    pub fn current(&self, connection_id: &str) -> Arc<BigqueryTransaction> {
        let mut transactions = self.transactions.lock().unwrap();
        let transaction = transactions
            .entry(connection_id.to_string())
            .or_insert_with(|| {
                Arc::new(BigqueryTransaction::new(
                    Arc::clone(&self.catalog),
                    self.catalog.access_mode(),
                    true,
                ))
            });
        Arc::clone(transaction)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<BigqueryTransaction>> {
        self.transactions.lock().unwrap().get(connection_id).cloned()
    }

    /// End the connection's transaction. Nothing already sent to the warehouse
    /// is affected.
    pub fn commit(&self, connection_id: &str) -> Result<()> {
        self.end(connection_id, TransactionState::Committed)
    }

    /// End the connection's transaction. Statements already issued stay
    /// durable; only further mutations through it are prevented.
    pub fn rollback(&self, connection_id: &str) -> Result<()> {
        self.end(connection_id, TransactionState::RolledBack)
    }

    /// Commit the connection's transaction if it was started implicitly.
    pub fn finish_implicit(&self, connection_id: &str) -> Result<()> {
        let implicit = self
            .get(connection_id)
            .map(|t| t.is_implicit())
            .unwrap_or(false);
        if implicit {
            self.commit(connection_id)?;
        }
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    fn end(&self, connection_id: &str, outcome: TransactionState) -> Result<()> {
        let transaction = self
            .transactions
            .lock()
            .unwrap()
            .remove(connection_id)
            .ok_or_else(|| {
                BigqueryError::State(format!(
                    "connection {connection_id} has no active transaction"
                ))
            })?;
        transaction.finish(outcome)?;
        debug!(connection_id, transaction = %transaction.id(), ?outcome, "End transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Credentials, InMemoryWarehouse, MemoryConnector};
    use crate::config::BigqueryOptions;
    use crate::error::ErrorKind;

    fn setup(
        mode: AccessMode,
    ) -> (
        Arc<InMemoryWarehouse>,
        Arc<MemoryConnector>,
        BigqueryTransactionManager,
    ) {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let connector = Arc::new(MemoryConnector::new(warehouse.clone()));
        let catalog = Arc::new(BigqueryCatalog::new(
            "db1",
            BigqueryOptions::new("p").with_access_mode(mode),
            Credentials::ApplicationDefault,
            connector.clone(),
        ));
        (warehouse, connector, BigqueryTransactionManager::new(catalog))
    }

    #[tokio::test]
    async fn test_client_is_built_lazily_once() {
        let (_warehouse, connector, manager) = setup(AccessMode::ReadWrite);
        let tx = manager.begin("c1", None).unwrap();
        assert!(!tx.has_client());
        assert_eq!(connector.connect_count(), 0);

        tx.client().await.unwrap();
        tx.client().await.unwrap();
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_read_only_rejects_before_remote_calls() {
        let (warehouse, connector, manager) = setup(AccessMode::ReadOnly);
        let tx = manager.current("c1");

        let err = tx.execute_query("CREATE TABLE ds.t1 (a INT64)", None).await.unwrap_err();
        assert!(matches!(err, BigqueryError::ReadOnly(_)));
        assert!(err.to_string().contains("permission denied"));

        let err = tx.create_proto_writer("ds", "t").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Binding);

        assert_eq!(warehouse.calls().total(), 0);
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_read_only_begin_narrows_mode() {
        let (_warehouse, _connector, manager) = setup(AccessMode::ReadWrite);
        let tx = manager.begin("c1", Some(AccessMode::ReadOnly)).unwrap();
        assert!(tx.is_read_only());

        let (_warehouse, _connector, ro) = setup(AccessMode::ReadOnly);
        let err = ro.begin("c1", Some(AccessMode::ReadWrite)).unwrap_err();
        assert!(matches!(err, BigqueryError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_one_transaction_per_connection() {
        let (_warehouse, _connector, manager) = setup(AccessMode::ReadWrite);
        manager.begin("c1", None).unwrap();
        assert!(manager.begin("c1", None).is_err());
        manager.begin("c2", None).unwrap();
        assert_eq!(manager.active_count(), 2);

        manager.commit("c1").unwrap();
        assert!(manager.commit("c1").is_err());
        manager.begin("c1", None).unwrap();
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_use() {
        let (_warehouse, _connector, manager) = setup(AccessMode::ReadWrite);
        let tx = manager.begin("c1", None).unwrap();
        manager.rollback("c1").unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(tx.client().await.unwrap_err().kind(), ErrorKind::State);
    }

    #[tokio::test]
    async fn test_rollback_does_not_undo_issued_ddl() {
        let (warehouse, _connector, manager) = setup(AccessMode::ReadWrite);
        let tx = manager.begin("c1", None).unwrap();
        tx.execute_query("CREATE TABLE ds.t1 (a INT64)", None)
            .await
            .unwrap();
        manager.rollback("c1").unwrap();
        assert_eq!(warehouse.executed_queries().len(), 1);
    }

    #[tokio::test]
    async fn test_implicit_transactions_finish() {
        let (_warehouse, _connector, manager) = setup(AccessMode::ReadWrite);
        let tx = manager.current("c1");
        assert!(tx.is_implicit());
        assert!(Arc::ptr_eq(&tx, &manager.current("c1")));

        manager.finish_implicit("c1").unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(manager.get("c1").is_none());

        let explicit = manager.begin("c1", None).unwrap();
        manager.finish_implicit("c1").unwrap();
        assert_eq!(explicit.state(), TransactionState::Active);
    }
}
