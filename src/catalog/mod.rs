//! Metadata catalog for one attached warehouse database.
//!
//! Datasets, tables and their listings are fetched lazily on first lookup and
//! cached until a local DDL statement invalidates them. Entries are never
//! refreshed on a timer, so changes made outside this process stay invisible
//! until the affected entry is invalidated.

mod cache;
mod entry;

pub use cache::SingleFlightCache;
pub use entry::{table_resource, BigqueryDatasetRef, BigqueryTableRef};

use std::sync::Arc;

use datafusion::arrow::datatypes::Schema;
use datafusion::common::Constraints;
use tracing::debug;

use crate::client::{BigqueryClient, Credentials, TableListEntry, WarehouseConnector};
use crate::config::{AccessMode, BigqueryOptions};
use crate::error::Result;
use crate::transaction::BigqueryTransaction;

type TableKey = (String, String);

#[derive(Debug)]
pub struct BigqueryCatalog {
    name: String,
    options: Arc<BigqueryOptions>,
    credentials: Credentials,
    connector: Arc<dyn WarehouseConnector>,
    datasets: SingleFlightCache<String, BigqueryDatasetRef>,
    dataset_list: SingleFlightCache<(), Vec<BigqueryDatasetRef>>,
    tables: SingleFlightCache<TableKey, BigqueryTableRef>,
    table_lists: SingleFlightCache<String, Vec<TableListEntry>>,
}

impl BigqueryCatalog {
    pub fn new(
        name: impl Into<String>,
        options: BigqueryOptions,
        credentials: Credentials,
        connector: Arc<dyn WarehouseConnector>,
    ) -> Self {
        Self {
            name: name.into(),
            options: Arc::new(options),
            credentials,
            connector,
            datasets: SingleFlightCache::new(),
            dataset_list: SingleFlightCache::new(),
            tables: SingleFlightCache::new(),
            table_lists: SingleFlightCache::new(),
        }
    }

    /// Name the database was attached under
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Arc<BigqueryOptions> {
        &self.options
    }

    pub fn access_mode(&self) -> AccessMode {
        self.options.access_mode
    }

    /// Dataset used for unqualified table names, if configured.
    pub fn default_dataset(&self) -> Option<&str> {
        self.options.dataset_id.as_deref()
    }

    /// Build a fresh client with this database's options and credentials.
    pub async fn connect(&self) -> Result<BigqueryClient> {
        BigqueryClient::connect(
            Arc::clone(&self.options),
            &self.credentials,
            self.connector.as_ref(),
        )
        .await
    }

    pub async fn lookup_dataset(
        &self,
        client: &BigqueryClient,
        dataset_id: &str,
    ) -> Result<Arc<BigqueryDatasetRef>> {
        let key = dataset_id.to_string();
        if let Some(hit) = self.datasets.get(&key) {
            debug!(database = %self.name, dataset_id, "Dataset cache hit");
            return Ok(hit);
        }
        self.datasets
            .get_or_try_fetch(&key, || async {
                debug!(database = %self.name, dataset_id, "Dataset cache miss");
                client.get_dataset(dataset_id).await
            })
            .await
    }

    /// A missing table is a `NotFound` error.
    pub async fn lookup_table(
        &self,
        client: &BigqueryClient,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<Arc<BigqueryTableRef>> {
        let key = (dataset_id.to_string(), table_id.to_string());
        if let Some(hit) = self.tables.get(&key) {
            debug!(database = %self.name, dataset_id, table_id, "Table cache hit");
            return Ok(hit);
        }
        self.tables
            .get_or_try_fetch(&key, || async {
                debug!(database = %self.name, dataset_id, table_id, "Table cache miss");
                client.get_table(dataset_id, table_id).await
            })
            .await
    }

    pub async fn list_datasets(
        &self,
        client: &BigqueryClient,
    ) -> Result<Arc<Vec<BigqueryDatasetRef>>> {
        self.dataset_list
            .get_or_try_fetch(&(), || client.get_datasets())
            .await
    }

    pub async fn list_tables(
        &self,
        client: &BigqueryClient,
        dataset_id: &str,
    ) -> Result<Arc<Vec<TableListEntry>>> {
        self.table_lists
            .get_or_try_fetch(&dataset_id.to_string(), || client.get_tables(dataset_id))
            .await
    }

    /// Evict the entries a DDL statement on `dataset_id` (or one of its
    /// tables) made stale.
    pub fn invalidate(&self, dataset_id: &str, table_id: Option<&str>) {
        match table_id {
            Some(table_id) => {
                debug!(database = %self.name, dataset_id, table_id, "Invalidating table");
                self.tables
                    .invalidate(&(dataset_id.to_string(), table_id.to_string()));
                self.table_lists.invalidate(&dataset_id.to_string());
            }
            None => self.invalidate_dataset(dataset_id),
        }
    }

    /// Evict a dataset along with every table under it.
    pub fn invalidate_dataset(&self, dataset_id: &str) {
        debug!(database = %self.name, dataset_id, "Invalidating dataset");
        self.datasets.invalidate(&dataset_id.to_string());
        self.tables.invalidate_where(|(ds, _)| ds == dataset_id);
        self.table_lists.invalidate(&dataset_id.to_string());
        self.dataset_list.clear();
    }

    pub fn clear_cache(&self) {
        self.datasets.clear();
        self.dataset_list.clear();
        self.tables.clear();
        self.table_lists.clear();
    }

    pub async fn create_dataset(
        &self,
        transaction: &BigqueryTransaction,
        dataset_id: &str,
        location: Option<&str>,
    ) -> Result<Arc<BigqueryDatasetRef>> {
        transaction.require_writable("create datasets")?;
        let result = transaction
            .client()
            .await?
            .create_dataset(dataset_id, location)
            .await;
        self.invalidate_dataset(dataset_id);
        let created = result?;
        self.datasets.insert(dataset_id.to_string(), created.clone());
        Ok(Arc::new(created))
    }

    pub async fn drop_dataset(
        &self,
        transaction: &BigqueryTransaction,
        dataset_id: &str,
        cascade: bool,
    ) -> Result<()> {
        transaction.require_writable("drop datasets")?;
        let result = transaction
            .client()
            .await?
            .drop_dataset(dataset_id, cascade)
            .await;
        self.invalidate_dataset(dataset_id);
        result
    }

    pub async fn create_table(
        &self,
        transaction: &BigqueryTransaction,
        dataset_id: &str,
        table_id: &str,
        schema: &Schema,
        constraints: &Constraints,
    ) -> Result<Arc<BigqueryTableRef>> {
        transaction.require_writable("create tables")?;
        let result = transaction
            .client()
            .await?
            .create_table(dataset_id, table_id, schema, constraints)
            .await;
        self.invalidate(dataset_id, Some(table_id));
        let created = result?;
        self.tables
            .insert((dataset_id.to_string(), table_id.to_string()), created.clone());
        Ok(Arc::new(created))
    }

    pub async fn create_view(
        &self,
        transaction: &BigqueryTransaction,
        dataset_id: &str,
        view_id: &str,
        query: &str,
    ) -> Result<()> {
        transaction.require_writable("create views")?;
        let result = transaction
            .client()
            .await?
            .create_view(dataset_id, view_id, query)
            .await;
        self.invalidate(dataset_id, Some(view_id));
        result
    }

    pub async fn drop_table(
        &self,
        transaction: &BigqueryTransaction,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<()> {
        transaction.require_writable("drop tables")?;
        let result = transaction
            .client()
            .await?
            .drop_table(dataset_id, table_id)
            .await;
        self.invalidate(dataset_id, Some(table_id));
        result
    }

    pub async fn drop_view(
        &self,
        transaction: &BigqueryTransaction,
        dataset_id: &str,
        view_id: &str,
    ) -> Result<()> {
        transaction.require_writable("drop views")?;
        let result = transaction
            .client()
            .await?
            .drop_view(dataset_id, view_id)
            .await;
        self.invalidate(dataset_id, Some(view_id));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DatasetName, InMemoryWarehouse, MemoryConnector};
    use crate::transaction::BigqueryTransactionManager;
    use datafusion::arrow::datatypes::{DataType, Field};
    use std::time::Duration;

    fn setup(mode: AccessMode) -> (Arc<InMemoryWarehouse>, Arc<BigqueryTransactionManager>) {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        warehouse.seed_dataset(DatasetName::new("p", "ds"));
        let catalog = Arc::new(BigqueryCatalog::new(
            "db1",
            BigqueryOptions::new("p").with_access_mode(mode),
            Credentials::ApplicationDefault,
            Arc::new(MemoryConnector::new(warehouse.clone())),
        ));
        (warehouse, Arc::new(BigqueryTransactionManager::new(catalog)))
    }

    fn schema() -> Schema {
        Schema::new(vec![Field::new("a", DataType::Int64, true)])
    }

    #[tokio::test]
    async fn test_second_lookup_is_a_cache_hit() {
        let (warehouse, manager) = setup(AccessMode::ReadWrite);
        let tx = manager.current("c1");
        let catalog = manager.catalog();
        catalog
            .create_table(&tx, "ds", "t", &schema(), &Constraints::default())
            .await
            .unwrap();
        catalog.invalidate("ds", Some("t"));
        warehouse.reset_calls();

        let client = tx.client().await.unwrap();
        let first = catalog.lookup_table(client, "ds", "t").await.unwrap();
        let second = catalog.lookup_table(client, "ds", "t").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(warehouse.calls().get_table, 1);

        catalog.lookup_dataset(client, "ds").await.unwrap();
        catalog.lookup_dataset(client, "ds").await.unwrap();
        assert_eq!(warehouse.calls().get_dataset, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_issue_one_fetch() {
        let (warehouse, manager) = setup(AccessMode::ReadWrite);
        let tx = manager.current("c1");
        let catalog = Arc::clone(manager.catalog());
        catalog
            .create_table(&tx, "ds", "t", &schema(), &Constraints::default())
            .await
            .unwrap();
        catalog.clear_cache();
        warehouse.reset_calls();
        warehouse.set_get_table_delay(Some(Duration::from_millis(50)));

        let client = tx.client().await.unwrap().clone();
        let lookups = (0..4).map(|_| {
            let catalog = Arc::clone(&catalog);
            let client = client.clone();
            tokio::spawn(async move { catalog.lookup_table(&client, "ds", "t").await })
        });
        for handle in futures::future::join_all(lookups).await {
            handle.unwrap().unwrap();
        }
        assert_eq!(warehouse.calls().get_table, 1);
    }

    #[tokio::test]
    async fn test_ddl_invalidates_stale_entries() {
        let (_warehouse, manager) = setup(AccessMode::ReadWrite);
        let tx = manager.current("c1");
        let catalog = manager.catalog();
        let client = tx.client().await.unwrap();

        assert!(catalog
            .lookup_table(client, "ds", "t")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(catalog.list_tables(client, "ds").await.unwrap().is_empty());

        catalog
            .create_table(&tx, "ds", "t", &schema(), &Constraints::default())
            .await
            .unwrap();
        assert!(catalog.lookup_table(client, "ds", "t").await.is_ok());
        assert_eq!(catalog.list_tables(client, "ds").await.unwrap().len(), 1);

        catalog.drop_table(&tx, "ds", "t").await.unwrap();
        assert!(catalog
            .lookup_table(client, "ds", "t")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_dropping_dataset_evicts_its_tables() {
        let (_warehouse, manager) = setup(AccessMode::ReadWrite);
        let tx = manager.current("c1");
        let catalog = manager.catalog();
        let client = tx.client().await.unwrap();

        catalog.create_dataset(&tx, "other", None).await.unwrap();
        catalog
            .create_table(&tx, "other", "t", &schema(), &Constraints::default())
            .await
            .unwrap();
        catalog
            .create_table(&tx, "ds", "t", &schema(), &Constraints::default())
            .await
            .unwrap();
        assert_eq!(catalog.list_datasets(client).await.unwrap().len(), 2);

        catalog.drop_dataset(&tx, "other", true).await.unwrap();
        assert!(catalog.tables.get(&("other".into(), "t".into())).is_none());
        assert!(catalog.tables.get(&("ds".into(), "t".into())).is_some());
        assert_eq!(catalog.list_datasets(client).await.unwrap().len(), 1);
        assert!(catalog
            .lookup_dataset(client, "other")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_read_only_ddl_makes_no_remote_calls() {
        let (warehouse, manager) = setup(AccessMode::ReadOnly);
        let tx = manager.current("c1");
        let err = manager
            .catalog()
            .create_table(&tx, "ds", "t", &schema(), &Constraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::BigqueryError::ReadOnly(_)));
        assert_eq!(warehouse.calls().total(), 0);
    }
}
