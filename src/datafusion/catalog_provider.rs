use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::catalog::{CatalogProvider, SchemaProvider};
use datafusion::error::{DataFusionError, Result as DFResult};
use tracing::warn;

use super::block_on;
use super::schema_provider::BigquerySchemaProvider;
use crate::catalog::BigqueryCatalog;
use crate::error::{BigqueryError, Result};
use crate::transaction::{BigqueryTransaction, BigqueryTransactionManager};

/// An attached warehouse database as seen by one connection.
/// Datasets are exposed as schemas.
#[derive(Debug)]
pub struct BigqueryCatalogProvider {
    manager: Arc<BigqueryTransactionManager>,
    connection_id: String,
}

impl BigqueryCatalogProvider {
    pub fn new(manager: Arc<BigqueryTransactionManager>, connection_id: String) -> Self {
        Self {
            manager,
            connection_id,
        }
    }

    pub fn catalog(&self) -> &Arc<BigqueryCatalog> {
        self.manager.catalog()
    }

    pub fn manager(&self) -> &Arc<BigqueryTransactionManager> {
        &self.manager
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// The connection's active transaction, implicit if none was begun.
    pub fn transaction(&self) -> Arc<BigqueryTransaction> {
        self.manager.current(&self.connection_id)
    }

    fn schema_provider(&self, dataset_id: &str) -> Arc<dyn SchemaProvider> {
        Arc::new(BigquerySchemaProvider::new(
            Arc::clone(&self.manager),
            self.connection_id.clone(),
            dataset_id.to_string(),
        ))
    }

    async fn dataset_exists(&self, dataset_id: &str) -> Result<bool> {
        let transaction = self.transaction();
        let client = transaction.client().await?;
        match self.catalog().lookup_dataset(client, dataset_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CatalogProvider for BigqueryCatalogProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema_names(&self) -> Vec<String> {
        let listed = block_on(async {
            let transaction = self.transaction();
            let client = transaction.client().await?;
            self.catalog().list_datasets(client).await
        });
        match listed {
            Ok(datasets) => {
                let mut names: Vec<String> = datasets
                    .iter()
                    .map(|d| d.name.dataset_id.clone())
                    .collect();
                names.sort();
                names
            }
            Err(e) => {
                warn!(database = %self.catalog().name(), error = %e, "Failed to list datasets");
                Vec::new()
            }
        }
    }

    fn schema(&self, name: &str) -> Option<Arc<dyn SchemaProvider>> {
        match block_on(self.dataset_exists(name)) {
            Ok(true) => Some(self.schema_provider(name)),
            Ok(false) => None,
            // Keep the provider so the table lookup reports the real failure
            // instead of an unknown schema.
            Err(e) => {
                warn!(database = %self.catalog().name(), dataset = name, error = %e, "Failed to resolve dataset");
                Some(self.schema_provider(name))
            }
        }
    }

    /// CREATE SCHEMA: creates the dataset in the default location.
    fn register_schema(
        &self,
        name: &str,
        _schema: Arc<dyn SchemaProvider>,
    ) -> DFResult<Option<Arc<dyn SchemaProvider>>> {
        let transaction = self.transaction();
        transaction.require_writable("create datasets")?;
        block_on(self.catalog().create_dataset(&transaction, name, None))?;
        Ok(None)
    }

    /// DROP SCHEMA: drops the dataset, with its contents when `cascade`.
    fn deregister_schema(
        &self,
        name: &str,
        cascade: bool,
    ) -> DFResult<Option<Arc<dyn SchemaProvider>>> {
        let transaction = self.transaction();
        transaction.require_writable("drop datasets")?;
        block_on(async {
            if !self.dataset_exists(name).await? {
                return Ok(None);
            }
            self.catalog()
                .drop_dataset(&transaction, name, cascade)
                .await?;
            Ok::<_, BigqueryError>(Some(self.schema_provider(name)))
        })
        .map_err(DataFusionError::from)
    }
}
