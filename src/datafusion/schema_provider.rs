use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::catalog::SchemaProvider;
use datafusion::datasource::{MemTable, TableProvider, TableType};
use datafusion::error::{DataFusionError, Result as DFResult};
use tracing::{info, warn};

use super::block_on;
use super::table_provider::BigqueryTableProvider;
use crate::catalog::BigqueryCatalog;
use crate::client::TableKind;
use crate::error::{BigqueryError, Result};
use crate::transaction::{BigqueryTransaction, BigqueryTransactionManager};

/// One warehouse dataset. Table metadata is resolved through the catalog
/// cache; DDL goes through the connection's active transaction.
#[derive(Debug)]
pub struct BigquerySchemaProvider {
    manager: Arc<BigqueryTransactionManager>,
    connection_id: String,
    dataset_id: String,
}

impl BigquerySchemaProvider {
    pub fn new(
        manager: Arc<BigqueryTransactionManager>,
        connection_id: String,
        dataset_id: String,
    ) -> Self {
        Self {
            manager,
            connection_id,
            dataset_id,
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    fn catalog(&self) -> &Arc<BigqueryCatalog> {
        self.manager.catalog()
    }

    fn transaction(&self) -> Arc<BigqueryTransaction> {
        self.manager.current(&self.connection_id)
    }

    async fn lookup(&self, name: &str) -> Result<Option<BigqueryTableProvider>> {
        let transaction = self.transaction();
        let client = transaction.client().await?;
        match self.catalog().lookup_table(client, &self.dataset_id, name).await {
            Ok(table) => Ok(Some(BigqueryTableProvider::new(
                Arc::clone(&self.manager),
                self.connection_id.clone(),
                table,
            ))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// CREATE TABLE, then stream any rows of a CREATE TABLE AS SELECT.
    async fn create_table(&self, name: &str, table: &dyn TableProvider) -> Result<()> {
        let transaction = self.transaction();
        let constraints = table.constraints().cloned().unwrap_or_default();
        self.catalog()
            .create_table(
                &transaction,
                &self.dataset_id,
                name,
                &table.schema(),
                &constraints,
            )
            .await?;

        let Some(memory) = table.as_any().downcast_ref::<MemTable>() else {
            return Ok(());
        };
        let mut batches = Vec::new();
        for partition in &memory.batches {
            batches.extend(partition.read().await.iter().cloned());
        }
        if batches.iter().all(|b| b.num_rows() == 0) {
            return Ok(());
        }

        let mut writer = transaction
            .create_proto_writer(&self.dataset_id, name)
            .await?;
        for batch in &batches {
            writer.append_batch(batch).await?;
        }
        let rows = writer.commit().await?;
        info!(dataset = %self.dataset_id, table = name, rows, "Loaded created table");
        Ok(())
    }
}

#[async_trait]
impl SchemaProvider for BigquerySchemaProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn table_names(&self) -> Vec<String> {
        let listed = block_on(async {
            let transaction = self.transaction();
            let client = transaction.client().await?;
            self.catalog().list_tables(client, &self.dataset_id).await
        });
        match listed {
            Ok(tables) => tables.iter().map(|t| t.table_id.clone()).collect(),
            Err(e) => {
                warn!(dataset = %self.dataset_id, error = %e, "Failed to list tables");
                Vec::new()
            }
        }
    }

    async fn table(&self, name: &str) -> DFResult<Option<Arc<dyn TableProvider>>> {
        Ok(self
            .lookup(name)
            .await?
            .map(|provider| Arc::new(provider) as Arc<dyn TableProvider>))
    }

    fn table_exist(&self, name: &str) -> bool {
        matches!(block_on(self.lookup(name)), Ok(Some(_)))
    }

    fn register_table(
        &self,
        name: String,
        table: Arc<dyn TableProvider>,
    ) -> DFResult<Option<Arc<dyn TableProvider>>> {
        self.transaction().require_writable("create tables")?;
        if table.table_type() == TableType::View {
            return Err(BigqueryError::Binding(format!(
                "cannot create local view '{name}' in warehouse dataset '{}'",
                self.dataset_id
            ))
            .into());
        }
        block_on(self.create_table(&name, table.as_ref()))?;
        Ok(None)
    }

    fn deregister_table(&self, name: &str) -> DFResult<Option<Arc<dyn TableProvider>>> {
        let transaction = self.transaction();
        transaction.require_writable("drop tables")?;
        block_on(async {
            let Some(existing) = self.lookup(name).await? else {
                return Ok(None);
            };
            match existing.table().kind {
                TableKind::Table => {
                    self.catalog()
                        .drop_table(&transaction, &self.dataset_id, name)
                        .await?
                }
                TableKind::View => {
                    self.catalog()
                        .drop_view(&transaction, &self.dataset_id, name)
                        .await?
                }
            }
            Ok::<_, BigqueryError>(Some(Arc::new(existing) as Arc<dyn TableProvider>))
        })
        .map_err(DataFusionError::from)
    }
}
