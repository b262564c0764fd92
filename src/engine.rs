use crate::catalog::BigqueryCatalog;
use crate::client::{Credentials, GcpConnector, WarehouseConnector};
use crate::config::{AccessMode, BigqueryOptions};
use crate::datafusion::{
    write_targets, AttachedCatalogList, BigqueryCatalogProvider, BigqueryExecuteFunction,
    EXECUTE_FUNCTION_NAME,
};
use crate::transaction::{BigqueryTransaction, BigqueryTransactionManager};
use anyhow::Result;
use datafusion::arrow::datatypes::Schema;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::{CatalogProvider, CatalogProviderList};
use datafusion::execution::session_state::SessionStateBuilder;
use datafusion::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Instrument};

/// Result of a query execution.
pub struct QueryResponse {
    pub schema: Arc<Schema>,
    pub results: Vec<RecordBatch>,
    pub execution_time: Duration,
}

/// A DataFusion session with warehouse databases attached as catalogs.
///
/// The session is one connection: every attached database tracks one
/// transaction for it. Statements run outside an explicit `begin` get an
/// implicit transaction that ends with the statement.
pub struct BigqueryEngine {
    df_ctx: SessionContext,
    catalogs: Arc<AttachedCatalogList>,
    connector: Arc<dyn WarehouseConnector>,
    connection_id: String,
    databases: RwLock<HashMap<String, Arc<BigqueryTransactionManager>>>,
}

impl BigqueryEngine {
    /// Create a builder for more control over engine configuration.
    pub fn builder() -> BigqueryEngineBuilder {
        BigqueryEngineBuilder::new()
    }

    pub fn session_context(&self) -> &SessionContext {
        &self.df_ctx
    }

    /// Identifies this engine's connection to every attached database
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Attach a warehouse database as catalog `name`. Nothing is fetched until
    /// the catalog is first used.
    #[tracing::instrument(
        name = "attach_database",
        skip(self, options, credentials),
        fields(bqbridge.project_id = %options.project_id, bqbridge.access_mode = %options.access_mode)
    )]
    pub fn attach(
        &self,
        name: &str,
        options: BigqueryOptions,
        credentials: Credentials,
    ) -> Result<Arc<BigqueryCatalog>> {
        options.validate()?;
        if self.catalogs.catalog(name).is_some() {
            anyhow::bail!("Database '{}' is already attached", name);
        }

        let catalog = Arc::new(BigqueryCatalog::new(
            name,
            options,
            credentials,
            Arc::clone(&self.connector),
        ));
        let manager = Arc::new(BigqueryTransactionManager::new(Arc::clone(&catalog)));
        let provider = Arc::new(BigqueryCatalogProvider::new(
            Arc::clone(&manager),
            self.connection_id.clone(),
        )) as Arc<dyn CatalogProvider>;

        self.catalogs.register_catalog(name.to_string(), provider);
        self.databases
            .write()
            .unwrap()
            .insert(name.to_string(), manager);
        info!("Database '{}' attached", name);
        Ok(catalog)
    }

    /// Detach a database. Its open transaction, if any, is rolled back.
    pub fn detach(&self, name: &str) -> Result<()> {
        let manager = self
            .databases
            .write()
            .unwrap()
            .remove(name)
            .ok_or_else(|| anyhow::anyhow!("Failed to find attached database \"{}\"", name))?;
        self.catalogs.deregister_catalog(name);
        if manager.get(&self.connection_id).is_some() {
            manager.rollback(&self.connection_id)?;
        }
        info!("Database '{}' detached", name);
        Ok(())
    }

    /// Names of attached warehouse databases, sorted.
    pub fn attached(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn manager(&self, name: &str) -> Result<Arc<BigqueryTransactionManager>> {
        self.databases
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Failed to find attached database \"{}\"", name))
    }

    pub fn catalog(&self, name: &str) -> Result<Arc<BigqueryCatalog>> {
        Ok(Arc::clone(self.manager(name)?.catalog()))
    }

    /// The connection's transaction on `name`, starting an implicit one if needed.
    pub fn transaction(&self, name: &str) -> Result<Arc<BigqueryTransaction>> {
        Ok(self.manager(name)?.current(&self.connection_id))
    }

    /// Begin an explicit transaction on `name`. `access_mode` may narrow the
    /// attached mode to read-only.
    pub fn begin(
        &self,
        name: &str,
        access_mode: Option<AccessMode>,
    ) -> Result<Arc<BigqueryTransaction>> {
        Ok(self.manager(name)?.begin(&self.connection_id, access_mode)?)
    }

    /// End the transaction on `name`. Warehouse changes already made stay.
    pub fn commit(&self, name: &str) -> Result<()> {
        Ok(self.manager(name)?.commit(&self.connection_id)?)
    }

    /// End the transaction on `name`. Statements already sent to the
    /// warehouse are not undone.
    pub fn rollback(&self, name: &str) -> Result<()> {
        Ok(self.manager(name)?.rollback(&self.connection_id)?)
    }

    /// Execute a SQL query and return the results.
    #[tracing::instrument(
        name = "execute_query",
        skip(self, sql),
        fields(
            bqbridge.sql = tracing::field::Empty,
            bqbridge.rows_returned = tracing::field::Empty,
        )
    )]
    pub async fn execute_query(&self, sql: &str) -> Result<QueryResponse> {
        if crate::telemetry::include_sql_in_traces() {
            tracing::Span::current().record("bqbridge.sql", sql);
        }
        let result = self.run_query(sql).await;
        self.finish_implicit_transactions();
        result
    }

    async fn run_query(&self, sql: &str) -> Result<QueryResponse> {
        let start = Instant::now();

        let df = self
            .plan_query(sql)
            .instrument(tracing::info_span!("sql_to_dataframe"))
            .await
            .map_err(|e| {
                error!("Error planning query: {}", e);
                e
            })?;

        let schema: Arc<Schema> = Arc::clone(df.schema().inner());

        let results = df
            .collect()
            .instrument(tracing::info_span!("collect_results"))
            .await
            .map_err(|e| {
                error!("Error getting query result: {}", e);
                e
            })?;

        let row_count: usize = results.iter().map(|b| b.num_rows()).sum();
        tracing::Span::current().record("bqbridge.rows_returned", row_count);
        info!("Execution completed in {:?}", start.elapsed());

        Ok(QueryResponse {
            schema,
            execution_time: start.elapsed(),
            results,
        })
    }

    /// Parse, check write access, then plan. Planning already resolves tables
    /// against the warehouse, so the access check must come first.
    async fn plan_query(&self, sql: &str) -> Result<DataFrame> {
        let state = self.df_ctx.state();
        let options = state.config().options();
        let statement = state.sql_to_statement(sql, &options.sql_parser.dialect)?;
        let targets = write_targets(
            &statement,
            &options.catalog.default_catalog,
            options.sql_parser.enable_ident_normalization,
        )?;
        for target in targets {
            let manager = self.databases.read().unwrap().get(&target.catalog).cloned();
            if let Some(manager) = manager {
                manager
                    .current(&self.connection_id)
                    .require_writable(target.operation)?;
            }
        }
        let plan = state.statement_to_plan(statement).await?;
        Ok(self.df_ctx.execute_logical_plan(plan).await?)
    }

    fn finish_implicit_transactions(&self) {
        let managers: Vec<_> = self.databases.read().unwrap().values().cloned().collect();
        for manager in managers {
            if let Err(e) = manager.finish_implicit(&self.connection_id) {
                warn!(database = %manager.catalog().name(), error = %e, "Failed to end implicit transaction");
            }
        }
    }
}

/// Builder for BigqueryEngine.
///
/// # Example
///
/// ```no_run
/// use bigquery_bridge::BigqueryEngine;
///
/// let engine = BigqueryEngine::builder().build().unwrap();
/// ```
pub struct BigqueryEngineBuilder {
    connector: Option<Arc<dyn WarehouseConnector>>,
    session_config: Option<SessionConfig>,
}

impl Default for BigqueryEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BigqueryEngineBuilder {
    pub fn new() -> Self {
        Self {
            connector: None,
            session_config: None,
        }
    }

    /// Set how warehouse transports are built.
    /// Defaults to the REST connector.
    pub fn connector(mut self, connector: Arc<dyn WarehouseConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the DataFusion session configuration.
    /// Defaults to `SessionConfig::new()` with information_schema enabled.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = Some(config);
        self
    }

    pub fn build(self) -> Result<BigqueryEngine> {
        let config = self
            .session_config
            .unwrap_or_else(|| SessionConfig::new().with_information_schema(true));
        let catalogs = Arc::new(AttachedCatalogList::new());

        let state = SessionStateBuilder::new()
            .with_config(config)
            .with_catalog_list(Arc::clone(&catalogs) as Arc<dyn CatalogProviderList>)
            .with_default_features()
            .build();
        let df_ctx = SessionContext::new_with_state(state);

        df_ctx.register_udtf(
            EXECUTE_FUNCTION_NAME,
            Arc::new(BigqueryExecuteFunction::new(
                Arc::clone(&catalogs) as Arc<dyn CatalogProviderList>
            )),
        );

        let connection_id = df_ctx.session_id();
        info!(connection_id = %connection_id, "Engine session created");

        Ok(BigqueryEngine {
            df_ctx,
            catalogs,
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(GcpConnector) as Arc<dyn WarehouseConnector>),
            connection_id,
            databases: RwLock::new(HashMap::new()),
        })
    }
}
