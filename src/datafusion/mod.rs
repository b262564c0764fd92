mod access;
mod catalog_list;
mod catalog_provider;
mod execute;
pub mod filters;
mod schema_provider;
mod table_provider;

use tokio::task::block_in_place;

/// Blocking helper for async operations.
///
/// Uses `block_in_place` to avoid blocking the tokio runtime when calling
/// async code from a sync context. DataFusion's CatalogProvider and parts of
/// SchemaProvider are sync while every warehouse call is async.
pub(crate) fn block_on<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    block_in_place(|| tokio::runtime::Handle::current().block_on(f))
}

pub use access::{write_targets, WriteTarget};
pub use catalog_list::AttachedCatalogList;
pub use catalog_provider::BigqueryCatalogProvider;
pub use execute::{BigqueryExecuteFunction, EXECUTE_FUNCTION_NAME};
pub use schema_provider::BigquerySchemaProvider;
pub use table_provider::BigqueryTableProvider;
