use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use datafusion::catalog::{CatalogProvider, CatalogProviderList};

/// Catalog list of one engine: the default in-memory catalog plus every
/// attached warehouse database. Unlike DataFusion's memory list it supports
/// removing a catalog, which detaching needs.
#[derive(Debug, Default)]
pub struct AttachedCatalogList {
    catalogs: RwLock<HashMap<String, Arc<dyn CatalogProvider>>>,
}

impl AttachedCatalogList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deregister_catalog(&self, name: &str) -> Option<Arc<dyn CatalogProvider>> {
        self.catalogs.write().unwrap().remove(name)
    }
}

impl CatalogProviderList for AttachedCatalogList {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn register_catalog(
        &self,
        name: String,
        catalog: Arc<dyn CatalogProvider>,
    ) -> Option<Arc<dyn CatalogProvider>> {
        self.catalogs.write().unwrap().insert(name, catalog)
    }

    fn catalog_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalogs.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn catalog(&self, name: &str) -> Option<Arc<dyn CatalogProvider>> {
        self.catalogs.read().unwrap().get(name).cloned()
    }
}
