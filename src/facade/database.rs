use super::collection::{Collection, CollectionOptions};
use crate::core::Result;
use crate::storage::Store;
use std::sync::Arc;

/// Handle to a named database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    store: Arc<Store>,
    name: String,
    options: CollectionOptions,
}

impl Database {
    pub(crate) fn new(store: Arc<Store>, name: &str, options: CollectionOptions) -> Self {
        Self {
            store,
            name: name.to_string(),
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection handle inheriting this database's default concerns.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.store.clone(), &self.name, name, self.options)
    }

    pub fn collection_with_options(&self, name: &str, options: CollectionOptions) -> Collection {
        self.collection(name).with_options(options)
    }

    /// Names of collections holding at least one document.
    pub async fn list_collection_names(&self) -> Result<Vec<String>> {
        let prefix = format!("{}.", self.name);
        Ok(self
            .store
            .namespaces()
            .await
            .into_iter()
            .filter_map(|ns| ns.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        self.collection(name).drop().await
    }
}
