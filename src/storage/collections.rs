use crate::core::document::matches_filter;
use crate::core::{DbError, Document, Result};

/// Documents of one collection, ordered by key.
pub type CollectionData = im::OrdMap<String, Document>;

/// All collections keyed by namespace (`database.collection`).
///
/// Backed by persistent maps, so cloning is O(1) and a clone is an isolated
/// snapshot: writes to one copy never show through the other.
#[derive(Debug, Clone, Default)]
pub struct Collections {
    namespaces: im::HashMap<String, CollectionData>,
}

impl Collections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, id: &str) -> Option<&Document> {
        self.namespaces.get(namespace).and_then(|data| data.get(id))
    }

    pub fn contains(&self, namespace: &str, id: &str) -> bool {
        self.get(namespace, id).is_some()
    }

    /// Inserts a new document, rejecting duplicate keys.
    pub fn insert(&mut self, namespace: &str, id: &str, doc: Document) -> Result<()> {
        if self.contains(namespace, id) {
            return Err(DbError::DuplicateKey(format!(
                "E11000 duplicate key error collection: {namespace} _id: {id}"
            )));
        }
        self.put(namespace, id, doc);
        Ok(())
    }

    /// Inserts or overwrites a document.
    pub fn put(&mut self, namespace: &str, id: &str, doc: Document) {
        if let Some(data) = self.namespaces.get_mut(namespace) {
            data.insert(id.to_string(), doc);
            return;
        }
        let mut data = CollectionData::new();
        data.insert(id.to_string(), doc);
        self.namespaces.insert(namespace.to_string(), data);
    }

    pub fn remove(&mut self, namespace: &str, id: &str) -> Option<Document> {
        self.namespaces
            .get_mut(namespace)
            .and_then(|data| data.remove(id))
    }

    /// Documents matching `filter`, in key order.
    pub fn find(&self, namespace: &str, filter: &Document) -> Vec<Document> {
        self.namespaces
            .get(namespace)
            .map(|data| {
                data.values()
                    .filter(|doc| matches_filter(doc, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Key and body of the first document matching `filter`.
    pub fn find_first(&self, namespace: &str, filter: &Document) -> Option<(String, Document)> {
        self.namespaces.get(namespace).and_then(|data| {
            data.iter()
                .find(|(_, doc)| matches_filter(doc, filter))
                .map(|(id, doc)| (id.clone(), doc.clone()))
        })
    }

    pub fn count(&self, namespace: &str, filter: &Document) -> u64 {
        self.namespaces
            .get(namespace)
            .map(|data| data.values().filter(|doc| matches_filter(doc, filter)).count() as u64)
            .unwrap_or(0)
    }

    pub fn total_documents(&self) -> usize {
        self.namespaces.values().map(|data| data.len()).sum()
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn drop_namespace(&mut self, namespace: &str) -> bool {
        self.namespaces.remove(namespace).is_some()
    }
}
