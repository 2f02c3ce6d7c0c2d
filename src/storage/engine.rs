// ============================================================================
// Document Store Engine
// ============================================================================
//
// Committed state lives behind one async RwLock. Readers clone it in O(1)
// (persistent maps) and release the lock immediately; auto-commit writes and
// transaction commits take the write lock for the duration of the apply, so
// a commit becomes visible to readers all at once.
//
// Conflict detection is first-committer-wins: every committed write stamps
// the touched key with the commit version, and a transaction may not write a
// key stamped after its snapshot.
//
// ============================================================================

use super::collections::Collections;
use super::fail_point::{FailCommand, FailPoints};
use crate::core::document::{carry_id, ensure_id};
use crate::core::{DbError, Document, Result};
use crate::transaction::{Transaction, TransactionOptions, TransactionState};
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
struct CommittedState {
    collections: Collections,
    /// Commit version that last wrote each (namespace, id)
    versions: im::HashMap<(String, String), u64>,
    version: u64,
}

impl CommittedState {
    fn stamp(&mut self, namespace: &str, id: &str, version: u64) {
        self.versions
            .insert((namespace.to_string(), id.to_string()), version);
    }

    fn written_after(&self, namespace: &str, id: &str, snapshot_version: u64) -> bool {
        self.versions
            .get(&(namespace.to_string(), id.to_string()))
            .is_some_and(|version| *version > snapshot_version)
    }

    /// Allocates the next commit version.
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Store-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StoreStats {
    pub transactions_started: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub commit_version: u64,
    pub documents: usize,
}

/// In-memory document store with snapshot-isolated transactions.
#[derive(Debug, Default)]
pub struct Store {
    state: RwLock<CommittedState>,
    fail_points: FailPoints,
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    closed: AtomicBool,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_points(&self) -> &FailPoints {
        &self.fail_points
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Store closed");
        }
    }

    /// Runs the closed check and the fail point for `command`.
    ///
    /// `Err` means fail before the command runs. `Ok(Some(err))` means run the
    /// command, then report `err`.
    pub(crate) async fn intercept(&self, command: FailCommand) -> Result<Option<DbError>> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }

        let Some(triggered) = self.fail_points.trigger(command) else {
            return Ok(None);
        };

        debug!("Fail point on '{}' fired: {}", command, triggered.error);
        if let Some(delay) = triggered.block_time {
            tokio::time::sleep(delay).await;
        }

        if triggered.apply_first {
            Ok(Some(triggered.error))
        } else {
            Err(triggered.error)
        }
    }

    /// O(1) snapshot of committed state and its commit version.
    pub async fn snapshot(&self) -> (Collections, u64) {
        let state = self.state.read().await;
        (state.collections.clone(), state.version)
    }

    pub(crate) async fn begin(&self, options: TransactionOptions) -> Result<Transaction> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        options.validate()?;

        let (snapshot, version) = self.snapshot().await;
        let txn = Transaction::new(options, snapshot, version);
        self.started.fetch_add(1, Ordering::SeqCst);
        debug!("Began {} at snapshot version {}", txn.id(), version);
        Ok(txn)
    }

    /// Fails with `WriteConflict` if `id` was committed by someone else after
    /// `snapshot_version`.
    pub(crate) async fn check_write_conflict(
        &self,
        namespace: &str,
        id: &str,
        snapshot_version: u64,
    ) -> Result<()> {
        let state = self.state.read().await;
        if state.written_after(namespace, id, snapshot_version) {
            return Err(DbError::WriteConflict(format!(
                "document {namespace}/{id} was modified after the transaction started"
            )));
        }
        Ok(())
    }

    /// Validates and applies `txn`'s change log atomically.
    ///
    /// A conflicting transaction is aborted. Committing an already committed
    /// transaction is a no-op so a commit with a lost acknowledgement can be
    /// retried.
    pub(crate) async fn commit(&self, txn: &mut Transaction) -> Result<()> {
        if txn.state() == TransactionState::Committed {
            return Ok(());
        }

        let deferred = self.intercept(FailCommand::Commit).await?;

        {
            let mut state = self.state.write().await;

            let conflict = txn.changes().iter().find(|change| {
                state.written_after(change.namespace(), change.document_id(), txn.snapshot_version())
            });
            if let Some(change) = conflict {
                let err = DbError::WriteConflict(format!(
                    "{} of {}/{} conflicts with a concurrent commit",
                    change.kind(),
                    change.namespace(),
                    change.document_id()
                ));
                drop(state);
                txn.rollback()?;
                self.aborted.fetch_add(1, Ordering::SeqCst);
                return Err(err);
            }

            let version = state.next_version();
            for change in txn.changes() {
                let (namespace, id) = (change.namespace(), change.document_id());
                match change.after() {
                    Some(doc) => state.collections.put(namespace, id, doc.clone()),
                    None => {
                        state.collections.remove(namespace, id);
                    }
                }
                state.stamp(namespace, id, version);
            }

            debug!(
                "Committed {} ({} changes) at version {} after {}ms",
                txn.id(),
                txn.change_count(),
                version,
                txn.duration().as_millis()
            );
        }

        txn.commit()?;
        self.committed.fetch_add(1, Ordering::SeqCst);

        match deferred {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn record_abort(&self) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Auto-commit operations (no transaction)
    // ------------------------------------------------------------------

    pub async fn insert_one(&self, namespace: &str, mut doc: Document) -> Result<Value> {
        let deferred = self.intercept(FailCommand::Insert).await?;
        let (key, id) = ensure_id(&mut doc)?;
        {
            let mut state = self.state.write().await;
            state.collections.insert(namespace, &key, doc)?;
            let version = state.next_version();
            state.stamp(namespace, &key, version);
        }
        deferred.map_or(Ok(id), Err)
    }

    /// Inserts all documents under one version or none of them.
    pub async fn insert_many(&self, namespace: &str, docs: Vec<Document>) -> Result<Vec<Value>> {
        let deferred = self.intercept(FailCommand::Insert).await?;
        let mut ids = Vec::with_capacity(docs.len());
        {
            let mut state = self.state.write().await;
            let mut staged = state.collections.clone();
            let mut prepared = Vec::with_capacity(docs.len());
            for mut doc in docs {
                let (key, id) = ensure_id(&mut doc)?;
                staged.insert(namespace, &key, doc)?;
                prepared.push(key);
                ids.push(id);
            }

            state.collections = staged;
            let version = state.next_version();
            for key in &prepared {
                state.stamp(namespace, key, version);
            }
        }
        deferred.map_or(Ok(ids), Err)
    }

    /// Replaces the first match. Returns the number of documents replaced.
    pub async fn replace_one(
        &self,
        namespace: &str,
        filter: &Document,
        replacement: Document,
    ) -> Result<u64> {
        let deferred = self.intercept(FailCommand::Replace).await?;
        let replaced = {
            let mut state = self.state.write().await;
            match state.collections.find_first(namespace, filter) {
                Some((id, old)) => {
                    let new = carry_id(&old, replacement)?;
                    state.collections.put(namespace, &id, new);
                    let version = state.next_version();
                    state.stamp(namespace, &id, version);
                    1
                }
                None => 0,
            }
        };
        deferred.map_or(Ok(replaced), Err)
    }

    /// Deletes the first match. Returns the number of documents deleted.
    pub async fn delete_one(&self, namespace: &str, filter: &Document) -> Result<u64> {
        let deferred = self.intercept(FailCommand::Delete).await?;
        let deleted = {
            let mut state = self.state.write().await;
            match state.collections.find_first(namespace, filter) {
                Some((id, _)) => {
                    state.collections.remove(namespace, &id);
                    let version = state.next_version();
                    state.stamp(namespace, &id, version);
                    1
                }
                None => 0,
            }
        };
        deferred.map_or(Ok(deleted), Err)
    }

    pub async fn find(&self, namespace: &str, filter: &Document) -> Result<Vec<Document>> {
        let deferred = self.intercept(FailCommand::Find).await?;
        let docs = {
            let state = self.state.read().await;
            state.collections.find(namespace, filter)
        };
        deferred.map_or(Ok(docs), Err)
    }

    pub async fn count(&self, namespace: &str, filter: &Document) -> Result<u64> {
        Ok(self.find(namespace, filter).await?.len() as u64)
    }

    pub async fn drop_collection(&self, namespace: &str) -> Result<bool> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        let mut state = self.state.write().await;
        let removed = state.collections.drop_namespace(namespace);
        if removed {
            let version = state.next_version();
            let stale: Vec<(String, String)> = state
                .versions
                .keys()
                .filter(|(ns, _)| ns == namespace)
                .cloned()
                .collect();
            for (ns, id) in stale {
                state.stamp(&ns, &id, version);
            }
        }
        Ok(removed)
    }

    pub async fn namespaces(&self) -> Vec<String> {
        self.state.read().await.collections.namespaces()
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.read().await;
        StoreStats {
            transactions_started: self.started.load(Ordering::SeqCst),
            transactions_committed: self.committed.load(Ordering::SeqCst),
            transactions_aborted: self.aborted.load(Ordering::SeqCst),
            commit_version: state.version,
            documents: state.collections.total_documents(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::into_document;
    use crate::storage::fail_point::{FailPoint, FailPointError};
    use serde_json::json;

    const NS: &str = "sample_restaurants.restaurants";

    fn doc(value: serde_json::Value) -> Document {
        into_document(value).unwrap()
    }

    #[tokio::test]
    async fn test_auto_commit_insert_and_find() {
        let store = Store::new();
        store.insert_one(NS, doc(json!({"_id": "1", "name": "PyMongo Pizza"}))).await.unwrap();

        let found = store.find(NS, &Document::new()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(store.stats().await.commit_version, 1);
    }

    #[tokio::test]
    async fn test_insert_many_is_all_or_nothing() {
        let store = Store::new();
        store.insert_one(NS, doc(json!({"_id": "2"}))).await.unwrap();

        let result = store
            .insert_many(NS, vec![doc(json!({"_id": "1"})), doc(json!({"_id": "2"}))])
            .await;
        assert!(matches!(result, Err(DbError::DuplicateKey(_))));
        assert_eq!(store.count(NS, &Document::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_applies_changes_atomically() {
        let store = Store::new();
        let mut txn = store.begin(TransactionOptions::default()).await.unwrap();
        txn.insert(NS, "1".into(), doc(json!({"_id": 1}))).unwrap();
        txn.insert(NS, "2".into(), doc(json!({"_id": 2}))).unwrap();

        assert_eq!(store.count(NS, &Document::new()).await.unwrap(), 0);
        store.commit(&mut txn).await.unwrap();
        assert_eq!(store.count(NS, &Document::new()).await.unwrap(), 2);

        let stats = store.stats().await;
        assert_eq!(stats.transactions_started, 1);
        assert_eq!(stats.transactions_committed, 1);
    }

    #[tokio::test]
    async fn test_first_committer_wins() {
        let store = Store::new();
        store.insert_one(NS, doc(json!({"_id": 1, "stars": 1}))).await.unwrap();

        let mut first = store.begin(TransactionOptions::default()).await.unwrap();
        let mut second = store.begin(TransactionOptions::default()).await.unwrap();

        let old = doc(json!({"_id": 1, "stars": 1}));
        first.replace(NS, "1".into(), old.clone(), doc(json!({"_id": 1, "stars": 2}))).unwrap();
        second.replace(NS, "1".into(), old, doc(json!({"_id": 1, "stars": 3}))).unwrap();

        store.commit(&mut first).await.unwrap();
        let err = store.commit(&mut second).await.unwrap_err();
        assert!(matches!(err, DbError::WriteConflict(_)));
        assert_eq!(second.state(), TransactionState::Aborted);

        let found = store.find(NS, &Document::new()).await.unwrap();
        assert_eq!(found[0].get("stars"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_write_conflict_check() {
        let store = Store::new();
        let txn = store.begin(TransactionOptions::default()).await.unwrap();
        store.insert_one(NS, doc(json!({"_id": 1}))).await.unwrap();

        assert!(store.check_write_conflict(NS, "1", txn.snapshot_version()).await.is_err());
        assert!(store.check_write_conflict(NS, "2", txn.snapshot_version()).await.is_ok());
    }

    #[tokio::test]
    async fn test_commit_with_lost_ack_is_idempotent() {
        let store = Store::new();
        store.fail_points().configure(
            FailPoint::new(FailCommand::Commit, FailPointError::Network).apply_first(),
        );

        let mut txn = store.begin(TransactionOptions::default()).await.unwrap();
        txn.insert(NS, "1".into(), doc(json!({"_id": 1}))).unwrap();

        assert!(matches!(store.commit(&mut txn).await, Err(DbError::Network(_))));
        assert_eq!(store.count(NS, &Document::new()).await.unwrap(), 1);

        store.commit(&mut txn).await.unwrap();
        assert_eq!(store.count(NS, &Document::new()).await.unwrap(), 1);
        assert_eq!(store.stats().await.transactions_committed, 1);
    }

    #[tokio::test]
    async fn test_commit_fail_point_before_apply_keeps_transaction_open() {
        let store = Store::new();
        store
            .fail_points()
            .configure(FailPoint::new(FailCommand::Commit, FailPointError::Network));

        let mut txn = store.begin(TransactionOptions::default()).await.unwrap();
        txn.insert(NS, "1".into(), doc(json!({"_id": 1}))).unwrap();

        assert!(store.commit(&mut txn).await.is_err());
        assert!(txn.state().is_active());
        assert_eq!(store.count(NS, &Document::new()).await.unwrap(), 0);

        store.commit(&mut txn).await.unwrap();
        assert_eq!(store.count(NS, &Document::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = Store::new();
        store.close();
        assert_eq!(
            store.insert_one(NS, Document::new()).await.unwrap_err(),
            DbError::Closed
        );
        assert!(store.begin(TransactionOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let store = Store::new();
        store.insert_one(NS, doc(json!({"_id": "1", "name": "a"}))).await.unwrap();

        let filter = doc(json!({"name": "a"}));
        assert_eq!(store.replace_one(NS, &filter, doc(json!({"name": "b"}))).await.unwrap(), 1);
        assert_eq!(store.replace_one(NS, &filter, doc(json!({"name": "c"}))).await.unwrap(), 0);

        let filter = doc(json!({"name": "b"}));
        assert_eq!(store.delete_one(NS, &filter).await.unwrap(), 1);
        assert_eq!(store.stats().await.documents, 0);
    }

    #[tokio::test]
    async fn test_commit_replays_replace_and_delete() {
        let store = Store::new();
        store.insert_one(NS, doc(json!({"_id": 1, "name": "a"}))).await.unwrap();
        store.insert_one(NS, doc(json!({"_id": 2, "name": "b"}))).await.unwrap();

        let mut txn = store.begin(TransactionOptions::default()).await.unwrap();
        let old = doc(json!({"_id": 1, "name": "a"}));
        txn.replace(NS, "1".into(), old, doc(json!({"_id": 1, "name": "c"}))).unwrap();
        assert!(txn.delete(NS, "2".into()).unwrap());
        store.commit(&mut txn).await.unwrap();

        let found = store.find(NS, &Document::new()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("name"), Some(&json!("c")));
    }
}
