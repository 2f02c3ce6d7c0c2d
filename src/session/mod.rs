// ============================================================================
// Client Sessions
// ============================================================================
//
// A ClientSession is a cheap, cloneable handle to one logical session. All
// clones share the same state, so the unit of work handed a clone by
// with_transaction writes into the same transaction the executor commits.
//
// A session holds at most one transaction at a time. Writes issued through a
// session with an active transaction go to that transaction; otherwise they
// auto-commit against the store.
//
// ============================================================================

mod registry;

pub(crate) use registry::SessionRegistry;

use crate::core::{DbError, Document, ErrorLabel, Result};
use crate::interface::TransactionalSession;
use crate::storage::{FailCommand, Store};
use crate::transaction::{
    Transaction, TransactionId, TransactionOptions, TransactionRetryPolicy, TransactionState,
    with_transaction,
};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Logical session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsid_{}", self.0.simple())
    }
}

/// Defaults a session applies when the caller does not pass its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub default_transaction_options: TransactionOptions,
    pub retry_policy: TransactionRetryPolicy,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_transaction_options(mut self, options: TransactionOptions) -> Self {
        self.default_transaction_options = options;
        self
    }

    pub fn retry_policy(mut self, policy: TransactionRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    /// Current or most recently finished transaction
    transaction: Option<Transaction>,
    ended: bool,
}

impl SessionInner {
    fn state(&self) -> TransactionState {
        self.transaction
            .as_ref()
            .map(|txn| txn.state())
            .unwrap_or(TransactionState::None)
    }

    fn active_transaction(&mut self) -> Option<&mut Transaction> {
        self.transaction
            .as_mut()
            .filter(|txn| txn.state().is_active())
    }
}

pub(crate) struct SessionShared {
    id: SessionId,
    store: Arc<Store>,
    options: SessionOptions,
    inner: Mutex<SessionInner>,
    registry: Weak<SessionRegistry>,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(txn) = inner.active_transaction() {
            if txn.rollback().is_ok() {
                self.store.record_abort();
                debug!("Session {} dropped with an active transaction; aborted", self.id);
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.id);
        }
    }
}

/// Handle to a client session
#[derive(Clone)]
pub struct ClientSession {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.shared.id)
            .finish()
    }
}

impl ClientSession {
    pub(crate) fn new(
        store: Arc<Store>,
        options: SessionOptions,
        registry: &Arc<SessionRegistry>,
    ) -> Self {
        let session = Self {
            shared: Arc::new(SessionShared {
                id: SessionId::new(),
                store,
                options,
                inner: Mutex::new(SessionInner::default()),
                registry: Arc::downgrade(registry),
            }),
        };
        registry.register(session.id(), Arc::downgrade(&session.shared));
        session
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }

    async fn lock(&self) -> Result<MutexGuard<'_, SessionInner>> {
        let inner = self.shared.inner.lock().await;
        if inner.ended {
            return Err(DbError::Session(format!(
                "Cannot use session {} after it has ended",
                self.shared.id
            )));
        }
        Ok(inner)
    }

    /// Starts a transaction. At most one can be active per session.
    pub async fn start_transaction(&self, options: TransactionOptions) -> Result<()> {
        let mut inner = self.lock().await?;
        if inner.state().is_active() {
            return Err(DbError::Transaction("Transaction already in progress".into()));
        }

        let txn = self.shared.store.begin(options).await?;
        debug!(
            "Session {} started {} at {}",
            self.shared.id,
            txn.id(),
            txn.started_at().to_rfc3339()
        );
        inner.transaction = Some(txn);
        Ok(())
    }

    /// Commits the active transaction.
    ///
    /// Re-committing a committed transaction succeeds without applying
    /// anything twice.
    pub async fn commit_transaction(&self) -> Result<()> {
        let mut inner = self.lock().await?;
        let txn = match inner.transaction.as_mut() {
            None => return Err(DbError::Transaction("No transaction started".into())),
            Some(txn) if txn.state() == TransactionState::Aborted => {
                return Err(DbError::Transaction(
                    "Cannot call commitTransaction after calling abortTransaction".into(),
                ));
            }
            Some(txn) => txn,
        };

        let limit = txn.options().max_commit_time;
        let result = match limit {
            None => self.shared.store.commit(txn).await,
            Some(limit) => tokio::time::timeout(limit, self.shared.store.commit(txn))
                .await
                .unwrap_or_else(|_| {
                    Err(DbError::Timeout(format!(
                        "commit exceeded max commit time of {}ms",
                        limit.as_millis()
                    )))
                }),
        };

        result.map_err(label_commit_error)
    }

    /// Aborts the active transaction, discarding its writes.
    pub async fn abort_transaction(&self) -> Result<()> {
        let mut inner = self.lock().await?;
        let txn = match inner.transaction.as_mut() {
            None => return Err(DbError::Transaction("No transaction started".into())),
            Some(txn) if txn.state() == TransactionState::Committed => {
                return Err(DbError::Transaction(
                    "Cannot call abortTransaction after calling commitTransaction".into(),
                ));
            }
            Some(txn) if txn.state() == TransactionState::Aborted => {
                return Err(DbError::Transaction("Cannot call abortTransaction twice".into()));
            }
            Some(txn) => txn,
        };

        // Abort always succeeds locally; a failed abort command only means
        // the store never saw the transaction's writes.
        if let Err(err) = self.shared.store.intercept(FailCommand::Abort).await {
            debug!("Ignoring abort error on session {}: {}", self.shared.id, err);
        }
        txn.rollback()?;
        self.shared.store.record_abort();
        debug!(
            "Session {} aborted {} after {}ms",
            self.shared.id,
            txn.id(),
            txn.duration().as_millis()
        );
        Ok(())
    }

    pub async fn transaction_state(&self) -> TransactionState {
        self.shared.inner.lock().await.state()
    }

    pub async fn in_transaction(&self) -> bool {
        self.transaction_state().await.is_active()
    }

    pub async fn transaction_id(&self) -> Option<TransactionId> {
        let inner = self.shared.inner.lock().await;
        inner.transaction.as_ref().map(|txn| txn.id())
    }

    /// Ends the session, aborting any active transaction. Idempotent.
    pub async fn end_session(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.ended {
            return;
        }
        if let Some(txn) = inner.active_transaction() {
            if txn.rollback().is_ok() {
                self.shared.store.record_abort();
            }
        }
        inner.ended = true;
        if let Some(registry) = self.shared.registry.upgrade() {
            registry.unregister(&self.shared.id);
        }
        debug!("Session {} ended", self.shared.id);
    }

    pub async fn is_ended(&self) -> bool {
        self.shared.inner.lock().await.ended
    }

    /// Runs `work` in a transaction with the session's default options and
    /// retry policy. See [`crate::transaction::with_transaction`].
    pub async fn with_transaction<F, Fut, T>(&self, work: F) -> Result<T>
    where
        F: FnMut(ClientSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let options = &self.shared.options;
        with_transaction(
            self,
            &options.default_transaction_options,
            &options.retry_policy,
            work,
        )
        .await
    }

    /// Like [`ClientSession::with_transaction`] with explicit options and policy.
    pub async fn with_transaction_opts<F, Fut, T>(
        &self,
        options: &TransactionOptions,
        policy: &TransactionRetryPolicy,
        work: F,
    ) -> Result<T>
    where
        F: FnMut(ClientSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_transaction(self, options, policy, work).await
    }

    // ------------------------------------------------------------------
    // Session-bound document operations
    // ------------------------------------------------------------------

    pub(crate) async fn insert_one(&self, namespace: &str, mut doc: Document) -> Result<Value> {
        let mut inner = self.lock().await?;
        let Some(txn) = inner.active_transaction() else {
            drop(inner);
            return self.shared.store.insert_one(namespace, doc).await;
        };

        let store = &self.shared.store;
        let result = async {
            let deferred = store.intercept(FailCommand::Insert).await?;
            let (key, id) = Transaction::prepare_insert(&mut doc)?;
            store
                .check_write_conflict(namespace, &key, txn.snapshot_version())
                .await?;
            txn.insert(namespace, key, doc)?;
            deferred.map_or(Ok(id), Err)
        }
        .await;
        result.map_err(label_transaction_error)
    }

    pub(crate) async fn insert_many(&self, namespace: &str, docs: Vec<Document>) -> Result<Vec<Value>> {
        {
            let mut inner = self.lock().await?;
            if inner.active_transaction().is_none() {
                drop(inner);
                return self.shared.store.insert_many(namespace, docs).await;
            }
        }

        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.insert_one(namespace, doc).await?);
        }
        Ok(ids)
    }

    pub(crate) async fn replace_one(
        &self,
        namespace: &str,
        filter: &Document,
        replacement: Document,
    ) -> Result<u64> {
        let mut inner = self.lock().await?;
        let Some(txn) = inner.active_transaction() else {
            drop(inner);
            return self
                .shared
                .store
                .replace_one(namespace, filter, replacement)
                .await;
        };

        let store = &self.shared.store;
        let result = async {
            let deferred = store.intercept(FailCommand::Replace).await?;
            let replaced = match txn.locate(namespace, filter) {
                Some((id, old)) => {
                    let new = crate::core::document::carry_id(&old, replacement)?;
                    store
                        .check_write_conflict(namespace, &id, txn.snapshot_version())
                        .await?;
                    txn.replace(namespace, id, old, new)?;
                    1
                }
                None => 0,
            };
            deferred.map_or(Ok(replaced), Err)
        }
        .await;
        result.map_err(label_transaction_error)
    }

    pub(crate) async fn delete_one(&self, namespace: &str, filter: &Document) -> Result<u64> {
        let mut inner = self.lock().await?;
        let Some(txn) = inner.active_transaction() else {
            drop(inner);
            return self.shared.store.delete_one(namespace, filter).await;
        };

        let store = &self.shared.store;
        let result = async {
            let deferred = store.intercept(FailCommand::Delete).await?;
            let deleted = match txn.locate(namespace, filter) {
                Some((id, _)) => {
                    store
                        .check_write_conflict(namespace, &id, txn.snapshot_version())
                        .await?;
                    u64::from(txn.delete(namespace, id)?)
                }
                None => 0,
            };
            deferred.map_or(Ok(deleted), Err)
        }
        .await;
        result.map_err(label_transaction_error)
    }

    pub(crate) async fn find(&self, namespace: &str, filter: &Document) -> Result<Vec<Document>> {
        let mut inner = self.lock().await?;
        let Some(txn) = inner.active_transaction() else {
            drop(inner);
            return self.shared.store.find(namespace, filter).await;
        };

        let result = async {
            let deferred = self.shared.store.intercept(FailCommand::Find).await?;
            let docs = txn.find(namespace, filter);
            deferred.map_or(Ok(docs), Err)
        }
        .await;
        result.map_err(label_transaction_error)
    }
}

/// Marks retryable failures raised inside a transaction.
fn label_transaction_error(err: DbError) -> DbError {
    if err.is_transient_kind() {
        err.with_label(ErrorLabel::TransientTransaction)
    } else {
        err
    }
}

/// Marks commit failures: an interrupted commit has an unknown outcome, a
/// conflicting commit has been aborted and can be retried from the start.
fn label_commit_error(err: DbError) -> DbError {
    match err.kind() {
        DbError::Network(_) | DbError::Timeout(_) | DbError::NotPrimary(_) => {
            err.with_label(ErrorLabel::UnknownTransactionCommitResult)
        }
        DbError::WriteConflict(_) => err.with_label(ErrorLabel::TransientTransaction),
        _ => err,
    }
}

#[async_trait]
impl TransactionalSession for ClientSession {
    fn session_id(&self) -> String {
        self.shared.id.to_string()
    }

    async fn start_transaction(&self, options: TransactionOptions) -> Result<()> {
        ClientSession::start_transaction(self, options).await
    }

    async fn commit_transaction(&self) -> Result<()> {
        ClientSession::commit_transaction(self).await
    }

    async fn abort_transaction(&self) -> Result<()> {
        ClientSession::abort_transaction(self).await
    }

    async fn transaction_state(&self) -> TransactionState {
        ClientSession::transaction_state(self).await
    }
}
