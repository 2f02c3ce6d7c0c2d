// ============================================================================
// Transaction State Management
// ============================================================================
//
// Each transaction moves through: Active -> Committed | Aborted.
// A session that has never started one reports `None`.
//
// Snapshot isolation: a transaction works on an O(1) copy of committed state
// taken at start. Its writes land in that private copy and in the change log;
// nobody else sees them until commit replays the log.
//
// ============================================================================

use super::{Change, TransactionOptions};
use crate::core::document::ensure_id;
use crate::core::{DbError, Document, Result};
use crate::storage::Collections;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state
///
/// ```text
/// None ──start──> Active ──commit──> Committed
///                   │
///                   └──abort───> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No transaction has been started on the session
    None,

    Active,

    Committed,

    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::None => write!(f, "NONE"),
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// A document transaction with snapshot isolation
///
/// Owned by exactly one session; the session serializes access to it.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    options: TransactionOptions,

    /// Commit version of the snapshot this transaction reads from
    snapshot_version: u64,

    /// Snapshot plus this transaction's own writes
    working: Collections,

    changes: Vec<Change>,

    started_at: DateTime<Utc>,
    start_time: Instant,
}

impl Transaction {
    pub fn new(options: TransactionOptions, snapshot: Collections, snapshot_version: u64) -> Self {
        Self {
            id: TransactionId::new(),
            state: TransactionState::Active,
            options,
            snapshot_version,
            working: snapshot,
            changes: Vec::new(),
            started_at: Utc::now(),
            start_time: Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn ensure_active(&self, action: &str) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::Transaction(format!(
                "Cannot {action}: transaction {} is {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Reads see the snapshot overlaid with this transaction's writes.
    pub fn find(&self, namespace: &str, filter: &Document) -> Vec<Document> {
        self.working.find(namespace, filter)
    }

    pub fn count(&self, namespace: &str, filter: &Document) -> u64 {
        self.working.count(namespace, filter)
    }

    /// Key and `_id` the next insert of `doc` will use, assigning `_id` if missing.
    pub fn prepare_insert(doc: &mut Document) -> Result<(String, Value)> {
        ensure_id(doc)
    }

    pub fn insert(&mut self, namespace: &str, id: String, doc: Document) -> Result<()> {
        self.ensure_active("insert")?;
        self.working.insert(namespace, &id, doc.clone())?;
        self.changes.push(Change::Insert {
            namespace: namespace.to_string(),
            id,
            doc,
        });
        Ok(())
    }

    /// First document matching `filter` in the working copy.
    pub fn locate(&self, namespace: &str, filter: &Document) -> Option<(String, Document)> {
        self.working.find_first(namespace, filter)
    }

    pub fn replace(&mut self, namespace: &str, id: String, old: Document, new: Document) -> Result<()> {
        self.ensure_active("replace")?;
        self.working.put(namespace, &id, new.clone());
        self.changes.push(Change::Replace {
            namespace: namespace.to_string(),
            id,
            old,
            new,
        });
        Ok(())
    }

    pub fn delete(&mut self, namespace: &str, id: String) -> Result<bool> {
        self.ensure_active("delete")?;
        let Some(old) = self.working.remove(namespace, &id) else {
            return Ok(false);
        };
        self.changes.push(Change::Delete {
            namespace: namespace.to_string(),
            id,
            old,
        });
        Ok(true)
    }

    /// Mark transaction as committed and release its working copy.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        self.state = TransactionState::Committed;
        self.working = Collections::new();
        Ok(())
    }

    /// Mark transaction as aborted and discard its writes.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active("abort")?;
        self.changes.clear();
        self.working = Collections::new();
        self.state = TransactionState::Aborted;
        Ok(())
    }
}
