use async_trait::async_trait;
use crate::core::Result;
use crate::transaction::{TransactionOptions, TransactionState};

/// The session surface the transaction executor drives.
///
/// `ClientSession` is the in-memory implementation. Anything else that can
/// start, commit and abort a transaction (a wrapper over a remote driver, or a
/// scripted fake in tests) can implement this trait and reuse
/// [`crate::transaction::with_transaction`] unchanged.
///
/// Handles are cheap clones of one logical session; the executor passes a
/// clone into the unit of work.
#[async_trait]
pub trait TransactionalSession: Clone + Send + Sync {
    /// Stable identifier used in log lines.
    fn session_id(&self) -> String;

    /// Starts a transaction. Fails if one is already active.
    async fn start_transaction(&self, options: TransactionOptions) -> Result<()>;

    /// Commits the active transaction.
    ///
    /// Calling this again after a successful commit must succeed without
    /// re-applying writes, so the commit step can be retried safely.
    async fn commit_transaction(&self) -> Result<()>;

    /// Aborts the active transaction, discarding its writes.
    async fn abort_transaction(&self) -> Result<()>;

    /// State of the most recent transaction on this session.
    async fn transaction_state(&self) -> TransactionState;
}

/// Opens sessions against a transactional store.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: TransactionalSession;

    async fn open_session(&self) -> Result<Self::Session>;
}
