// ============================================================================
// Transaction Module
// ============================================================================
//
// Snapshot-isolated document transactions and the retrying unit-of-work
// executor that drives them.
//
// - state:    transaction lifecycle (None -> Active -> Committed/Aborted)
// - change:   change log replayed onto committed state at commit
// - options:  per-transaction read/write concern
// - retry:    retry budget, backoff and error classification
// - executor: with_transaction loop over any TransactionalSession
//
// ============================================================================

pub mod change;
pub mod executor;
pub mod options;
pub mod retry;
pub mod state;

pub use change::Change;
pub use executor::with_transaction;
pub use options::TransactionOptions;
pub use retry::{ErrorClass, TransactionRetryPolicy, classify_commit_error, classify_error};
pub use state::{Transaction, TransactionId, TransactionState};
