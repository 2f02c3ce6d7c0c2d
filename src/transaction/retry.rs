use crate::core::{DbError, ErrorLabel, Result};
use std::time::Duration;

/// Retry budget for [`crate::transaction::with_transaction`].
///
/// Retries stop at whichever comes first: `max_attempts` whole-transaction
/// attempts, or `max_elapsed` since the first attempt started. `timeout`, when
/// set, additionally cancels an attempt that is still running.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRetryPolicy {
    /// Maximum number of whole-transaction attempts, including the first.
    pub max_attempts: usize,
    /// Maximum number of commit attempts per transaction attempt.
    pub max_commit_attempts: usize,
    /// Base duration in milliseconds for backoff calculation.
    pub base_backoff_ms: u64,
    /// Maximum duration in milliseconds for backoff.
    pub max_backoff_ms: u64,
    /// No new attempt is started once this much time has passed.
    pub max_elapsed: Duration,
    /// Hard deadline for the whole call, including a running attempt.
    pub timeout: Option<Duration>,
}

impl Default for TransactionRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_commit_attempts: 3,
            base_backoff_ms: 5,
            max_backoff_ms: 500,
            max_elapsed: Duration::from_secs(120),
            timeout: None,
        }
    }
}

impl TransactionRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// One attempt, one commit, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            max_commit_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn max_commit_attempts(mut self, attempts: usize) -> Self {
        self.max_commit_attempts = attempts;
        self
    }

    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.base_backoff_ms = base;
        self.max_backoff_ms = max;
        self
    }

    pub fn max_elapsed(mut self, limit: Duration) -> Self {
        self.max_elapsed = limit;
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DbError::Config("max_attempts must be > 0".into()));
        }
        if self.max_commit_attempts == 0 {
            return Err(DbError::Config("max_commit_attempts must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(DbError::Config(
                "max_backoff_ms cannot be less than base_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Whether another whole-transaction attempt may follow attempt `attempt`.
    pub fn can_retry(&self, attempt: usize, elapsed: Duration) -> bool {
        attempt < self.max_attempts.max(1) && elapsed < self.max_elapsed
    }

    /// Whether commit attempt `commit_attempt` may be followed by another.
    pub fn can_retry_commit(&self, commit_attempt: usize, elapsed: Duration) -> bool {
        commit_attempt < self.max_commit_attempts.max(1) && elapsed < self.max_elapsed
    }

    /// Exponential backoff after attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let base = self.base_backoff_ms;
        let cap = self.max_backoff_ms.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        Duration::from_millis(backoff)
    }
}

/// How the executor treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Restart the whole transaction.
    Transient,
    /// Retry the commit step only.
    UnknownCommitResult,
    /// Abort and surface.
    Fatal,
}

/// Classifies an error raised by the unit of work or by starting a transaction.
///
/// Labels win. Unlabeled network, write-conflict and not-primary errors are
/// treated as transient as well.
pub fn classify_error(err: &DbError) -> ErrorClass {
    if err.has_label(ErrorLabel::TransientTransaction) || err.is_transient_kind() {
        return ErrorClass::Transient;
    }
    ErrorClass::Fatal
}

/// Classifies an error raised by a commit attempt.
///
/// An unlabeled network error or timeout during commit leaves the outcome
/// unknown, so it is retried at the commit step.
pub fn classify_commit_error(err: &DbError) -> ErrorClass {
    if err.has_label(ErrorLabel::UnknownTransactionCommitResult) {
        return ErrorClass::UnknownCommitResult;
    }
    if err.has_label(ErrorLabel::TransientTransaction) {
        return ErrorClass::Transient;
    }
    match err.kind() {
        DbError::Network(_) | DbError::Timeout(_) | DbError::NotPrimary(_) => {
            ErrorClass::UnknownCommitResult
        }
        DbError::WriteConflict(_) => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}
