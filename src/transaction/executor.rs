use super::retry::{ErrorClass, TransactionRetryPolicy, classify_commit_error, classify_error};
use super::{TransactionOptions, TransactionState};
use crate::core::{DbError, Result};
use crate::interface::TransactionalSession;
use futures::FutureExt;
use log::{debug, warn};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

/// Runs `work` inside a transaction on `session`, retrying on transient failures.
///
/// Each attempt starts a transaction, hands a clone of the session to `work`
/// and commits if `work` returns `Ok`:
///
/// - a transient error from `work` aborts the attempt and, budget permitting,
///   restarts it after backoff;
/// - a commit with an unknown outcome is retried at the commit step, then
///   falls back to a full restart;
/// - any other error aborts the attempt and is returned unchanged.
///
/// If `work` commits or aborts the transaction itself, its result is returned
/// as-is. If `work` panics, the transaction is aborted before the panic
/// continues.
pub async fn with_transaction<S, F, Fut, T>(
    session: &S,
    options: &TransactionOptions,
    policy: &TransactionRetryPolicy,
    work: F,
) -> Result<T>
where
    S: TransactionalSession,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let Some(limit) = policy.timeout else {
        return run_attempts(session, options, policy, work).await;
    };

    match tokio::time::timeout(limit, run_attempts(session, options, policy, work)).await {
        Ok(result) => result,
        Err(_) => {
            abort_if_active(session).await;
            warn!(
                "with_transaction on session {} timed out after {}ms",
                session.session_id(),
                limit.as_millis()
            );
            Err(DbError::Timeout(format!(
                "transaction did not complete within {}ms",
                limit.as_millis()
            )))
        }
    }
}

async fn run_attempts<S, F, Fut, T>(
    session: &S,
    options: &TransactionOptions,
    policy: &TransactionRetryPolicy,
    mut work: F,
) -> Result<T>
where
    S: TransactionalSession,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt = 0usize;

    'transaction: loop {
        attempt += 1;
        session.start_transaction(options.clone()).await?;
        debug!(
            "with_transaction attempt {} started on session {}",
            attempt,
            session.session_id()
        );

        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| work(session.clone()))) {
            Ok(fut) => fut,
            Err(panic) => {
                abort_if_active(session).await;
                std::panic::resume_unwind(panic);
            }
        };
        let outcome = AssertUnwindSafe(fut).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                abort_if_active(session).await;
                std::panic::resume_unwind(panic);
            }
        };

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                abort_if_active(session).await;
                if classify_error(&err) == ErrorClass::Transient
                    && policy.can_retry(attempt, started.elapsed())
                {
                    let backoff = policy.backoff(attempt);
                    warn!(
                        "with_transaction retry on transient error (attempt {} of {}): {} (backoff={}ms)",
                        attempt,
                        policy.max_attempts.max(1),
                        err,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                    continue 'transaction;
                }
                debug!("with_transaction attempt {} failed: {}", attempt, err);
                return Err(err);
            }
        };

        if !session.transaction_state().await.is_active() {
            return Ok(value);
        }

        let mut commit_attempt = 0usize;
        loop {
            commit_attempt += 1;
            let err = match session.commit_transaction().await {
                Ok(()) => {
                    debug!(
                        "with_transaction committed on attempt {} (commit attempt {})",
                        attempt, commit_attempt
                    );
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = classify_commit_error(&err);
            if class == ErrorClass::UnknownCommitResult
                && policy.can_retry_commit(commit_attempt, started.elapsed())
            {
                warn!(
                    "with_transaction commit retry on unknown result (commit attempt {} of {}): {}",
                    commit_attempt,
                    policy.max_commit_attempts.max(1),
                    err
                );
                continue;
            }

            if class != ErrorClass::Fatal && policy.can_retry(attempt, started.elapsed()) {
                match session.transaction_state().await {
                    TransactionState::Committed => return Ok(value),
                    TransactionState::Active => abort_if_active(session).await,
                    _ => {}
                }
                let backoff = policy.backoff(attempt);
                warn!(
                    "with_transaction restarting after commit failure (attempt {} of {}): {} (backoff={}ms)",
                    attempt,
                    policy.max_attempts.max(1),
                    err,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
                continue 'transaction;
            }

            abort_if_active(session).await;
            return Err(err);
        }
    }
}

async fn abort_if_active<S: TransactionalSession>(session: &S) {
    if !session.transaction_state().await.is_active() {
        return;
    }
    if let Err(err) = session.abort_transaction().await {
        debug!(
            "abort on session {} failed, ignoring: {}",
            session.session_id(),
            err
        );
    }
}
