use std::fmt;
use thiserror::Error;

/// Labels attached to errors raised while a transaction is in flight.
///
/// The executor reads these to decide whether a whole transaction, only the
/// commit step, or nothing at all may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorLabel {
    /// The whole transaction may be retried from the start.
    TransientTransaction,
    /// The commit outcome is unknown; the commit may be retried.
    UnknownTransactionCommitResult,
}

impl ErrorLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorLabel::TransientTransaction => "TransientTransactionError",
            ErrorLabel::UnknownTransactionCommitResult => "UnknownTransactionCommitResult",
        }
    }
}

impl fmt::Display for ErrorLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Not primary: {0}")]
    NotPrimary(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Client is closed")]
    Closed,

    #[error("Application error: {0}")]
    Application(String),

    #[error("{source}")]
    Labeled {
        labels: Vec<ErrorLabel>,
        #[source]
        source: Box<DbError>,
    },
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Attaches `label` to the error. Adding an existing label is a no-op.
    pub fn with_label(self, label: ErrorLabel) -> Self {
        match self {
            DbError::Labeled { mut labels, source } => {
                if !labels.contains(&label) {
                    labels.push(label);
                }
                DbError::Labeled { labels, source }
            }
            other => DbError::Labeled {
                labels: vec![label],
                source: Box::new(other),
            },
        }
    }

    pub fn labels(&self) -> &[ErrorLabel] {
        match self {
            DbError::Labeled { labels, .. } => labels,
            _ => &[],
        }
    }

    pub fn has_label(&self, label: ErrorLabel) -> bool {
        self.labels().contains(&label)
    }

    /// The underlying error with labels stripped.
    pub fn kind(&self) -> &DbError {
        match self {
            DbError::Labeled { source, .. } => source.kind(),
            other => other,
        }
    }

    /// Errors that are safe to retry as a whole transaction even when unlabeled.
    pub fn is_transient_kind(&self) -> bool {
        matches!(
            self.kind(),
            DbError::Network(_) | DbError::WriteConflict(_) | DbError::NotPrimary(_)
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Session(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
