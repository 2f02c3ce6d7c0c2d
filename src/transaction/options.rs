use crate::core::{ReadConcern, Result, WriteConcern};
use std::time::Duration;

/// Options applied to one transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransactionOptions {
    pub read_concern: ReadConcern,
    pub write_concern: WriteConcern,
    /// Upper bound on a single commit attempt.
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_concern(mut self, read_concern: ReadConcern) -> Self {
        self.read_concern = read_concern;
        self
    }

    pub fn write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    pub fn max_commit_time(mut self, limit: Duration) -> Self {
        self.max_commit_time = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.write_concern.validate_for_transaction()
    }
}
