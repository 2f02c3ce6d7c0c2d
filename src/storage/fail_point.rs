// ============================================================================
// Fail Points
// ============================================================================
//
// Deterministic fault injection for store commands. A configured fail point
// makes the next matching command(s) fail with a chosen error, optionally
// after a delay, and optionally after the command has already been applied
// (a lost acknowledgement).
//
// ============================================================================

use crate::core::DbError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailCommand {
    Insert,
    Replace,
    Delete,
    Find,
    Commit,
    Abort,
}

impl fmt::Display for FailCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailCommand::Insert => "insert",
            FailCommand::Replace => "replace",
            FailCommand::Delete => "delete",
            FailCommand::Find => "find",
            FailCommand::Commit => "commit",
            FailCommand::Abort => "abort",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailPointMode {
    /// Fire for the next `n` matching commands, then switch off.
    Times(u32),
    AlwaysOn,
    Off,
}

/// Error a fail point raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPointError {
    Network,
    WriteConflict,
    NotPrimary,
    DuplicateKey,
    Validation,
}

impl FailPointError {
    fn to_error(self, command: FailCommand) -> DbError {
        let detail = format!("injected by fail point on '{command}'");
        match self {
            FailPointError::Network => DbError::Network(detail),
            FailPointError::WriteConflict => DbError::WriteConflict(detail),
            FailPointError::NotPrimary => DbError::NotPrimary(detail),
            FailPointError::DuplicateKey => DbError::DuplicateKey(detail),
            FailPointError::Validation => DbError::Validation(detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailPoint {
    pub command: FailCommand,
    pub mode: FailPointMode,
    pub error: FailPointError,
    /// Apply the command, then report the error.
    pub apply_first: bool,
    /// Delay before the command runs.
    pub block_time: Option<Duration>,
}

impl FailPoint {
    pub fn new(command: FailCommand, error: FailPointError) -> Self {
        Self {
            command,
            mode: FailPointMode::Times(1),
            error,
            apply_first: false,
            block_time: None,
        }
    }

    pub fn times(mut self, n: u32) -> Self {
        self.mode = FailPointMode::Times(n);
        self
    }

    pub fn always_on(mut self) -> Self {
        self.mode = FailPointMode::AlwaysOn;
        self
    }

    pub fn apply_first(mut self) -> Self {
        self.apply_first = true;
        self
    }

    pub fn block_time(mut self, delay: Duration) -> Self {
        self.block_time = Some(delay);
        self
    }
}

/// Outcome of a fail point firing.
#[derive(Debug, Clone)]
pub(crate) struct Triggered {
    pub error: DbError,
    pub apply_first: bool,
    pub block_time: Option<Duration>,
}

/// Registry of configured fail points, one per command.
#[derive(Debug, Default)]
pub struct FailPoints {
    points: Mutex<HashMap<FailCommand, FailPoint>>,
}

impl FailPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `point`, replacing any fail point on the same command.
    pub fn configure(&self, point: FailPoint) {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        if point.mode == FailPointMode::Off {
            points.remove(&point.command);
        } else {
            points.insert(point.command, point);
        }
    }

    pub fn disable(&self, command: FailCommand) {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points.remove(&command);
    }

    pub fn clear(&self) {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points.clear();
    }

    pub fn is_armed(&self, command: FailCommand) -> bool {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points.contains_key(&command)
    }

    /// Consumes one firing of the fail point on `command`, if any.
    pub(crate) fn trigger(&self, command: FailCommand) -> Option<Triggered> {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let point = points.get_mut(&command)?;

        let triggered = Triggered {
            error: point.error.to_error(command),
            apply_first: point.apply_first,
            block_time: point.block_time,
        };

        match point.mode {
            FailPointMode::AlwaysOn => {}
            FailPointMode::Times(n) if n > 1 => point.mode = FailPointMode::Times(n - 1),
            FailPointMode::Times(_) | FailPointMode::Off => {
                points.remove(&command);
            }
        }

        Some(triggered)
    }
}
