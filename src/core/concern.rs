use super::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Read isolation requested for reads inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadConcern {
    #[default]
    Local,
    Majority,
    Snapshot,
}

impl fmt::Display for ReadConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReadConcern::Local => "local",
            ReadConcern::Majority => "majority",
            ReadConcern::Snapshot => "snapshot",
        };
        write!(f, "{label}")
    }
}

impl FromStr for ReadConcern {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ReadConcern::Local),
            "majority" => Ok(ReadConcern::Majority),
            "snapshot" => Ok(ReadConcern::Snapshot),
            other => Err(DbError::Config(format!("Unknown read concern level '{other}'"))),
        }
    }
}

/// Acknowledgement level requested for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: Acknowledgment,
    pub wtimeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acknowledgment {
    Nodes(u32),
    Majority,
}

impl WriteConcern {
    pub fn majority() -> Self {
        Self {
            w: Acknowledgment::Majority,
            wtimeout: None,
        }
    }

    pub fn nodes(n: u32) -> Self {
        Self {
            w: Acknowledgment::Nodes(n),
            wtimeout: None,
        }
    }

    pub fn wtimeout(mut self, timeout: Duration) -> Self {
        self.wtimeout = Some(timeout);
        self
    }

    pub fn is_acknowledged(&self) -> bool {
        !matches!(self.w, Acknowledgment::Nodes(0))
    }

    /// Transactions require an acknowledged write concern.
    pub fn validate_for_transaction(&self) -> Result<()> {
        if !self.is_acknowledged() {
            return Err(DbError::Validation(
                "Transactions do not support unacknowledged write concern".into(),
            ));
        }
        Ok(())
    }
}

impl Default for WriteConcern {
    fn default() -> Self {
        Self::nodes(1)
    }
}

impl fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.w {
            Acknowledgment::Majority => write!(f, "w=majority")?,
            Acknowledgment::Nodes(n) => write!(f, "w={n}")?,
        }
        if let Some(timeout) = self.wtimeout {
            write!(f, ", wtimeout={}ms", timeout.as_millis())?;
        }
        Ok(())
    }
}

impl FromStr for WriteConcern {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("majority") {
            return Ok(Self::majority());
        }
        s.parse::<u32>()
            .map(Self::nodes)
            .map_err(|_| DbError::Config(format!("Invalid write concern '{s}'")))
    }
}
