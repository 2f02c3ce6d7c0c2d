use crate::core::concern::Acknowledgment;
use crate::core::{DbError, ReadConcern, Result, WriteConcern};
use crate::facade::CollectionOptions;
use crate::session::SessionOptions;
use crate::transaction::{TransactionOptions, TransactionRetryPolicy};
use std::time::Duration;

pub const URL_SCHEME: &str = "doctxn://";
pub const DEFAULT_PORT: u16 = 27017;

/// Client configuration
///
/// Built with chained setters or parsed from a connection string.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub host: String,

    pub port: u16,

    /// Database used by `Client::default_database`
    pub database: String,

    /// Label reported in log lines
    pub app_name: Option<String>,

    pub read_concern: ReadConcern,

    pub write_concern: WriteConcern,

    /// Upper bound on a single commit attempt
    pub max_commit_time: Option<Duration>,

    /// Retry budget for `with_transaction`
    pub retry_policy: TransactionRetryPolicy,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: "test".to_string(),
            app_name: None,
            read_concern: ReadConcern::default(),
            write_concern: WriteConcern::default(),
            max_commit_time: None,
            retry_policy: TransactionRetryPolicy::default(),
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    pub fn app_name(mut self, app_name: &str) -> Self {
        self.app_name = Some(app_name.to_string());
        self
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

    pub fn retry_policy(mut self, policy: TransactionRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Parse from connection string
    ///
    /// Format: `doctxn://host[:port][/database][?option=value&...]`
    ///
    /// Options: `appName`, `w`, `wtimeoutMS`, `readConcernLevel`,
    /// `maxCommitTimeMS`, `maxTxnAttempts`, `maxCommitAttempts`,
    /// `maxTxnElapsedMS`, `txnTimeoutMS`. Option names are case-insensitive.
    ///
    /// # Examples
    ///
    /// ```
    /// # use doctxn::ClientConfig;
    /// let config = ClientConfig::from_url(
    ///     "doctxn://localhost:27017/sample_restaurants?w=majority&maxTxnAttempts=5"
    /// ).unwrap();
    /// assert_eq!(config.database, "sample_restaurants");
    /// assert_eq!(config.retry_policy.max_attempts, 5);
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| DbError::Config(format!("URL must start with '{URL_SCHEME}'")))?;

        let (base, query) = match rest.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (rest, None),
        };

        let (host_port, database) = match base.split_once('/') {
            Some((host_port, database)) => (host_port, Some(database)),
            None => (base, None),
        };

        if host_port.is_empty() {
            return Err(DbError::Config("Host cannot be empty".into()));
        }

        let mut config = Self::new();
        match host_port.split_once(':') {
            Some((host, port)) => {
                config.host = host.to_string();
                config.port = port
                    .parse()
                    .map_err(|_| DbError::Config(format!("Invalid port '{port}'")))?;
            }
            None => config.host = host_port.to_string(),
        }

        if let Some(database) = database.filter(|db| !db.is_empty()) {
            config.database = database.to_string();
        }

        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| DbError::Config(format!("Option '{pair}' has no value")))?;
            config.apply_option(key, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key.to_ascii_lowercase().as_str() {
            "appname" => self.app_name = Some(value.to_string()),
            "w" => {
                let wtimeout = self.write_concern.wtimeout;
                self.write_concern = value.parse()?;
                self.write_concern.wtimeout = wtimeout;
            }
            "wtimeoutms" => self.write_concern.wtimeout = Some(parse_millis(key, value)?),
            "readconcernlevel" => self.read_concern = value.parse()?,
            "maxcommittimems" => self.max_commit_time = Some(parse_millis(key, value)?),
            "maxtxnattempts" => self.retry_policy.max_attempts = parse_number(key, value)?,
            "maxcommitattempts" => self.retry_policy.max_commit_attempts = parse_number(key, value)?,
            "maxtxnelapsedms" => self.retry_policy.max_elapsed = parse_millis(key, value)?,
            "txntimeoutms" => self.retry_policy.timeout = Some(parse_millis(key, value)?),
            _ => return Err(DbError::Config(format!("Unknown option '{key}'"))),
        }
        Ok(())
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        let mut url = format!(
            "{URL_SCHEME}{}:{}/{}?w={}&readConcernLevel={}",
            self.host,
            self.port,
            self.database,
            match self.write_concern.w {
                Acknowledgment::Majority => "majority".to_string(),
                Acknowledgment::Nodes(n) => n.to_string(),
            },
            self.read_concern
        );
        if let Some(app_name) = &self.app_name {
            url.push_str(&format!("&appName={app_name}"));
        }
        url
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(DbError::Config("Host cannot be empty".into()));
        }

        if self.database.is_empty() {
            return Err(DbError::Config("Database name cannot be empty".into()));
        }

        self.retry_policy.validate()
    }

    /// Transaction options derived from the configured concerns.
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            read_concern: self.read_concern,
            write_concern: self.write_concern,
            max_commit_time: self.max_commit_time,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::new()
            .default_transaction_options(self.transaction_options())
            .retry_policy(self.retry_policy.clone())
    }

    pub fn collection_options(&self) -> CollectionOptions {
        CollectionOptions::new()
            .read_concern(self.read_concern)
            .write_concern(self.write_concern)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| DbError::Config(format!("Option '{key}' expects a number, got '{value}'")))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| DbError::Config(format!("Option '{key}' expects milliseconds, got '{value}'")))
}
