// ============================================================================
// doctxn Library
// ============================================================================

pub mod core;
pub mod storage;
pub mod result;
pub mod facade;
pub mod connection;
pub mod session;
pub mod transaction;
pub mod interface;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;

// Re-export main types for convenience
pub use crate::core::{Acknowledgment, DbError, Document, ErrorLabel, ReadConcern, Result, WriteConcern};
pub use connection::ClientConfig;
pub use facade::{Collection, CollectionOptions, Database};
pub use interface::{SessionFactory, TransactionalSession};
pub use result::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
pub use session::{ClientSession, SessionId, SessionOptions};
pub use storage::{
    FailCommand, FailPoint, FailPointError, FailPointMode, FailPoints, Store, StoreStats,
};
pub use transaction::{
    TransactionOptions, TransactionRetryPolicy, TransactionState, with_transaction,
};

use session::SessionRegistry;

// ============================================================================
// High-level Client API
// ============================================================================

/// Database client
///
/// Owns the document store, hands out database/collection handles and opens
/// sessions. Cheap to clone; clones share the same store and sessions.
///
/// # Examples
///
/// ```
/// use doctxn::Client;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let client = Client::new();
/// let restaurants = client.database("sample_restaurants").collection("restaurants");
///
/// let session = client.start_session().await.unwrap();
/// session
///     .with_transaction(|session| {
///         let restaurants = restaurants.clone();
///         async move {
///             restaurants
///                 .insert_one_with_session(json!({"name": "PyMongo Pizza", "cuisine": "Pizza"}), &session)
///                 .await?;
///             restaurants
///                 .insert_one_with_session(json!({"name": "PyMongo Burger", "cuisine": "Burger"}), &session)
///                 .await?;
///             Ok(())
///         }
///     })
///     .await
///     .unwrap();
///
/// assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 2);
/// client.close().await;
/// # });
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    store: Arc<Store>,
    sessions: Arc<SessionRegistry>,
}

impl Client {
    /// Client over a fresh store with default configuration
    pub fn new() -> Self {
        Self::build(ClientConfig::default(), Arc::new(Store::new()))
    }

    /// Client over a fresh store with custom configuration
    ///
    /// # Examples
    ///
    /// ```
    /// # use doctxn::{Client, ClientConfig, WriteConcern};
    /// # fn main() -> doctxn::Result<()> {
    /// let config = ClientConfig::new()
    ///     .database("sample_restaurants")
    ///     .write_concern(WriteConcern::majority());
    ///
    /// let client = Client::with_config(config)?;
    /// assert_eq!(client.default_database().name(), "sample_restaurants");
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(Store::new()))
    }

    /// Connect using a connection string
    ///
    /// Format: `doctxn://host[:port][/database][?options]`
    pub fn connect_url(url: &str) -> Result<Self> {
        Self::with_config(ClientConfig::from_url(url)?)
    }

    /// Client over an existing store, e.g. to share it between clients.
    pub fn with_store(config: ClientConfig, store: Arc<Store>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, store))
    }

    fn build(config: ClientConfig, store: Arc<Store>) -> Self {
        info!(
            "Client{} ready for {}:{} (default database '{}')",
            config
                .app_name
                .as_deref()
                .map(|name| format!(" '{name}'"))
                .unwrap_or_default(),
            config.host,
            config.port,
            config.database
        );
        Self {
            inner: Arc::new(ClientInner {
                config,
                store,
                sessions: Arc::new(SessionRegistry::default()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn database(&self, name: &str) -> Database {
        Database::new(
            self.inner.store.clone(),
            name,
            self.inner.config.collection_options(),
        )
    }

    /// The database named in the configuration
    pub fn default_database(&self) -> Database {
        self.database(&self.inner.config.database)
    }

    /// Start a session using the configured transaction defaults and retry policy
    pub async fn start_session(&self) -> Result<ClientSession> {
        self.start_session_with_options(self.inner.config.session_options())
            .await
    }

    pub async fn start_session_with_options(&self, options: SessionOptions) -> Result<ClientSession> {
        if self.inner.store.is_closed() {
            return Err(DbError::Closed);
        }
        options.retry_policy.validate()?;
        Ok(ClientSession::new(
            self.inner.store.clone(),
            options,
            &self.inner.sessions,
        ))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Fault injection for the underlying store
    pub fn fail_points(&self) -> &FailPoints {
        self.inner.store.fail_points()
    }

    pub async fn stats(&self) -> StoreStats {
        self.inner.store.stats().await
    }

    /// Number of sessions that have not ended
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Ends every open session (aborting active transactions) and closes the store.
    pub async fn close(&self) {
        for session in self.inner.sessions.live() {
            session.end_session().await;
        }
        self.inner.store.close();
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionFactory for Client {
    type Session = ClientSession;

    async fn open_session(&self) -> Result<ClientSession> {
        self.start_session().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_client_connect_url() {
        let client = Client::connect_url("doctxn://localhost:27017/sample_restaurants").unwrap();
        assert_eq!(client.default_database().name(), "sample_restaurants");
    }

    #[tokio::test]
    async fn test_client_sessions_are_tracked() {
        let client = Client::new();
        let first = client.start_session().await.unwrap();
        let _second = client.open_session().await.unwrap();
        assert_eq!(client.active_sessions(), 2);

        first.end_session().await;
        assert_eq!(client.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_close_aborts_open_transactions() {
        let client = Client::new();
        let coll = client.database("db").collection("c");

        let session = client.start_session().await.unwrap();
        session.start_transaction(TransactionOptions::default()).await.unwrap();
        coll.insert_one_with_session(json!({"_id": 1}), &session).await.unwrap();

        client.close().await;

        assert!(session.is_ended().await);
        assert_eq!(client.stats().await.transactions_aborted, 1);
        assert_eq!(client.stats().await.documents, 0);
        assert!(matches!(client.start_session().await, Err(DbError::Closed)));
        assert!(matches!(coll.insert_one(json!({})).await, Err(DbError::Closed)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig::new().database("");
        assert!(Client::with_config(config).is_err());
    }
}
