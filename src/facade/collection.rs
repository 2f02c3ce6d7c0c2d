use crate::core::document::into_document;
use crate::core::{DbError, Document, ReadConcern, Result, WriteConcern};
use crate::result::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
use crate::session::ClientSession;
use crate::storage::Store;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Default concerns for operations issued through a collection handle.
///
/// Writes outside a transaction refuse an unacknowledged (`w:0`) write
/// concern. The read concern is informational: reads always see the latest
/// committed data of this single-node store. Inside a transaction the
/// transaction's own options apply instead.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CollectionOptions {
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
}

impl CollectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_concern(mut self, read_concern: ReadConcern) -> Self {
        self.read_concern = Some(read_concern);
        self
    }

    pub fn write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = Some(write_concern);
        self
    }
}

/// Handle to one collection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Collection {
    store: Arc<Store>,
    database: String,
    name: String,
    options: CollectionOptions,
}

impl Collection {
    pub(crate) fn new(store: Arc<Store>, database: &str, name: &str, options: CollectionOptions) -> Self {
        Self {
            store,
            database: database.to_string(),
            name: name.to_string(),
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    /// `database.collection`
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    pub fn read_concern(&self) -> ReadConcern {
        self.options.read_concern.unwrap_or_default()
    }

    pub fn write_concern(&self) -> WriteConcern {
        self.options.write_concern.unwrap_or_default()
    }

    /// A handle to the same collection with different default concerns.
    /// Concerns left unset in `options` keep their current value.
    pub fn with_options(&self, options: CollectionOptions) -> Self {
        Self {
            options: CollectionOptions {
                read_concern: options.read_concern.or(self.options.read_concern),
                write_concern: options.write_concern.or(self.options.write_concern),
            },
            ..self.clone()
        }
    }

    /// The store acknowledges every auto-commit write; `w:0` is refused.
    fn check_write_concern(&self) -> Result<()> {
        let write_concern = self.write_concern();
        if !write_concern.is_acknowledged() {
            return Err(DbError::Validation(format!(
                "Unacknowledged write concern ({write_concern}) is not supported for writes to {}",
                self.namespace()
            )));
        }
        Ok(())
    }

    async fn check_session_write_concern(&self, session: &ClientSession) -> Result<()> {
        if session.in_transaction().await {
            return Ok(());
        }
        self.check_write_concern()
    }

    pub async fn insert_one(&self, doc: impl Serialize) -> Result<InsertOneResult> {
        self.check_write_concern()?;
        let doc = to_document(doc)?;
        let inserted_id = self.store.insert_one(&self.namespace(), doc).await?;
        Ok(InsertOneResult { inserted_id })
    }

    pub async fn insert_one_with_session(
        &self,
        doc: impl Serialize,
        session: &ClientSession,
    ) -> Result<InsertOneResult> {
        self.check_session_write_concern(session).await?;
        let doc = to_document(doc)?;
        let inserted_id = session.insert_one(&self.namespace(), doc).await?;
        Ok(InsertOneResult { inserted_id })
    }

    /// Inserts every document or none of them.
    pub async fn insert_many<I, D>(&self, docs: I) -> Result<InsertManyResult>
    where
        I: IntoIterator<Item = D>,
        D: Serialize,
    {
        self.check_write_concern()?;
        let docs = to_documents(docs)?;
        let inserted_ids = self.store.insert_many(&self.namespace(), docs).await?;
        Ok(InsertManyResult { inserted_ids })
    }

    pub async fn insert_many_with_session<I, D>(
        &self,
        docs: I,
        session: &ClientSession,
    ) -> Result<InsertManyResult>
    where
        I: IntoIterator<Item = D>,
        D: Serialize,
    {
        self.check_session_write_concern(session).await?;
        let docs = to_documents(docs)?;
        let inserted_ids = session.insert_many(&self.namespace(), docs).await?;
        Ok(InsertManyResult { inserted_ids })
    }

    pub async fn find(&self, filter: impl Serialize) -> Result<Vec<Document>> {
        let filter = to_document(filter)?;
        self.store.find(&self.namespace(), &filter).await
    }

    pub async fn find_with_session(
        &self,
        filter: impl Serialize,
        session: &ClientSession,
    ) -> Result<Vec<Document>> {
        let filter = to_document(filter)?;
        session.find(&self.namespace(), &filter).await
    }

    pub async fn find_one(&self, filter: impl Serialize) -> Result<Option<Document>> {
        Ok(self.find(filter).await?.into_iter().next())
    }

    pub async fn find_one_with_session(
        &self,
        filter: impl Serialize,
        session: &ClientSession,
    ) -> Result<Option<Document>> {
        Ok(self.find_with_session(filter, session).await?.into_iter().next())
    }

    /// Finds matching documents and deserializes them into `T`.
    pub async fn find_as<T: DeserializeOwned>(&self, filter: impl Serialize) -> Result<Vec<T>> {
        self.find(filter)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(serde_json::Value::Object(doc)).map_err(Into::into))
            .collect()
    }

    pub async fn replace_one(
        &self,
        filter: impl Serialize,
        replacement: impl Serialize,
    ) -> Result<UpdateResult> {
        self.check_write_concern()?;
        let filter = to_document(filter)?;
        let replacement = to_document(replacement)?;
        let replaced = self
            .store
            .replace_one(&self.namespace(), &filter, replacement)
            .await?;
        Ok(update_result(replaced))
    }

    pub async fn replace_one_with_session(
        &self,
        filter: impl Serialize,
        replacement: impl Serialize,
        session: &ClientSession,
    ) -> Result<UpdateResult> {
        self.check_session_write_concern(session).await?;
        let filter = to_document(filter)?;
        let replacement = to_document(replacement)?;
        let replaced = session
            .replace_one(&self.namespace(), &filter, replacement)
            .await?;
        Ok(update_result(replaced))
    }

    pub async fn delete_one(&self, filter: impl Serialize) -> Result<DeleteResult> {
        self.check_write_concern()?;
        let filter = to_document(filter)?;
        let deleted_count = self.store.delete_one(&self.namespace(), &filter).await?;
        Ok(DeleteResult { deleted_count })
    }

    pub async fn delete_one_with_session(
        &self,
        filter: impl Serialize,
        session: &ClientSession,
    ) -> Result<DeleteResult> {
        self.check_session_write_concern(session).await?;
        let filter = to_document(filter)?;
        let deleted_count = session.delete_one(&self.namespace(), &filter).await?;
        Ok(DeleteResult { deleted_count })
    }

    pub async fn count_documents(&self, filter: impl Serialize) -> Result<u64> {
        let filter = to_document(filter)?;
        self.store.count(&self.namespace(), &filter).await
    }

    pub async fn count_documents_with_session(
        &self,
        filter: impl Serialize,
        session: &ClientSession,
    ) -> Result<u64> {
        Ok(self.find_with_session(filter, session).await?.len() as u64)
    }

    pub async fn drop(&self) -> Result<bool> {
        self.store.drop_collection(&self.namespace()).await
    }
}

fn to_document(value: impl Serialize) -> Result<Document> {
    into_document(serde_json::to_value(value)?)
}

fn to_documents<I, D>(docs: I) -> Result<Vec<Document>>
where
    I: IntoIterator<Item = D>,
    D: Serialize,
{
    docs.into_iter().map(to_document).collect()
}

fn update_result(replaced: u64) -> UpdateResult {
    UpdateResult {
        matched_count: replaced,
        modified_count: replaced,
    }
}
