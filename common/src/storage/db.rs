use super::types::StoredObject;
use futures::Stream;
use std::{ops::Deref, sync::Arc};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Notification, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

impl SurrealDbClient {
    /// Connect, sign in, and select the namespace/database this client will
    /// operate against for its whole lifetime.
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        if !username.is_empty() {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Define the tables and indexes `ChunkStore`, `VectorIndex`, and the
    /// `IngestJob` queue need, sizing the HNSW vector index to `embedding_dimension`.
    ///
    /// Idempotent: safe to call on every process start.
    pub async fn ensure_initialized(&self, embedding_dimension: usize) -> Result<(), Error> {
        self.build_indexes(embedding_dimension).await
    }

    pub async fn build_indexes(&self, embedding_dimension: usize) -> Result<(), Error> {
        self.client
            .query("DEFINE TABLE document SCHEMALESS")
            .await?;
        self.client.query("DEFINE TABLE chunk SCHEMALESS").await?;
        self.client
            .query("DEFINE TABLE ingest_job SCHEMALESS")
            .await?;

        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_chunk_embedding ON chunk FIELDS embedding HNSW DIMENSION {embedding_dimension}"
            ))
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_document ON chunk FIELDS source_document_id")
            .await?;
        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_chunk_doc_seq ON chunk \
                 FIELDS source_document_id, sequence_in_document UNIQUE",
            )
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_document_file_path ON document FIELDS file_path UNIQUE")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_status ON ingest_job FIELDS state")
            .await?;
        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_job_document ON ingest_job FIELDS document_id",
            )
            .await?;

        Ok(())
    }

    /// Rebuild the chunk HNSW index, e.g. after the embedding dimension changes.
    pub async fn rebuild_indexes(&self, embedding_dimension: usize) -> Result<(), Error> {
        self.client
            .query(format!(
                "REMOVE INDEX IF EXISTS idx_chunk_embedding ON chunk;
                 DEFINE INDEX idx_chunk_embedding ON chunk FIELDS embedding HNSW DIMENSION {embedding_dimension}"
            ))
            .await?;
        Ok(())
    }

    pub async fn drop_table<T>(&self) -> Result<Vec<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.delete(T::table_name()).await
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve all objects from a certain table, requires the struct to implement StoredObject
    ///
    /// # Returns
    /// * `Result` - Vec<T> or Error
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to retrieve
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The found item or Error
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    /// Operation to delete a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to delete
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The deleted item or Error
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    /// Operation to listen to a table for updates, requires the struct to implement StoredObject
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The deleted item or Error
    pub async fn listen<T>(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification<T>, Error>>, Error>
    where
        T: for<'de> StoredObject + std::marker::Unpin,
    {
        self.client.select(T::table_name()).live().await
    }
}

/// Whether `err` is a `UNIQUE` index violation, so callers can translate it
/// into `AppError::AlreadyExists` instead of a generic database error.
pub fn is_unique_violation(err: &Error) -> bool {
    err.to_string().contains("already contains")
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
