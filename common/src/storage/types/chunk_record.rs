use crate::error::AppError;
use crate::storage::db::{is_unique_violation, SurrealDbClient};
use crate::stored_object;
use std::collections::BTreeMap;
use surrealdb::sql::Thing;

stored_object!(ChunkRecord, "chunk", {
    source_document_id: String,
    chunk_text: String,
    sequence_in_document: u32,
    metadata: BTreeMap<String, String>,
    /// Present once `IngestPipeline` embeds the chunk; absent chunks have no
    /// counterpart in the `VectorIndex` yet.
    embedding: Option<Vec<f32>>
});

/// One chunk ready for `bulk_create_chunks`, before an id has been assigned.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub source_document_id: String,
    pub chunk_text: String,
    pub sequence_in_document: u32,
}

impl ChunkRecord {
    /// Persist an entire document's chunks in one transaction (§4.2). Any
    /// integrity failure (a duplicate `sequence_in_document`) rejects the
    /// whole batch rather than leaving a partial set behind.
    pub async fn bulk_create(
        db: &SurrealDbClient,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<Self>, AppError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let now = chrono::Utc::now();
        let records: Vec<Self> = chunks
            .into_iter()
            .map(|c| ChunkRecord {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: now,
                updated_at: now,
                source_document_id: c.source_document_id,
                chunk_text: c.chunk_text,
                sequence_in_document: c.sequence_in_document,
                metadata: BTreeMap::new(),
                embedding: None,
            })
            .collect();

        let mut tx = db.client.query("BEGIN TRANSACTION");
        for record in &records {
            tx = tx
                .query("CREATE type::thing('chunk', $id) CONTENT $content")
                .bind(("id", record.id.clone()))
                .bind(("content", record.clone()));
        }
        let outcome = match tx.query("COMMIT TRANSACTION").await {
            Ok(response) => response.check(),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(_) => Ok(records),
            Err(e) if is_unique_violation(&e) => Err(AppError::AlreadyExists(
                "duplicate (source_document_id, sequence_in_document) in batch".to_string(),
            )),
            Err(e) => Err(AppError::Database(e)),
        }
    }

    /// Attach an embedding to an already-persisted chunk (step 8 → 9 of §4.7).
    pub async fn set_embedding(
        db: &SurrealDbClient,
        id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing('chunk', $id) SET embedding = $embedding, updated_at = time::now()")
            .bind(("id", id.to_string()))
            .bind(("embedding", embedding))
            .await?;
        Ok(())
    }

    /// Fetch chunks by id; order is not guaranteed, callers reorder (§4.2).
    pub async fn get_by_ids(
        db: &SurrealDbClient,
        ids: &[String],
    ) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from(("chunk", id.as_str())))
            .collect();
        let mut response = db
            .client
            .query("SELECT * FROM chunk WHERE id IN $things")
            .bind(("things", things))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn count_for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<usize, AppError> {
        let mut response = db
            .client
            .query("SELECT count() FROM chunk WHERE source_document_id = $document_id GROUP ALL")
            .bind(("document_id", document_id.to_string()))
            .await?;
        let count: Option<usize> = response.take("count")?;
        Ok(count.unwrap_or(0))
    }

    /// Delete every chunk belonging to `document_id`, returning the count
    /// removed. Used both by document cascade and by purge-on-reentry (§4.7
    /// step 3).
    pub async fn delete_by_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<usize, AppError> {
        let mut response = db
            .client
            .query("DELETE FROM chunk WHERE source_document_id = $document_id RETURN BEFORE")
            .bind(("document_id", document_id.to_string()))
            .await?;
        let deleted: Vec<Self> = response.take(0)?;
        Ok(deleted.len())
    }
}
