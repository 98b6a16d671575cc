use crate::error::AppError;
use crate::storage::db::{is_unique_violation, SurrealDbClient};
use crate::stored_object;

/// Where a document's bytes live, mirrored onto the record so deletion and
/// download know which `BlobStore` backend to address without a config lookup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Local,
    ObjectStore,
}

/// Where a document currently sits in the ingest state machine (§4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Ready,
    Error,
}

stored_object!(DocumentRecord, "document", {
    original_filename: String,
    content_type: String,
    size: u64,
    file_path: String,
    storage_type: StorageType,
    status: DocumentStatus,
    error_message: Option<String>,
    processed_at: Option<chrono::DateTime<chrono::Utc>>,
    number_of_chunks: Option<u32>
});

/// Fields an `update_document_status` call may change; `None` leaves the
/// column untouched. Rejecting an all-`None` patch keeps the operation from
/// being a silent no-op that still bumps `updated_at`.
#[derive(Debug, Default, Clone)]
pub struct DocumentStatusPatch {
    pub status: Option<DocumentStatus>,
    pub processed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub number_of_chunks: Option<u32>,
    pub error_message: Option<String>,
}

impl DocumentStatusPatch {
    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.processed_at.is_none()
            && self.number_of_chunks.is_none()
            && self.error_message.is_none()
    }
}

impl DocumentRecord {
    /// Insert a new record in `uploaded` state. Fails `AlreadyExists` if
    /// `file_path` already names a document (unique per §4.2).
    pub async fn create(
        db: &SurrealDbClient,
        original_filename: String,
        content_type: String,
        size: u64,
        file_path: String,
        storage_type: StorageType,
    ) -> Result<Self, AppError> {
        if Self::get_by_file_path(db, &file_path).await?.is_some() {
            return Err(AppError::AlreadyExists(file_path));
        }

        let now = chrono::Utc::now();
        let record = DocumentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            original_filename,
            content_type,
            size,
            file_path,
            storage_type,
            status: DocumentStatus::Uploaded,
            error_message: None,
            processed_at: None,
            number_of_chunks: None,
        };

        match db.store_item(record.clone()).await {
            Ok(_) => Ok(record),
            Err(e) if is_unique_violation(&e) => Err(AppError::AlreadyExists(record.file_path)),
            Err(e) => Err(AppError::Database(e)),
        }
    }

    pub async fn get(db: &SurrealDbClient, id: &str) -> Result<Option<Self>, AppError> {
        Ok(db.get_item::<Self>(id).await?)
    }

    async fn get_by_file_path(
        db: &SurrealDbClient,
        file_path: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM document WHERE file_path = $file_path LIMIT 1")
            .bind(("file_path", file_path.to_string()))
            .await?;
        let found: Option<Self> = response.take(0)?;
        Ok(found)
    }

    pub async fn list(
        db: &SurrealDbClient,
        limit: u32,
        offset: u32,
        descending: bool,
    ) -> Result<Vec<Self>, AppError> {
        let order = if descending { "DESC" } else { "ASC" };
        let query = format!(
            "SELECT * FROM document ORDER BY created_at {order} LIMIT $limit START $offset"
        );
        let mut response = db
            .client
            .query(query)
            .bind(("limit", limit))
            .bind(("offset", offset))
            .await?;
        Ok(response.take(0)?)
    }

    /// Atomic partial update; rejects an empty patch (§4.2).
    pub async fn update_status(
        db: &SurrealDbClient,
        id: &str,
        patch: DocumentStatusPatch,
    ) -> Result<Self, AppError> {
        if patch.is_empty() {
            return Err(AppError::Validation(
                "update_document_status requires at least one field".to_string(),
            ));
        }

        let mut existing = Self::get(db, id)
            .await?
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;

        if let Some(status) = patch.status {
            existing.status = status;
        }
        if patch.processed_at.is_some() {
            existing.processed_at = patch.processed_at;
        }
        if patch.number_of_chunks.is_some() {
            existing.number_of_chunks = patch.number_of_chunks;
        }
        if patch.error_message.is_some() {
            existing.error_message = patch.error_message;
        }
        existing.updated_at = chrono::Utc::now();

        let updated: Option<Self> = db
            .client
            .update(("document", id))
            .content(existing)
            .await?;
        updated.ok_or_else(|| AppError::NotFound(id.to_string()))
    }

    /// Delete this document and cascade to its chunks/vectors. Chunk and
    /// vector deletion is the caller's responsibility (see `ChunkRecord`),
    /// since SurrealDB offers no cross-table foreign-key cascade (§6).
    pub async fn delete(db: &SurrealDbClient, id: &str) -> Result<Option<Self>, AppError> {
        Ok(db.delete_item::<Self>(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        db.ensure_initialized(384).await.expect("schema init");
        db
    }

    #[tokio::test]
    async fn create_rejects_duplicate_file_path() {
        let db = memory_db().await;
        DocumentRecord::create(
            &db,
            "a.txt".into(),
            "text/plain".into(),
            10,
            "docs/a.txt".into(),
            StorageType::Local,
        )
        .await
        .expect("first create succeeds");

        let err = DocumentRecord::create(
            &db,
            "a.txt".into(),
            "text/plain".into(),
            10,
            "docs/a.txt".into(),
            StorageType::Local,
        )
        .await
        .expect_err("duplicate file_path rejected");
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_status_rejects_empty_patch() {
        let db = memory_db().await;
        let doc = DocumentRecord::create(
            &db,
            "a.txt".into(),
            "text/plain".into(),
            10,
            "docs/a.txt".into(),
            StorageType::Local,
        )
        .await
        .expect("create");

        let err = DocumentRecord::update_status(&db, &doc.id, DocumentStatusPatch::default())
            .await
            .expect_err("empty patch rejected");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn update_status_marks_ready() {
        let db = memory_db().await;
        let doc = DocumentRecord::create(
            &db,
            "a.txt".into(),
            "text/plain".into(),
            10,
            "docs/a.txt".into(),
            StorageType::Local,
        )
        .await
        .expect("create");

        let now = chrono::Utc::now();
        let updated = DocumentRecord::update_status(
            &db,
            &doc.id,
            DocumentStatusPatch {
                status: Some(DocumentStatus::Ready),
                processed_at: Some(now),
                number_of_chunks: Some(3),
                error_message: None,
            },
        )
        .await
        .expect("update");

        assert_eq!(updated.status, DocumentStatus::Ready);
        assert_eq!(updated.number_of_chunks, Some(3));
    }
}
