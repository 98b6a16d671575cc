use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use serde::Deserialize;

/// One hit from a `VectorIndex.query` call: the chunk id, its cosine score,
/// and the metadata columns carried alongside the embedding (§3 VectorEntry).
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
    pub source_document_id: String,
    pub sequence_in_document: u32,
}

/// Adapter over the HNSW index defined on the `chunk` table's `embedding`
/// field (§4.3). `ChunkStore` and `VectorIndex` are two logical interfaces
/// over the same physical rows; this module is the only place that issues
/// ANN queries, so no other code reaches across the boundary.
pub struct VectorIndex;

impl VectorIndex {
    /// Attach vectors to already-persisted chunks. `ids`, `vectors`, and
    /// `metadatas` MUST be the same length; the whole call fails together on
    /// any row's dimension mismatch or missing chunk id (§4.3).
    pub async fn upsert(
        db: &SurrealDbClient,
        ids: &[String],
        vectors: &[Vec<f32>],
        expected_dimension: usize,
    ) -> Result<(), AppError> {
        if ids.len() != vectors.len() {
            return Err(AppError::SchemaMismatch(
                "ids and vectors length mismatch".to_string(),
            ));
        }
        for vector in vectors {
            if vector.len() != expected_dimension {
                return Err(AppError::SchemaMismatch(format!(
                    "expected embedding dimension {expected_dimension}, got {}",
                    vector.len()
                )));
            }
        }

        let mut tx = db.client.query("BEGIN TRANSACTION");
        for (id, vector) in ids.iter().zip(vectors.iter()) {
            tx = tx
                .query(
                    "UPDATE type::thing('chunk', $id) SET embedding = $embedding, updated_at = time::now()",
                )
                .bind(("id", id.clone()))
                .bind(("embedding", vector.clone()));
        }
        let response = tx.query("COMMIT TRANSACTION").await;

        match response {
            Ok(mut r) => {
                r.check()?;
                Ok(())
            }
            Err(e) => Err(AppError::Database(e)),
        }
    }

    /// Dense recall: cosine-nearest `k` chunks to `vector` (§4.3, §4.8 step 2).
    pub async fn query(
        db: &SurrealDbClient,
        vector: Vec<f32>,
        k: usize,
    ) -> Result<Vec<VectorHit>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
            source_document_id: String,
            sequence_in_document: u32,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT
                id,
                source_document_id,
                sequence_in_document,
                vector::similarity::cosine(embedding, $vector) AS score
            FROM chunk
            WHERE embedding <|{k},100|> $vector
            ORDER BY score DESC
            LIMIT {k};
            "#
        );

        let mut response = db.client.query(sql).bind(("vector", vector)).await?;
        let rows: Vec<Row> = response.take(0)?;

        Ok(rows
            .into_iter()
            .map(|r| VectorHit {
                chunk_id: r.id.id.to_raw(),
                score: r.score,
                source_document_id: r.source_document_id,
                sequence_in_document: r.sequence_in_document,
            })
            .collect())
    }

    /// Remove every vector whose metadata names `document_id` (§4.3, §4.7
    /// step 3 purge-on-reentry). Implemented by clearing the `embedding`
    /// field rather than deleting rows, since the chunk rows themselves are
    /// owned by `ChunkStore` and are deleted there.
    pub async fn delete_by_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<(), AppError> {
        db.client
            .query("UPDATE chunk SET embedding = NONE WHERE source_document_id = $document_id")
            .bind(("document_id", document_id.to_string()))
            .await?;
        Ok(())
    }
}
