//! Injectable collaborators for `IngestPipeline` (§1 ambient stack, §4.7):
//! ModelHosts and the blob store sit behind a trait so tests can substitute
//! a hashed embedder / in-memory store / failing double without touching
//! pipeline logic, following the teacher's `PipelineServices` pattern.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    models::embedder::{EmbedMode, Embedder},
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::AppConfig,
};

/// Chunking/embedding tuning the pipeline needs (§6 `chunk.*`, embed batching).
#[derive(Debug, Clone)]
pub struct IngestPipelineConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embed_batch_size: usize,
    pub embedding_dimension: usize,
}

impl IngestPipelineConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            embed_batch_size: 32,
            embedding_dimension: config.embedding_dimension,
        }
    }
}

#[async_trait]
pub trait IngestServices: Send + Sync {
    fn db(&self) -> &SurrealDbClient;
    fn storage(&self) -> &StorageManager;
    fn config(&self) -> &IngestPipelineConfig;
    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError>;
}

pub struct DefaultIngestServices {
    db: Arc<SurrealDbClient>,
    storage: Arc<StorageManager>,
    embedder: Arc<dyn Embedder>,
    config: IngestPipelineConfig,
}

impl DefaultIngestServices {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: Arc<StorageManager>,
        embedder: Arc<dyn Embedder>,
        config: IngestPipelineConfig,
    ) -> Self {
        Self {
            db,
            storage,
            embedder,
            config,
        }
    }
}

#[async_trait]
impl IngestServices for DefaultIngestServices {
    fn db(&self) -> &SurrealDbClient {
        &self.db
    }

    fn storage(&self) -> &StorageManager {
        &self.storage
    }

    fn config(&self) -> &IngestPipelineConfig {
        &self.config
    }

    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        self.embedder.embed(texts, EmbedMode::Document).await
    }
}
