use std::sync::Arc;

use common::{
    error::AppError,
    models::{
        embedder::{Embedder, FastEmbedHost, HashedEmbedder},
        generator::{GenerationParams, Generator, OpenAiGenerator},
    },
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::{AppConfig, EmbeddingBackend},
};
use retrieval_pipeline::{
    pipeline::{DefaultRetrievalServices, RetrievalConfig, RetrievalServices},
    reranking::{Reranker, RerankerPool},
};

/// Shared handle for every HTTP route (§6, C10): the stores the `documents`
/// routes write through directly, plus the already-wired `RetrievalPipeline`
/// (C8) collaborators the `query` routes drive.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub storage: StorageManager,
    pub config: AppConfig,
    pub retrieval: Arc<dyn RetrievalServices>,
}

impl ApiState {
    pub async fn new(config: &AppConfig, storage: StorageManager) -> Result<Self, AppError> {
        let db = Arc::new(
            SurrealDbClient::new(
                &config.store_url,
                &config.store_username,
                &config.store_password,
                &config.store_namespace,
                &config.store_database,
            )
            .await?,
        );
        db.ensure_initialized(config.embedding_dimension).await?;

        let embedder: Arc<dyn Embedder> = match config.embedding_backend {
            EmbeddingBackend::Fastembed => FastEmbedHost::new(config, 1)?,
            EmbeddingBackend::Hashed => Arc::new(HashedEmbedder::new(
                config.embedding_dimension,
                config.embedding_instruction.clone(),
            )),
        };
        let reranker: Arc<dyn Reranker> = RerankerPool::from_config(config)?;
        let generator: Arc<dyn Generator> = Arc::new(OpenAiGenerator::new(config));
        let generation_params = GenerationParams::from_config(config);
        let retrieval_config = RetrievalConfig::from_app_config(config);

        let retrieval: Arc<dyn RetrievalServices> = Arc::new(DefaultRetrievalServices::new(
            db.clone(),
            embedder,
            reranker,
            generator,
            generation_params,
            retrieval_config,
        ));

        Ok(Self {
            db,
            storage,
            config: config.clone(),
            retrieval,
        })
    }
}
