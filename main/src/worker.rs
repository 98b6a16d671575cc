//! `TaskRunner` process entrypoint (C9, §4.9): claims `IngestJob`s from the
//! shared store and drives `IngestPipeline` for each, independently of the
//! HTTP process (§5).

use std::sync::Arc;

use common::{
    models::embedder::{Embedder, FastEmbedHost, HashedEmbedder},
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::{get_config, EmbeddingBackend},
};
use ingestion_pipeline::{run_worker_loop, DefaultIngestServices, IngestPipelineConfig, IngestServices};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

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

    let storage = Arc::new(StorageManager::new(&config).await?);

    let embedder: Arc<dyn Embedder> = match config.embedding_backend {
        EmbeddingBackend::Fastembed => FastEmbedHost::new(&config, 1)?,
        EmbeddingBackend::Hashed => Arc::new(HashedEmbedder::new(
            config.embedding_dimension,
            config.embedding_instruction.clone(),
        )),
    };

    let services: Arc<dyn IngestServices> = Arc::new(DefaultIngestServices::new(
        db,
        storage,
        embedder,
        IngestPipelineConfig::from_app_config(&config),
    ));

    let runner_config = ingestion_pipeline::RunnerConfig::from_app_config(&config);
    let worker_id = format!("worker-{}", std::process::id());
    let shutdown = CancellationToken::new();

    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_for_signal.cancel();
    });

    run_worker_loop(services, runner_config, worker_id, shutdown).await;
    Ok(())
}
