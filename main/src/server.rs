//! HTTP process entrypoint (§5): the API surface and the `TaskRunner` run as
//! separate processes sharing only the relational store, the vector index,
//! and the blob store — this binary never drives `IngestPipeline` itself,
//! it only enqueues `IngestJob`s for `worker` to claim.

use api_router::{api_routes_v1, api_state::ApiState};
use common::{storage::store::StorageManager, utils::config::get_config};
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
    let storage = StorageManager::new(&config).await?;
    let api_state = ApiState::new(&config, storage).await?;

    let app = api_routes_v1(&api_state).with_state(api_state);

    let listener = tokio::net::TcpListener::bind(&config.http_bind_address).await?;
    info!(address = %config.http_bind_address, "api server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
