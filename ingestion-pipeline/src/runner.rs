//! C9: TaskRunner (§4.9). Polls the lease-based queue (§4.9a), claims ready
//! `IngestJob` rows, and drives `IngestPipeline` (C7) for each — one tokio
//! task per job, so a panic or error in one job never affects another, the
//! way the teacher isolates each claimed `IngestionTask` in its own task.

use std::sync::Arc;
use std::time::Duration;

use common::{
    storage::types::ingest_job::{IngestJob, DEFAULT_LEASE_SECS},
    utils::config::AppConfig,
};
use tokio::{sync::Semaphore, task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    pipeline::{run_once, IngestOutcome},
    services::IngestServices,
};

const BASE_RETRY_SECS: i64 = 5;
const MAX_RETRY_SECS: i64 = 300;

/// Queue polling/concurrency tuning (§6 `queue.*`).
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub lease_seconds: i64,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub worker_concurrency: usize,
}

impl RunnerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            lease_seconds: i64::try_from(config.queue_lease_seconds).unwrap_or(DEFAULT_LEASE_SECS),
            max_attempts: config.queue_max_attempts,
            poll_interval: Duration::from_millis(config.queue_poll_interval_ms),
            worker_concurrency: config.queue_worker_concurrency,
        }
    }
}

/// Exponential backoff for `mark_failed`'s `retry_delay`, capped so a flaky
/// step doesn't push `available_at` arbitrarily far out.
fn backoff_secs(attempts_before_failure: u32) -> i64 {
    let exponent = attempts_before_failure.min(6);
    (BASE_RETRY_SECS * 2i64.pow(exponent)).min(MAX_RETRY_SECS)
}

/// Poll-claim-drive loop for one worker process (§4.9, §5 "parallel workers
/// with cooperative I/O inside each"). Runs until `shutdown` is cancelled,
/// then drains in-flight jobs before returning.
pub async fn run_worker_loop(
    services: Arc<dyn IngestServices>,
    config: RunnerConfig,
    worker_id: String,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    info!(worker_id = %worker_id, concurrency = config.worker_concurrency, "ingest worker loop starting");

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match IngestJob::claim_next_ready(services.db(), &worker_id, config.lease_seconds).await {
            Ok(Some(job)) => {
                debug!(job_id = %job.id, document_id = %job.document_id, "claimed ingest job");
                let services = services.clone();
                let max_attempts = config.max_attempts;
                // Each job gets its own token rather than `shutdown`'s: a
                // graceful shutdown drains in-flight jobs to completion (see
                // the loop's trailing drain below), it does not cancel them.
                let job_cancellation = CancellationToken::new();
                in_flight.spawn(async move {
                    let _permit = permit;
                    run_claimed_job(services.as_ref(), max_attempts, job, &job_cancellation).await;
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
            Err(err) => {
                drop(permit);
                warn!(error = %err, "failed to poll ingest job queue");
                sleep(config.poll_interval).await;
            }
        }

        while let Some(result) = in_flight.try_join_next() {
            if let Err(join_err) = result {
                warn!(error = %join_err, "ingest job task ended abnormally");
            }
        }
    }

    info!(worker_id = %worker_id, "ingest worker loop shutting down, draining in-flight jobs");
    while let Some(result) = in_flight.join_next().await {
        if let Err(join_err) = result {
            warn!(error = %join_err, "ingest job task ended abnormally during shutdown drain");
        }
    }
}

/// Run one job to completion and update the queue row accordingly. A panic
/// inside `run_once` surfaces as a `JoinError` to the caller's `JoinSet`,
/// not here; the job is simply left `processing` and reclaimed once its
/// lease expires (§4.9a crashed-worker recovery).
async fn run_claimed_job(
    services: &dyn IngestServices,
    max_attempts: u32,
    job: IngestJob,
    cancellation: &CancellationToken,
) {
    match run_once(services, &job.document_id, cancellation).await {
        Ok(IngestOutcome::Completed) => {
            if let Err(err) = IngestJob::mark_succeeded(services.db(), &job.id).await {
                warn!(job_id = %job.id, error = %err, "failed to mark ingest job succeeded");
            }
        }
        Ok(IngestOutcome::DocumentMissing)
        | Ok(IngestOutcome::AlreadyReady)
        | Ok(IngestOutcome::AlreadyProcessing) => {
            // Nothing to retry: the document was deleted, already finished,
            // or is being driven by a concurrent claim. Either way this job
            // row has no further work to do.
            if let Err(err) = IngestJob::mark_succeeded(services.db(), &job.id).await {
                warn!(job_id = %job.id, error = %err, "failed to mark no-op ingest job succeeded");
            }
        }
        Err(err) => {
            let retry_delay = backoff_secs(job.attempts);
            let message = err.truncated_message("run_once", 500);
            if let Err(mark_err) = IngestJob::mark_failed(
                services.db(),
                &job.id,
                &message,
                retry_delay,
                max_attempts,
            )
            .await
            {
                warn!(job_id = %job.id, error = %mark_err, "failed to mark ingest job failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{
        error::AppError,
        models::embedder::{EmbedMode, Embedder},
        storage::{
            db::SurrealDbClient,
            store::testing::TestStorageManager,
            types::document_record::{DocumentRecord, DocumentStatus, StorageType},
        },
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    struct FixedEmbedder {
        dimension: usize,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, texts: Vec<String>, _mode: EmbedMode) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![0.1_f32; self.dimension]).collect())
        }
        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    struct TestServices {
        db: SurrealDbClient,
        storage: TestStorageManager,
        embedder: FixedEmbedder,
        config: crate::services::IngestPipelineConfig,
    }

    #[async_trait]
    impl IngestServices for TestServices {
        fn db(&self) -> &SurrealDbClient {
            &self.db
        }
        fn storage(&self) -> &common::storage::store::StorageManager {
            self.storage.storage()
        }
        fn config(&self) -> &crate::services::IngestPipelineConfig {
            &self.config
        }
        async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
            self.embedder.embed(texts, EmbedMode::Document).await
        }
    }

    async fn memory_db(dimension: usize) -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        db.ensure_initialized(dimension).await.expect("schema init");
        db
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        assert_eq!(backoff_secs(0), 5);
        assert_eq!(backoff_secs(1), 10);
        assert_eq!(backoff_secs(10), MAX_RETRY_SECS);
    }

    #[tokio::test]
    async fn worker_loop_processes_a_queued_job_then_shuts_down() {
        let dimension = 4;
        let db = memory_db(dimension).await;
        let storage = TestStorageManager::new_memory().await.expect("storage");
        storage
            .put("docs/hello.txt", b"hello world, this is a small document")
            .await
            .expect("seed bytes");

        let document = DocumentRecord::create(
            &db,
            "hello.txt".to_string(),
            "text/plain".to_string(),
            37,
            "docs/hello.txt".to_string(),
            StorageType::Local,
        )
        .await
        .expect("create document");
        IngestJob::enqueue(&db, document.id.clone())
            .await
            .expect("enqueue job");

        let services: Arc<dyn IngestServices> = Arc::new(TestServices {
            db: db.clone(),
            storage,
            embedder: FixedEmbedder { dimension },
            config: crate::services::IngestPipelineConfig {
                chunk_size: 64,
                chunk_overlap: 0,
                embed_batch_size: 8,
                embedding_dimension: dimension,
            },
        });

        let shutdown = CancellationToken::new();
        let loop_shutdown = shutdown.clone();
        let runner_config = RunnerConfig {
            lease_seconds: 60,
            max_attempts: 3,
            poll_interval: StdDuration::from_millis(20),
            worker_concurrency: 2,
        };

        let handle = tokio::spawn(run_worker_loop(
            services,
            runner_config,
            "worker-test".to_string(),
            loop_shutdown,
        ));

        // Give the loop a few poll cycles to claim and finish the job.
        let processed_count = AtomicUsize::new(0);
        for _ in 0..50 {
            sleep(StdDuration::from_millis(20)).await;
            let doc = DocumentRecord::get(&db, &document.id)
                .await
                .expect("fetch")
                .expect("exists");
            if doc.status == DocumentStatus::Ready {
                processed_count.store(1, Ordering::SeqCst);
                break;
            }
        }
        shutdown.cancel();
        handle.await.expect("worker loop task");

        assert_eq!(processed_count.load(Ordering::SeqCst), 1, "document never reached ready");
    }
}
