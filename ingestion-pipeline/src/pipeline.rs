//! C7: drives one document from `uploaded`/`error` to `ready` or `error`
//! (§4.7). The step sequence is expressed as a compile-time-checked typed
//! state machine (the teacher's `state_machines::state_machine!` macro) so
//! calling, say, the embed step before chunks are persisted is a type error.

use std::time::Instant;

use common::{
    error::AppError,
    storage::{
        types::{
            chunk_record::{ChunkRecord, NewChunk},
            document_record::{DocumentRecord, DocumentStatus, DocumentStatusPatch, StorageType},
        },
        vector_index::VectorIndex,
    },
};
use state_machines::state_machine;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{chunker, parser, services::IngestServices};

state_machine! {
    name: IngestMachine,
    state: IngestState,
    initial: Claimed,
    states: [Claimed, BytesFetched, Parsed, Chunked, ChunksPersisted, Embedded, VectorsUpserted, Finalized, Failed],
    events {
        fetch { transition: { from: Claimed, to: BytesFetched } }
        parse { transition: { from: BytesFetched, to: Parsed } }
        chunk { transition: { from: Parsed, to: Chunked } }
        persist_chunks { transition: { from: Chunked, to: ChunksPersisted } }
        embed { transition: { from: ChunksPersisted, to: Embedded } }
        upsert_vectors { transition: { from: Embedded, to: VectorsUpserted } }
        finalize { transition: { from: VectorsUpserted, to: Finalized } }
        abort {
            transition: { from: Claimed, to: Failed }
            transition: { from: BytesFetched, to: Failed }
            transition: { from: Parsed, to: Failed }
            transition: { from: Chunked, to: Failed }
            transition: { from: ChunksPersisted, to: Failed }
            transition: { from: Embedded, to: Failed }
            transition: { from: VectorsUpserted, to: Failed }
        }
    }
}

fn claimed() -> IngestMachine<(), Claimed> {
    IngestMachine::new(())
}

/// What happened to a claimed document; only `Completed` ran the full
/// pipeline, the others are no-ops the caller does not need to retry.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed,
    DocumentMissing,
    AlreadyReady,
    AlreadyProcessing,
}

const RETRY_ATTEMPTS: usize = 3;
const RETRY_BASE_MILLIS: u64 = 100;

fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_MILLIS)
        .map(jitter)
        .take(RETRY_ATTEMPTS)
}

/// Run the full ingest pipeline for one document (§4.7 steps 1-10).
///
/// `cancellation` is checked at every step boundary (§5): once signalled the
/// pipeline stops before starting the next step rather than mid-step, and the
/// document is left in `error` with `error_message = "cancelled"` so it can
/// be requeued later.
#[instrument(skip(services, cancellation), fields(document_id = %document_id))]
pub async fn run_once(
    services: &dyn IngestServices,
    document_id: &str,
    cancellation: &CancellationToken,
) -> Result<IngestOutcome, AppError> {
    let db = services.db();

    // Step 1: load.
    let Some(document) = DocumentRecord::get(db, document_id).await? else {
        return Ok(IngestOutcome::DocumentMissing);
    };

    // Step 2: mark processing (claim-or-refuse).
    match document.status {
        DocumentStatus::Ready => return Ok(IngestOutcome::AlreadyReady),
        DocumentStatus::Processing => return Ok(IngestOutcome::AlreadyProcessing),
        DocumentStatus::Uploaded | DocumentStatus::Error => {}
    }
    let was_reentering = document.status == DocumentStatus::Error;

    DocumentRecord::update_status(
        db,
        document_id,
        DocumentStatusPatch {
            status: Some(DocumentStatus::Processing),
            ..Default::default()
        },
    )
    .await?;

    let machine = claimed();

    // Step 3: purge prior chunks/vectors on re-entry from `error`.
    if was_reentering {
        ChunkRecord::delete_by_document(db, document_id).await?;
        VectorIndex::delete_by_document(db, document_id).await?;
    }

    match drive(services, &document, machine, cancellation).await {
        Ok(chunk_count) => {
            DocumentRecord::update_status(
                db,
                document_id,
                DocumentStatusPatch {
                    status: Some(DocumentStatus::Ready),
                    processed_at: Some(chrono::Utc::now()),
                    number_of_chunks: Some(chunk_count),
                    error_message: None,
                },
            )
            .await?;
            Ok(IngestOutcome::Completed)
        }
        Err((step, AppError::Cancelled)) => {
            warn!(document_id = %document_id, step, "ingest pipeline cancelled");
            DocumentRecord::update_status(
                db,
                document_id,
                DocumentStatusPatch {
                    status: Some(DocumentStatus::Error),
                    error_message: Some("cancelled".to_string()),
                    ..Default::default()
                },
            )
            .await?;
            Err(AppError::Cancelled)
        }
        Err((step, err)) => {
            let message = err.truncated_message(step, 500);
            warn!(document_id = %document_id, step, error = %err, "ingest pipeline step failed");
            DocumentRecord::update_status(
                db,
                document_id,
                DocumentStatusPatch {
                    status: Some(DocumentStatus::Error),
                    error_message: Some(message),
                    ..Default::default()
                },
            )
            .await?;
            Err(err)
        }
    }
}

/// Bail out with `AppError::Cancelled` if `cancellation` has fired; checked
/// at every step boundary so the pipeline never starts a new step once
/// cancelled (§5), though a step already in flight is allowed to finish.
fn check_cancelled(cancellation: &CancellationToken, step: &'static str) -> Result<(), (&'static str, AppError)> {
    if cancellation.is_cancelled() {
        Err((step, AppError::Cancelled))
    } else {
        Ok(())
    }
}

async fn drive(
    services: &dyn IngestServices,
    document: &DocumentRecord,
    machine: IngestMachine<(), Claimed>,
    cancellation: &CancellationToken,
) -> Result<u32, (&'static str, AppError)> {
    let started = Instant::now();
    let config = services.config();

    // Step 4: fetch bytes (retryable).
    check_cancelled(cancellation, "fetch")?;
    let location = document.file_path.clone();
    let bytes = Retry::spawn(retry_strategy(), || async {
        services.storage().fetch(&location).await
    })
    .await
    .map_err(|e| ("fetch", e))?;
    let machine = machine.fetch().map_err(|(_, g)| ("fetch", guard_err(g)))?;

    // Step 5: parse.
    check_cancelled(cancellation, "parse")?;
    let text = parser::parse(&bytes, &document.content_type, &document.original_filename)
        .map_err(|e| ("parse", e))?;
    if text.trim().is_empty() {
        return Err(("parse", AppError::EmptyContent));
    }
    let machine = machine.parse().map_err(|(_, g)| ("parse", guard_err(g)))?;

    // Step 6: chunk.
    check_cancelled(cancellation, "chunk")?;
    let chunk_texts = chunker::chunk_text(
        &text,
        chunker::ChunkerConfig {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        },
    )
    .map_err(|e| ("chunk", e))?;
    if chunk_texts.is_empty() {
        return Err(("chunk", AppError::EmptyContent));
    }
    let machine = machine.chunk().map_err(|(_, g)| ("chunk", guard_err(g)))?;

    // Step 7: persist chunks.
    check_cancelled(cancellation, "persist_chunks")?;
    let new_chunks: Vec<NewChunk> = chunk_texts
        .iter()
        .enumerate()
        .map(|(i, text)| NewChunk {
            source_document_id: document.id.clone(),
            chunk_text: text.clone(),
            sequence_in_document: u32::try_from(i).unwrap_or(u32::MAX),
        })
        .collect();
    let persisted = ChunkRecord::bulk_create(services.db(), new_chunks)
        .await
        .map_err(|e| ("persist_chunks", e))?;
    let machine = machine
        .persist_chunks()
        .map_err(|(_, g)| ("persist_chunks", guard_err(g)))?;

    // Step 8: embed chunks in batches (retryable).
    check_cancelled(cancellation, "embed")?;
    let mut embeddings = Vec::with_capacity(persisted.len());
    for batch in persisted.chunks(config.embed_batch_size.max(1)) {
        check_cancelled(cancellation, "embed")?;
        let texts: Vec<String> = batch.iter().map(|c| c.chunk_text.clone()).collect();
        let batch_embeddings = Retry::spawn(retry_strategy(), || {
            let texts = texts.clone();
            async move { services.embed_documents(texts).await }
        })
        .await
        .map_err(|e| ("embed", e))?;
        embeddings.extend(batch_embeddings);
    }
    let machine = machine.embed().map_err(|(_, g)| ("embed", guard_err(g)))?;

    // Step 9: upsert vectors (retryable).
    check_cancelled(cancellation, "upsert_vectors")?;
    let ids: Vec<String> = persisted.iter().map(|c| c.id.clone()).collect();
    let dimension = config.embedding_dimension;
    Retry::spawn(retry_strategy(), || {
        let ids = ids.clone();
        let embeddings = embeddings.clone();
        async move { VectorIndex::upsert(services.db(), &ids, &embeddings, dimension).await }
    })
    .await
    .map_err(|e| ("upsert_vectors", e))?;
    let machine = machine
        .upsert_vectors()
        .map_err(|(_, g)| ("upsert_vectors", guard_err(g)))?;

    // Step 10: finalize.
    let _machine = machine
        .finalize()
        .map_err(|(_, g)| ("finalize", guard_err(g)))?;

    info!(
        document_id = %document.id,
        chunks = persisted.len(),
        total_ms = started.elapsed().as_millis(),
        "ingest pipeline finished"
    );

    Ok(u32::try_from(persisted.len()).unwrap_or(u32::MAX))
}

fn guard_err<E: std::fmt::Display>(guard: E) -> AppError {
    AppError::Internal(format!("illegal pipeline transition: {guard}"))
}

/// Download eligibility mirrors `StorageType`; object-store-backed documents
/// cannot be served as a direct local download (§6).
pub fn is_local(document: &DocumentRecord) -> bool {
    matches!(document.storage_type, StorageType::Local)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use common::storage::{db::SurrealDbClient, store::testing::TestStorageManager};

    use super::*;
    use crate::services::{IngestPipelineConfig, IngestServices};

    struct TestServices {
        db: SurrealDbClient,
        storage: common::storage::store::StorageManager,
        config: IngestPipelineConfig,
        embed_fails: bool,
    }

    #[async_trait]
    impl IngestServices for TestServices {
        fn db(&self) -> &SurrealDbClient {
            &self.db
        }
        fn storage(&self) -> &common::storage::store::StorageManager {
            &self.storage
        }
        fn config(&self) -> &IngestPipelineConfig {
            &self.config
        }
        async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
            if self.embed_fails {
                return Err(AppError::ModelError("embedding backend unavailable".into()));
            }
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3, 0.4]).collect())
        }
    }

    async fn setup() -> (TestServices, DocumentRecord) {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        db.ensure_initialized(4).await.expect("schema init");

        let test_storage = TestStorageManager::new_memory().await.expect("storage");
        test_storage
            .put("docs/a.txt", b"hello world. this is a test document.")
            .await
            .expect("seed blob");

        let document = DocumentRecord::create(
            &db,
            "a.txt".into(),
            "text/plain".into(),
            38,
            "docs/a.txt".into(),
            StorageType::Local,
        )
        .await
        .expect("create document");

        let services = TestServices {
            storage: test_storage.clone_storage(),
            db,
            config: IngestPipelineConfig {
                chunk_size: 16,
                chunk_overlap: 4,
                embed_batch_size: 8,
                embedding_dimension: 4,
            },
            embed_fails: false,
        };

        (services, document)
    }

    #[tokio::test]
    async fn missing_document_is_a_no_op() {
        let (services, _doc) = setup().await;
        let outcome = run_once(&services, "does-not-exist", &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(outcome, IngestOutcome::DocumentMissing);
    }

    #[tokio::test]
    async fn full_pipeline_marks_document_ready() {
        let (services, document) = setup().await;
        let outcome = run_once(&services, &document.id, &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(outcome, IngestOutcome::Completed);

        let updated = DocumentRecord::get(&services.db, &document.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(updated.status, DocumentStatus::Ready);
        assert!(updated.number_of_chunks.unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn already_ready_document_is_a_no_op() {
        let (services, document) = setup().await;
        run_once(&services, &document.id, &CancellationToken::new())
            .await
            .expect("first run");
        let outcome = run_once(&services, &document.id, &CancellationToken::new())
            .await
            .expect("second run");
        assert_eq!(outcome, IngestOutcome::AlreadyReady);
    }

    #[tokio::test]
    async fn embedding_failure_moves_document_to_error() {
        let (mut services, document) = setup().await;
        services.embed_fails = true;
        let err = run_once(&services, &document.id, &CancellationToken::new())
            .await
            .expect_err("fails");
        assert!(err.is_retryable());

        let updated = DocumentRecord::get(&services.db, &document.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(updated.status, DocumentStatus::Error);
        assert!(updated.error_message.is_some());
    }

    #[tokio::test]
    async fn cancellation_marks_document_error_with_cancelled_message() {
        let (services, document) = setup().await;
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let err = run_once(&services, &document.id, &cancellation)
            .await
            .expect_err("cancelled before first step boundary");
        assert!(matches!(err, AppError::Cancelled));

        let updated = DocumentRecord::get(&services.db, &document.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(updated.status, DocumentStatus::Error);
        assert_eq!(updated.error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn reentry_from_error_purges_prior_chunks() {
        let (mut services, document) = setup().await;
        services.embed_fails = true;
        run_once(&services, &document.id, &CancellationToken::new())
            .await
            .expect_err("first attempt fails");

        let stale_chunks = ChunkRecord::count_for_document(&services.db, &document.id)
            .await
            .expect("count");
        assert!(stale_chunks > 0, "chunks persisted before the failing embed step");

        services.embed_fails = false;
        let outcome = run_once(&services, &document.id, &CancellationToken::new())
            .await
            .expect("retry succeeds");
        assert_eq!(outcome, IngestOutcome::Completed);

        let final_count = ChunkRecord::count_for_document(&services.db, &document.id)
            .await
            .expect("count");
        assert!(final_count > 0);
    }
}
