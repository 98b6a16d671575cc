//! C8: query → answer pipeline (§4.8). Steps run strictly sequentially
//! against a shared `RetrievalServices` handle: embed → recall → hydrate →
//! rerank → ground → generate. Chunk-only; no knowledge-graph expansion,
//! no full-text fusion, no multi-turn history (§9 Open Questions).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    models::{
        embedder::{EmbedMode, Embedder},
        generator::{GeneratedAnswer, GenerationParams, Generator},
    },
    storage::{db::SurrealDbClient, types::chunk_record::ChunkRecord, vector_index::VectorIndex},
    utils::config::AppConfig,
};
use tracing::{instrument, warn};

use crate::reranking::{RerankedHit, Reranker};

/// `K_recall` / `K_final` plus the fixed instruction and empty-corpus
/// answer (§4.8, §6 `retrieval.*`).
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub k_recall: usize,
    pub k_final: usize,
    pub empty_answer: String,
    pub instruction: String,
}

impl RetrievalConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            k_recall: config.retrieval_k_recall,
            k_final: config.retrieval_k_final,
            empty_answer: config.retrieval_empty_answer.clone(),
            instruction: default_instruction(),
        }
    }
}

fn default_instruction() -> String {
    "Answer the question using only the context passages below. \
     If the passages do not contain the answer, say so plainly."
        .to_string()
}

/// One chunk that grounded (or would ground) an answer, in the order it
/// was used — highest rerank score first, ties broken by recall rank.
#[derive(Debug, Clone)]
pub struct SupportingChunk {
    pub chunk: ChunkRecord,
    pub score: f32,
}

/// `/query/ask` result (§6).
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub answer: String,
    pub supporting_chunks: Vec<SupportingChunk>,
}

/// Injectable collaborators for `RetrievalPipeline` (§1 ambient stack),
/// mirroring `IngestServices`: tests substitute a hashed embedder, a
/// scripted reranker, and a spy generator without touching pipeline logic.
#[async_trait]
pub trait RetrievalServices: Send + Sync {
    fn db(&self) -> &SurrealDbClient;
    fn config(&self) -> &RetrievalConfig;
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError>;
    async fn rerank(
        &self,
        query: &str,
        passages: Vec<String>,
    ) -> Result<Vec<RerankedHit>, AppError>;
    async fn generate(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<GeneratedAnswer, AppError>;
}

/// Production wiring: the shared embedder/reranker/generator hosts behind
/// one struct (§9 "global model singletons" — explicitly constructed and
/// injected, not a process-wide memo table).
pub struct DefaultRetrievalServices {
    db: Arc<SurrealDbClient>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    generator: Arc<dyn Generator>,
    generation_params: GenerationParams,
    config: RetrievalConfig,
}

impl DefaultRetrievalServices {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        generator: Arc<dyn Generator>,
        generation_params: GenerationParams,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            db,
            embedder,
            reranker,
            generator,
            generation_params,
            config,
        }
    }
}

#[async_trait]
impl RetrievalServices for DefaultRetrievalServices {
    fn db(&self) -> &SurrealDbClient {
        &self.db
    }

    fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self
            .embedder
            .embed(vec![text.to_string()], EmbedMode::Query)
            .await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::ModelError("embedder returned no vector".to_string()))
    }

    async fn rerank(
        &self,
        query: &str,
        passages: Vec<String>,
    ) -> Result<Vec<RerankedHit>, AppError> {
        self.reranker.rerank(query, passages).await
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<GeneratedAnswer, AppError> {
        self.generator
            .generate(system_prompt, user_message, &self.generation_params)
            .await
    }
}

/// Steps 1-4, shared by `/query/ask` and `/query/retrieve-chunks`: embed,
/// recall, hydrate (skipping stale vector ids), rerank, keep top `k_final`.
async fn recall_and_rerank(
    services: &dyn RetrievalServices,
    query_text: &str,
    k_final: usize,
) -> Result<Vec<SupportingChunk>, AppError> {
    let config = services.config();

    // Step 1: embed query (instruction-prefixed by the embedder itself).
    let query_vector = services.embed_query(query_text).await?;

    // Step 2: recall.
    let hits = VectorIndex::query(services.db(), query_vector, config.k_recall).await?;
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    // Step 3: hydrate. An id missing from the chunk store is a stale vector
    // entry; skip it and log at warning level rather than failing the
    // query (§4.8 step 3 — the one error the propagation policy swallows).
    let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
    let chunks = ChunkRecord::get_by_ids(services.db(), &ids).await?;
    let by_id: HashMap<&str, &ChunkRecord> =
        chunks.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut hydrated = Vec::with_capacity(hits.len());
    for hit in &hits {
        match by_id.get(hit.chunk_id.as_str()) {
            Some(chunk) => hydrated.push((*chunk).clone()),
            None => warn!(
                chunk_id = %hit.chunk_id,
                "stale vector index entry has no matching chunk record, skipping"
            ),
        }
    }

    if hydrated.is_empty() {
        return Ok(Vec::new());
    }

    // Step 4: rerank the hydrated candidates; a rerank failure is a
    // user-visible quality regression, never silently downgraded to
    // unranked recall order (§4.8 degenerate inputs).
    let texts: Vec<String> = hydrated.iter().map(|c| c.chunk_text.clone()).collect();
    let ranked = services
        .rerank(query_text, texts)
        .await
        .map_err(|e| AppError::RetrievalError(e.to_string()))?;

    Ok(ranked
        .into_iter()
        .take(k_final)
        .filter_map(|hit| {
            hydrated.get(hit.index).map(|chunk| SupportingChunk {
                chunk: chunk.clone(),
                score: hit.score,
            })
        })
        .collect())
}

/// `POST /query/retrieve-chunks` (§6): steps 1-4 only, no generation.
#[instrument(skip(services), fields(query_len = query_text.len()))]
pub async fn run_retrieve_chunks(
    services: &dyn RetrievalServices,
    query_text: &str,
) -> Result<Vec<SupportingChunk>, AppError> {
    run_retrieve_chunks_with_k(services, query_text, services.config().k_final).await
}

/// Same as `run_retrieve_chunks`, but with the `/query/retrieve-chunks`
/// request's own `top_k` overriding the configured `retrieval.k_final` (§6).
#[instrument(skip(services), fields(query_len = query_text.len()))]
pub async fn run_retrieve_chunks_with_k(
    services: &dyn RetrievalServices,
    query_text: &str,
    k_final: usize,
) -> Result<Vec<SupportingChunk>, AppError> {
    if query_text.trim().is_empty() {
        return Err(AppError::InvalidQuery("query must not be empty".to_string()));
    }
    recall_and_rerank(services, query_text, k_final).await
}

/// `POST /query/ask` (§4.8 full pipeline, §6).
#[instrument(skip(services), fields(query_len = query_text.len()))]
pub async fn run_ask(
    services: &dyn RetrievalServices,
    query_text: &str,
) -> Result<QueryOutcome, AppError> {
    if query_text.trim().is_empty() {
        return Err(AppError::InvalidQuery("query must not be empty".to_string()));
    }

    let supporting = recall_and_rerank(services, query_text, services.config().k_final).await?;

    // Empty recall: fixed answer, generator never invoked (§4.8 degenerate input).
    if supporting.is_empty() {
        return Ok(QueryOutcome {
            answer: services.config().empty_answer.clone(),
            supporting_chunks: Vec::new(),
        });
    }

    // Step 5: build prompt — fixed template, three named slots: instruction,
    // context block (chunks joined by a single separator line, reranked
    // order preserved), user query.
    let config = services.config();
    let context_block = supporting
        .iter()
        .map(|s| s.chunk.chunk_text.as_str())
        .collect::<Vec<_>>()
        .join("\n---\n");
    let user_message = format!("Context:\n{context_block}\n\nQuestion: {query_text}");

    // Step 6: generate.
    let generated = services.generate(&config.instruction, &user_message).await?;

    // Step 7: return the chunks actually used, in rerank order.
    Ok(QueryOutcome {
        answer: generated.answer,
        supporting_chunks: supporting,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::generator::GeneratedReference;
    use common::storage::types::chunk_record::NewChunk;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestServices {
        db: SurrealDbClient,
        config: RetrievalConfig,
        query_vector: Vec<f32>,
        rerank_fails: bool,
        generate_calls: AtomicUsize,
    }

    #[async_trait]
    impl RetrievalServices for TestServices {
        fn db(&self) -> &SurrealDbClient {
            &self.db
        }
        fn config(&self) -> &RetrievalConfig {
            &self.config
        }
        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Ok(self.query_vector.clone())
        }
        async fn rerank(
            &self,
            _query: &str,
            passages: Vec<String>,
        ) -> Result<Vec<RerankedHit>, AppError> {
            if self.rerank_fails {
                return Err(AppError::ModelError("reranker offline".to_string()));
            }
            // Deterministic descending scores by original index, so the
            // original (recall) order is preserved — mirrors a reranker
            // that agrees with recall ordering.
            Ok(passages
                .iter()
                .enumerate()
                .map(|(i, _)| RerankedHit {
                    index: i,
                    score: 1.0 - (i as f32) * 0.1,
                })
                .collect())
        }
        async fn generate(
            &self,
            _system_prompt: &str,
            _user_message: &str,
        ) -> Result<GeneratedAnswer, AppError> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(GeneratedAnswer {
                answer: "grounded answer".to_string(),
                references: vec![GeneratedReference {
                    reference: "chunk".to_string(),
                }],
            })
        }
    }

    async fn memory_db(dimension: usize) -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        db.ensure_initialized(dimension).await.expect("schema init");
        db
    }

    fn base_config() -> RetrievalConfig {
        RetrievalConfig {
            k_recall: 50,
            k_final: 5,
            empty_answer: "no relevant information".to_string(),
            instruction: default_instruction(),
        }
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let db = memory_db(3).await;
        let services = TestServices {
            db,
            config: base_config(),
            query_vector: vec![1.0, 0.0, 0.0],
            rerank_fails: false,
            generate_calls: AtomicUsize::new(0),
        };

        let err = run_ask(&services, "   ").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn empty_recall_returns_fixed_answer_without_generating() {
        let db = memory_db(3).await;
        let services = TestServices {
            db,
            config: base_config(),
            query_vector: vec![1.0, 0.0, 0.0],
            rerank_fails: false,
            generate_calls: AtomicUsize::new(0),
        };

        let outcome = run_ask(&services, "anything").await.expect("run");
        assert_eq!(outcome.answer, services.config.empty_answer);
        assert!(outcome.supporting_chunks.is_empty());
        assert_eq!(services.generate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn happy_path_returns_chunks_in_descending_score_order() {
        let db = memory_db(3).await;
        let chunks = ChunkRecord::bulk_create(
            &db,
            vec![
                NewChunk {
                    source_document_id: "doc-1".into(),
                    chunk_text: "alpha passage".into(),
                    sequence_in_document: 0,
                },
                NewChunk {
                    source_document_id: "doc-1".into(),
                    chunk_text: "beta passage".into(),
                    sequence_in_document: 1,
                },
            ],
        )
        .await
        .expect("create chunks");
        VectorIndex::upsert(
            &db,
            &[chunks[0].id.clone(), chunks[1].id.clone()],
            &[vec![1.0, 0.0, 0.0], vec![0.9, 0.1, 0.0]],
            3,
        )
        .await
        .expect("upsert");

        let services = TestServices {
            db,
            config: base_config(),
            query_vector: vec![1.0, 0.0, 0.0],
            rerank_fails: false,
            generate_calls: AtomicUsize::new(0),
        };

        let outcome = run_ask(&services, "what is alpha?").await.expect("run");
        assert_eq!(outcome.answer, "grounded answer");
        assert_eq!(outcome.supporting_chunks.len(), 2);
        assert!(
            outcome.supporting_chunks[0].score >= outcome.supporting_chunks[1].score,
            "scores must be non-increasing"
        );
        assert_eq!(services.generate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_vector_entry_is_skipped_not_fatal() {
        let db = memory_db(3).await;
        let chunks = ChunkRecord::bulk_create(
            &db,
            vec![NewChunk {
                source_document_id: "doc-1".into(),
                chunk_text: "alpha passage".into(),
                sequence_in_document: 0,
            }],
        )
        .await
        .expect("create chunk");
        VectorIndex::upsert(&db, &[chunks[0].id.clone()], &[vec![1.0, 0.0, 0.0]], 3)
            .await
            .expect("upsert real chunk");
        // A stale vector entry pointing at a chunk id that was never created.
        VectorIndex::upsert(
            &db,
            &["does-not-exist".to_string()],
            &[vec![0.99, 0.0, 0.0]],
            3,
        )
        .await
        .expect("upsert stale entry");

        let services = TestServices {
            db,
            config: base_config(),
            query_vector: vec![1.0, 0.0, 0.0],
            rerank_fails: false,
            generate_calls: AtomicUsize::new(0),
        };

        let outcome = run_ask(&services, "what is alpha?").await.expect("run");
        assert_eq!(outcome.supporting_chunks.len(), 1);
        assert_eq!(outcome.supporting_chunks[0].chunk.id, chunks[0].id);
    }

    #[tokio::test]
    async fn rerank_failure_propagates_as_retrieval_error() {
        let db = memory_db(3).await;
        let chunks = ChunkRecord::bulk_create(
            &db,
            vec![NewChunk {
                source_document_id: "doc-1".into(),
                chunk_text: "alpha passage".into(),
                sequence_in_document: 0,
            }],
        )
        .await
        .expect("create chunk");
        VectorIndex::upsert(&db, &[chunks[0].id.clone()], &[vec![1.0, 0.0, 0.0]], 3)
            .await
            .expect("upsert");

        let services = TestServices {
            db,
            config: base_config(),
            query_vector: vec![1.0, 0.0, 0.0],
            rerank_fails: true,
            generate_calls: AtomicUsize::new(0),
        };

        let err = run_ask(&services, "what is alpha?").await.unwrap_err();
        assert!(matches!(err, AppError::RetrievalError(_)));
        assert_eq!(services.generate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retrieve_chunks_does_not_invoke_the_generator() {
        let db = memory_db(3).await;
        let chunks = ChunkRecord::bulk_create(
            &db,
            vec![NewChunk {
                source_document_id: "doc-1".into(),
                chunk_text: "alpha passage".into(),
                sequence_in_document: 0,
            }],
        )
        .await
        .expect("create chunk");
        VectorIndex::upsert(&db, &[chunks[0].id.clone()], &[vec![1.0, 0.0, 0.0]], 3)
            .await
            .expect("upsert");

        let services = TestServices {
            db,
            config: base_config(),
            query_vector: vec![1.0, 0.0, 0.0],
            rerank_fails: false,
            generate_calls: AtomicUsize::new(0),
        };

        let result = run_retrieve_chunks(&services, "what is alpha?")
            .await
            .expect("run");
        assert_eq!(result.len(), 1);
        assert_eq!(services.generate_calls.load(Ordering::SeqCst), 0);
    }
}
