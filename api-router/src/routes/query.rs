use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct RetrieveChunksRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SupportingChunkResponse {
    pub chunk_id: String,
    pub source_document_id: String,
    pub sequence_in_document: u32,
    pub chunk_text: String,
    pub score: f32,
}

/// `POST /query/retrieve-chunks` (§6): recall + rerank only, no generation.
/// `top_k` overrides the configured `retrieval.k_final` for this call.
#[instrument(skip(state, request), fields(query_len = request.query.len()))]
pub async fn retrieve_chunks(
    State(state): State<ApiState>,
    Json(request): Json<RetrieveChunksRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let chunks = if let Some(top_k) = request.top_k {
        retrieval_pipeline::pipeline::run_retrieve_chunks_with_k(
            state.retrieval.as_ref(),
            &request.query,
            top_k,
        )
        .await?
    } else {
        retrieval_pipeline::pipeline::run_retrieve_chunks(state.retrieval.as_ref(), &request.query)
            .await?
    };

    let response: Vec<SupportingChunkResponse> = chunks
        .into_iter()
        .map(|s| SupportingChunkResponse {
            chunk_id: s.chunk.id,
            source_document_id: s.chunk.source_document_id,
            sequence_in_document: s.chunk.sequence_in_document,
            chunk_text: s.chunk.chunk_text,
            score: s.score,
        })
        .collect();

    Ok((StatusCode::OK, Json(response)))
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub query: String,
    pub answer: String,
    pub retrieved_context_texts: Vec<String>,
}

/// `POST /query/ask` (§6, §4.8): the full grounded generation pipeline.
#[instrument(skip(state, request), fields(query_len = request.query.len()))]
pub async fn ask(
    State(state): State<ApiState>,
    Json(request): Json<AskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = retrieval_pipeline::pipeline::run_ask(state.retrieval.as_ref(), &request.query).await?;

    Ok((
        StatusCode::OK,
        Json(AskResponse {
            query: request.query,
            answer: outcome.answer,
            retrieved_context_texts: outcome
                .supporting_chunks
                .into_iter()
                .map(|s| s.chunk.chunk_text)
                .collect(),
        }),
    ))
}
