//! C8: query → answer pipeline (§4.8): embed → recall → hydrate → rerank →
//! ground → generate. Chunk-only dense-recall-then-rerank, not the
//! teacher's hybrid entity+FTS+graph fusion — knowledge-graph expansion
//! and multi-turn chat history threading are out of scope (§9 Open Questions).

pub mod pipeline;
pub mod reranking;

pub use pipeline::{
    run_ask, run_retrieve_chunks, run_retrieve_chunks_with_k, RetrievalConfig, RetrievalServices,
    SupportingChunk,
};
