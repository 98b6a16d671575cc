use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Blob store / local-filesystem backend selection (§6 `blob_store.kind`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
    Memory,
    ObjectStore,
}

/// Which embedder implementation `ModelHosts` constructs (§6 `embedding.backend`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Fastembed,
    Hashed,
}

/// Device preference for local ONNX inference (§4.1). Resolution to an
/// actual execution provider happens once at `FastEmbedHost`/reranker pool
/// construction and is logged there, not re-evaluated per call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

/// Layered application configuration: one file source plus environment
/// overrides, merged into a single typed struct (§1 ambient stack,
/// §6 configuration table).
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    // --- store.* : SurrealDB connection, doubles as ChunkStore/VectorIndex/queue ---
    #[serde(default = "default_store_url")]
    pub store_url: String,
    #[serde(default = "default_store_namespace")]
    pub store_namespace: String,
    #[serde(default = "default_store_database")]
    pub store_database: String,
    #[serde(default)]
    pub store_username: String,
    #[serde(default)]
    pub store_password: String,

    // --- blob_store.* ---
    #[serde(default)]
    pub blob_store_kind: StorageKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub blob_store_endpoint: Option<String>,
    #[serde(default)]
    pub blob_store_bucket: Option<String>,

    // --- embedding.* ---
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    #[serde(default = "default_embedding_instruction")]
    pub embedding_instruction: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,
    /// Device preference for the embedder/reranker ONNX sessions (§4.1
    /// "device selection policy"): `"gpu"` prefers a GPU execution provider
    /// if this binary was built with one compiled in, falling back to CPU;
    /// `"cpu"` pins plain CPU outright.
    #[serde(default)]
    pub embedding_device: DevicePreference,

    // --- chunk.* ---
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    // --- retrieval.* ---
    #[serde(default = "default_k_recall")]
    pub retrieval_k_recall: usize,
    #[serde(default = "default_k_final")]
    pub retrieval_k_final: usize,
    #[serde(default = "default_no_relevant_information")]
    pub retrieval_empty_answer: String,

    // --- reranker.* ---
    #[serde(default = "default_reranker_instruction")]
    pub reranker_instruction: String,
    #[serde(default = "default_reranker_model")]
    pub reranker_model: String,
    #[serde(default)]
    pub reranker_pool_size: Option<usize>,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,
    #[serde(default)]
    pub fastembed_show_download_progress: Option<bool>,
    #[serde(default)]
    pub fastembed_max_length: Option<usize>,

    // --- generator.* (async-openai chat completion) ---
    #[serde(default = "default_generator_model")]
    pub generator_model: String,
    #[serde(default = "default_generator_max_new_tokens")]
    pub generator_max_new_tokens: u32,
    #[serde(default = "default_generator_temperature")]
    pub generator_temperature: f32,
    #[serde(default = "default_generator_top_p")]
    pub generator_top_p: f32,
    #[serde(default)]
    pub generator_stop: Vec<String>,
    #[serde(default = "default_openai_api_key")]
    pub openai_api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    // --- queue.* (§4.9a TaskRunner tuning) ---
    #[serde(default = "default_lease_seconds")]
    pub queue_lease_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub queue_max_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,
    #[serde(default = "default_worker_concurrency")]
    pub queue_worker_concurrency: usize,

    // --- http.* ---
    #[serde(default = "default_bind_address")]
    pub http_bind_address: String,
    #[serde(default = "default_upload_max_body_bytes")]
    pub upload_max_body_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            store_namespace: default_store_namespace(),
            store_database: default_store_database(),
            store_username: String::new(),
            store_password: String::new(),
            blob_store_kind: StorageKind::default(),
            data_dir: default_data_dir(),
            blob_store_endpoint: None,
            blob_store_bucket: None,
            embedding_dimension: default_embedding_dimension(),
            embedding_instruction: default_embedding_instruction(),
            embedding_model: default_embedding_model(),
            embedding_backend: EmbeddingBackend::default(),
            embedding_device: DevicePreference::default(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            retrieval_k_recall: default_k_recall(),
            retrieval_k_final: default_k_final(),
            retrieval_empty_answer: default_no_relevant_information(),
            reranker_instruction: default_reranker_instruction(),
            reranker_model: default_reranker_model(),
            reranker_pool_size: None,
            fastembed_cache_dir: None,
            fastembed_show_download_progress: None,
            fastembed_max_length: None,
            generator_model: default_generator_model(),
            generator_max_new_tokens: default_generator_max_new_tokens(),
            generator_temperature: default_generator_temperature(),
            generator_top_p: default_generator_top_p(),
            generator_stop: Vec::new(),
            openai_api_key: default_openai_api_key(),
            openai_base_url: default_openai_base_url(),
            queue_lease_seconds: default_lease_seconds(),
            queue_max_attempts: default_max_attempts(),
            queue_poll_interval_ms: default_poll_interval_ms(),
            queue_worker_concurrency: default_worker_concurrency(),
            http_bind_address: default_bind_address(),
            upload_max_body_bytes: default_upload_max_body_bytes(),
        }
    }
}

fn default_store_url() -> String {
    "mem://".to_string()
}
fn default_store_namespace() -> String {
    "rag".to_string()
}
fn default_store_database() -> String {
    "rag".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_embedding_dimension() -> usize {
    384
}
fn default_embedding_instruction() -> String {
    "query: ".to_string()
}
fn default_embedding_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}
fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_k_recall() -> usize {
    50
}
fn default_k_final() -> usize {
    5
}
fn default_no_relevant_information() -> String {
    "I could not find any relevant information in the corpus to answer this question."
        .to_string()
}
fn default_reranker_instruction() -> String {
    String::new()
}
fn default_reranker_model() -> String {
    "BAAI/bge-reranker-base".to_string()
}
fn default_generator_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_generator_max_new_tokens() -> u32 {
    512
}
fn default_generator_temperature() -> f32 {
    0.0
}
fn default_generator_top_p() -> f32 {
    1.0
}
fn default_openai_api_key() -> String {
    String::new()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_lease_seconds() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_worker_concurrency() -> usize {
    4
}
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_upload_max_body_bytes() -> usize {
    100 * 1024 * 1024
}

/// Load configuration from `config.{toml,yaml,json,...}` (if present) with
/// environment variables as the final, highest-priority layer (§8 scenario 9).
pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let cfg = AppConfig::default();
        assert!(cfg.chunk_overlap < cfg.chunk_size);
        assert!(cfg.retrieval_k_final <= cfg.retrieval_k_recall);
        assert_eq!(cfg.blob_store_kind, StorageKind::Local);
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("CHUNK_SIZE", "777");
        let config = Config::builder()
            .set_default("chunk_size", 1000i64)
            .unwrap()
            .add_source(Environment::default().separator("__"))
            .build()
            .expect("config builds");
        let cfg: AppConfig = config.try_deserialize().expect("deserializes");
        assert_eq!(cfg.chunk_size, 777);
        std::env::remove_var("CHUNK_SIZE");
    }
}
