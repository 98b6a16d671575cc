use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use async_trait::async_trait;
use fastembed::{EmbeddingModel as FastembedModel, InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::AppError;
use crate::models::device;
use crate::utils::config::AppConfig;

/// Which instruction (if any) a batch of texts should be embedded with
/// (§4.1). Query mode prepends the configured instruction; document mode
/// never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    Query,
    Document,
}

/// Capability interface every embedder implementation satisfies (§4.1,
/// §9 "dynamic dispatch over model kinds"). A single production
/// implementation (`FastEmbedHost`) and one test double (`HashedEmbedder`)
/// live behind it; callers never match on which one they hold.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: Vec<String>, mode: EmbedMode) -> Result<Vec<Vec<f32>>, AppError>;
    fn dimension(&self) -> usize;
}

static NEXT_EMBEDDER_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_EMBEDDER_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

/// Local ONNX embedder pool via `fastembed`, mirroring the reranker pool's
/// "single shared resource behind a semaphore-gated round robin" shape so
/// the §5 serialization rule is enforced by the type, not caller discipline.
pub struct FastEmbedHost {
    engines: Vec<Arc<Mutex<TextEmbedding>>>,
    semaphore: Arc<Semaphore>,
    instruction: String,
    dimension: usize,
}

impl FastEmbedHost {
    pub fn new(config: &AppConfig, pool_size: usize) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "embedding pool size must be greater than zero".to_string(),
            ));
        }

        device::resolve_and_log(config.embedding_device, "embedder");
        let init_options = build_embed_init_options(config)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating embedding engine: {x}");
            let model = TextEmbedding::try_new(init_options.clone())
                .map_err(|e| AppError::ModelError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            instruction: config.embedding_instruction.clone(),
            dimension: config.embedding_dimension,
        }))
    }

    async fn checkout(&self) -> (OwnedSemaphorePermit, Arc<Mutex<TextEmbedding>>) {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        let idx = pick_engine_index(self.engines.len());
        (permit, self.engines[idx].clone())
    }
}

#[async_trait]
impl Embedder for FastEmbedHost {
    async fn embed(&self, texts: Vec<String>, mode: EmbedMode) -> Result<Vec<Vec<f32>>, AppError> {
        let prepared: Vec<String> = match mode {
            EmbedMode::Query => texts
                .into_iter()
                .map(|t| format!("{}{t}", self.instruction))
                .collect(),
            EmbedMode::Document => texts,
        };

        let (_permit, engine) = self.checkout().await;
        let mut guard = engine.lock().await;
        let vectors = guard
            .embed(prepared, None)
            .map_err(|e| AppError::ModelError(e.to_string()))?;

        Ok(vectors.into_iter().map(normalize).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn normalize(vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        vector
    } else {
        vector.into_iter().map(|v| v / norm).collect()
    }
}

fn build_embed_init_options(config: &AppConfig) -> Result<InitOptions, AppError> {
    let mut options = InitOptions::new(resolve_model(&config.embedding_model));

    let cache_dir = config
        .fastembed_cache_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| env::var("FASTEMBED_CACHE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| Path::new(&config.data_dir).join("fastembed").join("embedder"));
    fs::create_dir_all(&cache_dir).map_err(AppError::Io)?;
    options.cache_dir = cache_dir;

    options.show_download_progress = config.fastembed_show_download_progress.unwrap_or(true);
    if let Some(max_length) = config.fastembed_max_length {
        options.max_length = max_length;
    }

    Ok(options)
}

fn resolve_model(name: &str) -> FastembedModel {
    match name {
        "BAAI/bge-small-en-v1.5" => FastembedModel::BGESmallENV15,
        "BAAI/bge-base-en-v1.5" => FastembedModel::BGEBaseENV15,
        "sentence-transformers/all-MiniLM-L6-v2" => FastembedModel::AllMiniLML6V2,
        _ => FastembedModel::BGESmallENV15,
    }
}

/// Dependency-free test/offline embedder (§4.1, §9): deterministic SHA-256
/// based pseudo-embedding, so tests exercise the full pipeline without a
/// downloaded ONNX model. Selected by `embedding.backend = "hashed"`, never
/// as a runtime fallback.
pub struct HashedEmbedder {
    dimension: usize,
    instruction: String,
}

impl HashedEmbedder {
    pub fn new(dimension: usize, instruction: String) -> Self {
        Self {
            dimension,
            instruction,
        }
    }

    fn hash_to_vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let mut counter: u32 = 0;
        let mut filled = 0;
        while filled < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if filled >= self.dimension {
                    break;
                }
                let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map into [-1, 1] deterministically.
                vector[filled] = (bits as f32 / u32::MAX as f32) * 2.0 - 1.0;
                filled += 1;
            }
            counter += 1;
        }
        normalize(vector)
    }
}

#[async_trait]
impl Embedder for HashedEmbedder {
    async fn embed(&self, texts: Vec<String>, mode: EmbedMode) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(texts
            .into_iter()
            .map(|t| {
                let prepared = match mode {
                    EmbedMode::Query => format!("{}{t}", self.instruction),
                    EmbedMode::Document => t,
                };
                self.hash_to_vector(&prepared)
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embedder_produces_unit_norm_vectors() {
        let embedder = HashedEmbedder::new(16, "query: ".to_string());
        let vectors = embedder
            .embed(vec!["alpha".to_string()], EmbedMode::Document)
            .await
            .expect("embed");
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hashed_embedder_query_mode_differs_from_document_mode() {
        let embedder = HashedEmbedder::new(16, "query: ".to_string());
        let query = embedder
            .embed(vec!["x".to_string()], EmbedMode::Query)
            .await
            .expect("embed query");
        let document = embedder
            .embed(vec!["x".to_string()], EmbedMode::Document)
            .await
            .expect("embed document");
        assert_ne!(query, document);
    }

    #[tokio::test]
    async fn hashed_embedder_is_deterministic() {
        let embedder = HashedEmbedder::new(16, String::new());
        let a = embedder
            .embed(vec!["same input".to_string()], EmbedMode::Document)
            .await
            .expect("embed a");
        let b = embedder
            .embed(vec!["same input".to_string()], EmbedMode::Document)
            .await
            .expect("embed b");
        assert_eq!(a, b);
    }
}
