use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Central error taxonomy shared by every crate in the workspace.
///
/// Variant names carry the contract (see the error handling design): callers
/// match on kind, not message text, to decide whether a failure is retryable,
/// terminal for a document, or a plain 4xx surfaced to an HTTP caller.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unsupported content type: {0}")]
    UnsupportedType(String),

    #[error("parse error in {filename}: {cause}")]
    ParseError { filename: String, cause: String },

    #[error("document produced no content after parsing")]
    EmptyContent,

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("model error: {0}")]
    ModelError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("retrieval error: {0}")]
    RetrievalError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error("openai error: {0}")]
    OpenAI(#[from] OpenAIError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("task join error: {0}")]
    Join(#[from] JoinError),
}

impl AppError {
    /// Whether the TaskRunner should retry the step that produced this error
    /// rather than moving the document straight to `error`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransportError(_)
                | AppError::ModelError(_)
                | AppError::Database(_)
                | AppError::ObjectStore(_)
                | AppError::OpenAI(_)
        )
    }

    /// Short, `error_message`-sized rendering: `"<step>: <cause>"`.
    pub fn truncated_message(&self, step: &str, max_len: usize) -> String {
        let full = format!("{step}: {self}");
        if full.chars().count() <= max_len {
            full
        } else {
            full.chars().take(max_len).collect()
        }
    }
}
