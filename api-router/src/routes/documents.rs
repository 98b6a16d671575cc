use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        types::{
            chunk_record::ChunkRecord,
            document_record::{DocumentRecord, StorageType},
            ingest_job::IngestJob,
        },
        vector_index::VectorIndex,
    },
    utils::config::StorageKind,
};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::warn;
use uuid::Uuid;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, TryFromMultipart)]
pub struct UploadParams {
    pub file: FieldData<NamedTempFile>,
}

/// `POST /documents` (§6): persists the record, stores the bytes, and
/// enqueues an ingest job. On enqueue failure the record and the uploaded
/// blob are both removed so no orphaned `uploaded` document is left behind.
pub async fn upload_document(
    State(state): State<ApiState>,
    TypedMultipart(input): TypedMultipart<UploadParams>,
) -> Result<impl IntoResponse, ApiError> {
    let metadata = input.file.metadata;
    let original_filename = metadata
        .file_name
        .ok_or_else(|| ApiError::BadRequest("multipart file part is missing a filename".to_string()))?;
    let content_type = metadata
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let bytes = tokio::fs::read(input.file.contents.path())
        .await
        .map_err(AppError::from)?;
    let size = bytes.len() as u64;

    let file_path = format!("documents/{}-{original_filename}", Uuid::new_v4());
    let storage_type = match state.storage.backend_kind() {
        StorageKind::Local => StorageType::Local,
        StorageKind::Memory | StorageKind::ObjectStore => StorageType::ObjectStore,
    };

    let document = DocumentRecord::create(
        &state.db,
        original_filename,
        content_type,
        size,
        file_path.clone(),
        storage_type,
    )
    .await?;

    if let Err(err) = state.storage.put(&file_path, Bytes::from(bytes)).await {
        let _ = DocumentRecord::delete(&state.db, &document.id).await;
        return Err(ApiError::from(AppError::from(err)));
    }


    if let Err(err) = IngestJob::enqueue(&state.db, document.id.clone()).await {
        let _ = state.storage.delete_prefix(&file_path).await;
        let _ = DocumentRecord::delete(&state.db, &document.id).await;
        return Err(ApiError::from(err));
    }

    Ok((StatusCode::CREATED, Json(document)))
}

#[derive(Debug, Deserialize)]
pub struct ListDocumentsParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub order: ListOrder,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListOrder {
    #[default]
    Asc,
    Desc,
}

fn default_limit() -> u32 {
    50
}

/// `GET /documents?limit=&offset=&order=` (§6).
pub async fn list_documents(
    State(state): State<ApiState>,
    Query(params): Query<ListDocumentsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let descending = matches!(params.order, ListOrder::Desc);
    let documents =
        DocumentRecord::list(&state.db, params.limit, params.offset, descending).await?;
    Ok(Json(documents))
}

/// `GET /documents/{id}` (§6).
pub async fn get_document(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let document = DocumentRecord::get(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(id.clone()))?;
    Ok(Json(document))
}

/// `DELETE /documents/{id}` (§6): cascades to chunks, vectors, and the blob.
pub async fn delete_document(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let document = DocumentRecord::get(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(id.clone()))?;

    ChunkRecord::delete_by_document(&state.db, &id).await?;
    VectorIndex::delete_by_document(&state.db, &id).await?;
    DocumentRecord::delete(&state.db, &id).await?;

    if let Err(err) = state.storage.delete_prefix(&document.file_path).await {
        warn!(document_id = %id, error = %err, "failed to remove blob after document delete");
    }

    Ok(StatusCode::NO_CONTENT)
}

/// `GET /documents/{id}/download` (§6): `400` for non-local storage, since
/// only the local backend is ever exposed for direct download.
pub async fn download_document(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let document = DocumentRecord::get(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(id.clone()))?;

    if !matches!(document.storage_type, StorageType::Local) {
        return Err(ApiError::BadRequest(
            "download is only available for documents stored on the local backend".to_string(),
        ));
    }

    let stream = state
        .storage
        .get_stream(&document.file_path)
        .await
        .map_err(|err| ApiError::from(AppError::from(err)))?;
    let body = Body::from_stream(stream);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&document.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!(
            "attachment; filename=\"{}\"",
            document.original_filename
        ))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );

    Ok((StatusCode::OK, headers, body))
}
