use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
    Router,
};
use routes::{
    documents::{delete_document, download_document, get_document, list_documents, upload_document},
    liveness::live,
    query::{ask, retrieve_chunks},
    readiness::ready,
};

pub mod api_state;
pub mod error;
mod routes;

/// HTTP surface (§6). Authentication and the UI shell are deliberately out
/// of scope (§1) — this is the whole of `api_routes_v1`, not a subset
/// behind an auth layer.
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    let probes = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let documents = Router::new()
        .route(
            "/documents",
            post(upload_document).layer(DefaultBodyLimit::max(app_state.config.upload_max_body_bytes)).get(list_documents),
        )
        .route("/documents/{id}", get(get_document).delete(delete_document))
        .route("/documents/{id}/download", get(download_document));

    let query = Router::new()
        .route("/query/retrieve-chunks", post(retrieve_chunks))
        .route("/query/ask", post(ask));

    probes.merge(documents).merge(query)
}
