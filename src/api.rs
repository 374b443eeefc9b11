use std::convert::Infallible;

use axum::{
    extract::{Json, Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
    Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::{
    app_state::AppState,
    models::{Citation, DeleteOutcome, FailureKind, IndexOutcome, QueryResult},
    rag::{IndexParams, QueryParams},
};

// --- Payloads y respuestas ---
//
// Los campos opcionales ausentes toman el valor de `RagSettings` en el pipeline.

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    question: String,
    #[serde(default)]
    collection_name: Option<String>,
    #[serde(default)]
    k: Option<i64>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    model: Option<String>,
    /// Datos en vivo aportados por el cliente; tienen prioridad sobre los documentos.
    #[serde(default)]
    context: Option<String>,
}

impl ChatRequest {
    fn into_params(self) -> QueryParams {
        QueryParams {
            question: self.question,
            collection_name: self.collection_name,
            k: self.k,
            threshold: self.threshold,
            model: self.model,
            dynamic_context: self.context,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    answer: String,
    sources: Vec<Citation>,
    documents_retrieved: usize,
    documents_used: usize,
    error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl From<QueryResult> for ChatResponse {
    fn from(result: QueryResult) -> Self {
        Self {
            error: result.is_error(),
            error_message: result.error_message(),
            answer: result.answer,
            sources: result.sources,
            documents_retrieved: result.documents_retrieved,
            documents_used: result.documents_used,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IndexRequest {
    file_paths: Vec<String>,
    #[serde(default)]
    collection_name: Option<String>,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    chunk_overlap: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    success: bool,
    message: String,
    indexed_count: usize,
    files_processed: usize,
}

impl From<IndexOutcome> for IndexResponse {
    fn from(outcome: IndexOutcome) -> Self {
        Self {
            success: outcome.success,
            message: outcome.message,
            indexed_count: outcome.indexed_count,
            files_processed: outcome.files_processed,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    file_paths: Vec<String>,
    #[serde(default)]
    collection_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    success: bool,
    message: String,
    deleted_count: usize,
}

impl From<DeleteOutcome> for DeleteResponse {
    fn from(outcome: DeleteOutcome) -> Self {
        Self {
            success: outcome.success,
            message: outcome.message,
            deleted_count: outcome.deleted_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CollectionResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    backend_available: bool,
    available_models: Vec<String>,
}

#[derive(Serialize)]
struct StreamHead<'a> {
    sources: &'a [Citation],
    documents_retrieved: usize,
    documents_used: usize,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route("/index", post(index_handler))
        .route("/documents", delete(delete_documents_handler))
        .route("/collections/:name", delete(delete_collection_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let llm = state.pipeline.llm();
    let backend_available = llm.health().await;
    let available_models = if backend_available {
        llm.list_models().await
    } else {
        Vec::new()
    };

    Json(HealthResponse {
        status: if backend_available { "healthy" } else { "degraded" },
        backend_available,
        available_models,
    })
}

#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Json<ChatResponse> {
    info!(
        "Consulta sobre '{}'",
        payload.collection_name.as_deref().unwrap_or("(por defecto)")
    );
    let result = state.pipeline.query(&payload.into_params()).await;
    Json(result.into())
}

/// SSE: `sources` → `token`* → `done`, o un único `error`.
#[axum::debug_handler]
async fn chat_stream_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Sse<BoxStream<'static, Result<Event, Infallible>>> {
    let events = match state.pipeline.query_stream(&payload.into_params()).await {
        Ok(answer) => {
            let head = json_event(
                "sources",
                &StreamHead {
                    sources: &answer.sources,
                    documents_retrieved: answer.documents_retrieved,
                    documents_used: answer.documents_used,
                },
            );

            let tail = stream::unfold(Some(answer.fragments), |pending| async move {
                let mut fragments = pending?;
                match fragments.next().await {
                    Some(Ok(text)) => Some((Event::default().event("token").data(text), Some(fragments))),
                    Some(Err(e)) => {
                        error!(error = %e, "Streaming interrumpido");
                        let failed = QueryResult::failed(FailureKind::GenerationFailed, Some(e.to_string()));
                        Some((error_event(&failed), None))
                    }
                    None => Some((Event::default().event("done").data("[DONE]"), None)),
                }
            });

            stream::once(async move { head }).chain(tail).boxed()
        }
        Err(result) => {
            let event = error_event(&result);
            stream::once(async move { event }).boxed()
        }
    };

    Sse::new(events.map(Ok::<_, Infallible>).boxed()).keep_alive(KeepAlive::default())
}

#[axum::debug_handler]
async fn index_handler(
    State(state): State<AppState>,
    Json(payload): Json<IndexRequest>,
) -> Json<IndexResponse> {
    info!(
        "Indexando {} ruta(s) en '{}'",
        payload.file_paths.len(),
        payload.collection_name.as_deref().unwrap_or("(por defecto)")
    );
    let params = IndexParams {
        file_paths: payload.file_paths,
        collection_name: payload.collection_name,
        chunk_size: payload.chunk_size,
        chunk_overlap: payload.chunk_overlap,
    };
    Json(state.pipeline.index_files(&params).await.into())
}

#[axum::debug_handler]
async fn delete_documents_handler(
    State(state): State<AppState>,
    Json(payload): Json<DeleteRequest>,
) -> Json<DeleteResponse> {
    let outcome = state
        .pipeline
        .delete_documents(&payload.file_paths, payload.collection_name.as_deref())
        .await;
    Json(outcome.into())
}

#[axum::debug_handler]
async fn delete_collection_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<CollectionResponse> {
    let outcome = state.pipeline.delete_collection(&name).await;
    Json(CollectionResponse {
        success: outcome.success,
        message: outcome.message,
    })
}

fn json_event(name: &str, value: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(value)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

fn error_event(result: &QueryResult) -> Event {
    json_event(
        "error",
        &json!({
            "answer": result.answer,
            "error": true,
            "error_message": result.error_message(),
            "documents_retrieved": result.documents_retrieved,
            "documents_used": result.documents_used,
        }),
    )
}
