//! Pipeline RAG: consulta, consulta en streaming, indexación y borrado.
//!
//! Flujo de una consulta (estrictamente secuencial, con salida temprana):
//!   1. Salud del backend de generación (si falla, no se toca el almacén).
//!   2. Apertura de la colección.
//!   3. Búsqueda de los `k` chunks más cercanos.
//!   4. Filtro por relevancia (`distance < threshold`).
//!   5. Montaje del prompt.
//!   6. Generación.
//!   7. Respuesta con citas construidas sólo a partir de los chunks filtrados.
//!
//! Los fallos nunca se propagan como error: se devuelven como `QueryResult`
//! con un mensaje estable y el detalle diagnóstico aparte.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::chunker::chunk_documents;
use crate::config::{validate_chunking, RagSettings};
use crate::error::RagError;
use crate::ingest::DocumentLoader;
use crate::llm::{FragmentStream, GenerationRequest, LlmBackend};
use crate::models::{
    Citation, DeleteOutcome, FailureKind, IndexOutcome, QueryResult, ScoredMatch,
};
use crate::prompt::{build_prompt, SYSTEM_PROMPT};
use crate::vector_store::VectorStore;

/// Longitud máxima (en caracteres) de la vista previa de una cita.
pub const PREVIEW_CHARS: usize = 200;

/// Parámetros de una consulta. Los `None` toman el valor de `RagSettings`.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub question: String,
    pub collection_name: Option<String>,
    pub k: Option<i64>,
    pub threshold: Option<f64>,
    pub model: Option<String>,
    pub dynamic_context: Option<String>,
}

impl QueryParams {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexParams {
    pub file_paths: Vec<String>,
    pub collection_name: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
}

/// Respuesta en streaming: las citas y recuentos se conocen antes de generar.
pub struct StreamingAnswer {
    pub sources: Vec<Citation>,
    pub documents_retrieved: usize,
    pub documents_used: usize,
    pub fragments: FragmentStream,
}

/// Todo lo que queda listo tras los pasos 1-5.
struct PreparedQuery {
    request: GenerationRequest,
    sources: Vec<Citation>,
    documents_retrieved: usize,
    documents_used: usize,
}

impl PreparedQuery {
    fn generation_failed(&self, detail: String) -> QueryResult {
        QueryResult {
            documents_retrieved: self.documents_retrieved,
            documents_used: self.documents_used,
            ..QueryResult::failed(FailureKind::GenerationFailed, Some(detail))
        }
    }
}

pub struct RagPipeline {
    store: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmBackend>,
    loader: DocumentLoader,
    settings: RagSettings,
}

impl RagPipeline {
    pub fn new(
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmBackend>,
        loader: DocumentLoader,
        settings: RagSettings,
    ) -> Self {
        Self {
            store,
            llm,
            loader,
            settings,
        }
    }

    pub fn llm(&self) -> &Arc<dyn LlmBackend> {
        &self.llm
    }

    fn collection_name<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.settings.default_collection)
    }

    // ---------------------------------------------------------------------
    // CONSULTA
    // ---------------------------------------------------------------------

    pub async fn query(&self, params: &QueryParams) -> QueryResult {
        let prepared = match self.prepare(params).await {
            Ok(prepared) => prepared,
            Err(result) => return result,
        };

        match self.llm.generate(&prepared.request).await {
            Ok(answer) => {
                info!(
                    "Consulta respondida ({} recuperados, {} usados)",
                    prepared.documents_retrieved, prepared.documents_used
                );
                QueryResult {
                    answer,
                    sources: prepared.sources,
                    documents_retrieved: prepared.documents_retrieved,
                    documents_used: prepared.documents_used,
                    failure: None,
                }
            }
            Err(e) => {
                error!(error = %e, "Fallo en la generación");
                prepared.generation_failed(e.to_string())
            }
        }
    }

    /// Igual que `query`, pero la respuesta llega como flujo de fragmentos.
    pub async fn query_stream(
        &self,
        params: &QueryParams,
    ) -> std::result::Result<StreamingAnswer, QueryResult> {
        let prepared = self.prepare(params).await?;

        match self.llm.generate_stream(&prepared.request).await {
            Ok(fragments) => Ok(StreamingAnswer {
                sources: prepared.sources,
                documents_retrieved: prepared.documents_retrieved,
                documents_used: prepared.documents_used,
                fragments,
            }),
            Err(e) => {
                error!(error = %e, "Fallo al abrir el streaming de generación");
                Err(prepared.generation_failed(e.to_string()))
            }
        }
    }

    /// Pasos 1 a 5. Un `Err` ya es el resultado final de la consulta.
    async fn prepare(&self, params: &QueryParams) -> std::result::Result<PreparedQuery, QueryResult> {
        let k = params.k.unwrap_or(self.settings.top_k as i64);
        if k <= 0 {
            warn!("Consulta rechazada: k={k}");
            return Err(QueryResult::failed(
                FailureKind::InvalidRequest,
                Some(RagError::InvalidConfiguration(format!("k must be positive, got {k}")).to_string()),
            ));
        }
        let k = k as usize;
        let threshold = params.threshold.unwrap_or(self.settings.threshold);

        // 1) Salud del backend
        if !self.llm.health().await {
            warn!("Backend de generación no disponible; no se consulta el almacén");
            return Err(QueryResult::failed(
                FailureKind::BackendUnavailable,
                Some(RagError::BackendUnavailable("health check failed".to_string()).to_string()),
            ));
        }

        // 2) Colección
        let name = self.collection_name(params.collection_name.as_deref());
        let collection = match self.store.open_collection(name).await {
            Ok(collection) => collection,
            Err(e) => {
                warn!(error = %e, "No se pudo abrir la colección '{name}'");
                return Err(QueryResult::failed(
                    FailureKind::CollectionNotFound,
                    Some(e.to_string()),
                ));
            }
        };

        // 3) Recuperación
        let matches = match self.store.search(&collection, &params.question, k).await {
            Ok(matches) => matches,
            Err(e) => {
                error!(error = %e, "Fallo en la búsqueda sobre '{name}'");
                return Err(QueryResult::failed(
                    FailureKind::RetrievalFailed,
                    Some(e.to_string()),
                ));
            }
        };
        let documents_retrieved = matches.len();

        // 4) Filtro
        let relevant = filter_by_relevance(matches, threshold);
        let documents_used = relevant.len();
        info!("'{name}': {documents_retrieved} recuperados, {documents_used} bajo el umbral {threshold}");

        // 5) Prompt
        let prompt = build_prompt(&params.question, &relevant, params.dynamic_context.as_deref());
        let model = params
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.settings.chat_model.clone());

        Ok(PreparedQuery {
            request: GenerationRequest {
                prompt,
                model,
                system_prompt: Some(SYSTEM_PROMPT.to_string()),
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
            },
            sources: relevant.iter().map(citation).collect(),
            documents_retrieved,
            documents_used,
        })
    }

    // ---------------------------------------------------------------------
    // INDEXACIÓN
    // ---------------------------------------------------------------------

    pub async fn index_files(&self, params: &IndexParams) -> IndexOutcome {
        let chunk_size = params.chunk_size.unwrap_or(self.settings.chunk_size);
        let chunk_overlap = params.chunk_overlap.unwrap_or(self.settings.chunk_overlap);
        if let Err(e) = validate_chunking(chunk_size, chunk_overlap) {
            return index_failure(format!("Error during indexing: {e}"));
        }

        // 1) Carga
        let report = self.loader.load_paths(&params.file_paths).await;
        if report.documents.is_empty() {
            warn!("Ningún documento cargado de {} ruta(s)", params.file_paths.len());
            return index_failure("No documents could be loaded from the provided paths.".to_string());
        }

        // 2) Chunking
        let chunks = match chunk_documents(&report.documents, chunk_size, chunk_overlap) {
            Ok(chunks) if chunks.is_empty() => {
                return IndexOutcome {
                    files_processed: report.files_loaded,
                    ..index_failure("The loaded documents contain no indexable text.".to_string())
                }
            }
            Ok(chunks) => chunks,
            Err(e) => return index_failure(format!("Error during indexing: {e}")),
        };

        // 3) Colección: existe → abrir; si no → crear
        let name = self.collection_name(params.collection_name.as_deref());
        let collection = match self.store.collection_exists(name).await {
            Ok(true) => self.store.open_collection(name).await,
            Ok(false) => {
                info!("Creando la colección '{name}'");
                self.store.create_collection(name).await
            }
            Err(e) => Err(e),
        };
        let collection = match collection {
            Ok(collection) => collection,
            Err(e) => {
                error!(error = %e, "No se pudo preparar la colección '{name}'");
                return index_failure(format!("Error during indexing: {e}"));
            }
        };

        // 4) Embeddings + almacenamiento
        match self.store.add(&collection, &chunks).await {
            Ok(indexed) => {
                info!(
                    "Indexados {indexed} chunks de {} fichero(s) en '{name}'",
                    report.files_loaded
                );
                IndexOutcome {
                    success: true,
                    message: format!(
                        "Successfully indexed {} file(s) into {} chunks.",
                        report.files_loaded, indexed
                    ),
                    indexed_count: indexed,
                    files_processed: report.files_loaded,
                }
            }
            Err(RagError::PartialIndexFailure { indexed, failed }) => {
                warn!("Indexación parcial en '{name}': {indexed} ok, {failed} fallidos");
                IndexOutcome {
                    success: false,
                    message: format!(
                        "Partially indexed: {indexed} chunk(s) stored, {failed} chunk(s) failed to embed."
                    ),
                    indexed_count: indexed,
                    files_processed: report.files_loaded,
                }
            }
            Err(e) => {
                error!(error = %e, "Fallo al indexar en '{name}'");
                index_failure(format!("Error during indexing: {e}"))
            }
        }
    }

    // ---------------------------------------------------------------------
    // BORRADO
    // ---------------------------------------------------------------------

    /// Borra por `source` cada ruta. Rutas sin chunks no son un error.
    pub async fn delete_documents(
        &self,
        file_paths: &[String],
        collection_name: Option<&str>,
    ) -> DeleteOutcome {
        let name = self.collection_name(collection_name);

        let collection = match self.store.collection_exists(name).await {
            Ok(false) => {
                return DeleteOutcome {
                    success: true,
                    message: format!("Collection '{name}' does not exist; nothing to delete."),
                    deleted_count: 0,
                }
            }
            Ok(true) => self.store.open_collection(name).await,
            Err(e) => Err(e),
        };
        let collection = match collection {
            Ok(collection) => collection,
            Err(e) => return delete_failure(e),
        };

        let mut deleted_count = 0;
        for path in file_paths {
            match self.store.delete_by_source(&collection, path).await {
                Ok(n) => deleted_count += n,
                Err(e) => {
                    error!(error = %e, "Fallo borrando '{path}' de '{name}'");
                    return delete_failure(e);
                }
            }
        }

        info!("Borrados {deleted_count} chunks de {} ruta(s) en '{name}'", file_paths.len());
        DeleteOutcome {
            success: true,
            message: format!(
                "Successfully deleted {deleted_count} chunk(s) from {} file(s).",
                file_paths.len()
            ),
            deleted_count,
        }
    }

    /// Borrado explícito de una colección completa.
    pub async fn delete_collection(&self, name: &str) -> DeleteOutcome {
        match self.store.delete_collection(name).await {
            Ok(true) => DeleteOutcome {
                success: true,
                message: format!("Collection '{name}' deleted."),
                deleted_count: 0,
            },
            Ok(false) => DeleteOutcome {
                success: true,
                message: format!("Collection '{name}' does not exist."),
                deleted_count: 0,
            },
            Err(e) => delete_failure(e),
        }
    }
}

/// Conserva sólo las coincidencias con `distance < threshold` (estricto).
pub fn filter_by_relevance(matches: Vec<ScoredMatch>, threshold: f64) -> Vec<ScoredMatch> {
    matches
        .into_iter()
        .filter(|m| m.distance < threshold)
        .collect()
}

/// `1 - distance/2` redondeado a 2 decimales, sin recortar a [0, 1].
pub fn relevance_score(distance: f64) -> f64 {
    ((1.0 - distance / 2.0) * 100.0).round() / 100.0
}

/// Primeros `PREVIEW_CHARS` caracteres, con "..." si se recortó.
pub fn preview(content: &str) -> String {
    if content.chars().count() > PREVIEW_CHARS {
        let head: String = content.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        content.to_string()
    }
}

fn citation(m: &ScoredMatch) -> Citation {
    Citation {
        source: m.chunk.source().to_string(),
        content_preview: preview(&m.chunk.content),
        relevance_score: relevance_score(m.distance),
    }
}

fn index_failure(message: String) -> IndexOutcome {
    IndexOutcome {
        success: false,
        message,
        indexed_count: 0,
        files_processed: 0,
    }
}

fn delete_failure(e: RagError) -> DeleteOutcome {
    DeleteOutcome {
        success: false,
        message: format!("Error during deletion: {e}"),
        deleted_count: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use futures::StreamExt;

    use crate::local_store::LocalVectorStore;
    use crate::models::{Chunk, Document};
    use crate::prompt::{DOCUMENTS_HEADER, LIVE_DATA_HEADER, NO_CONTEXT};
    use crate::test_support::{FlakyEmbedder, HashEmbedder, MockLlm, MockStore};

    fn pipeline(store: Arc<MockStore>, llm: Arc<MockLlm>) -> RagPipeline {
        RagPipeline::new(store, llm, DocumentLoader::default(), RagSettings::default())
    }

    fn chunk(content: &str, source: &str) -> Chunk {
        let doc = Document::new(content, source);
        Chunk {
            id: format!("{source}#{content}"),
            content: doc.content,
            metadata: doc.metadata,
        }
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn filter_is_strictly_less_than() {
        let matches = vec![
            ScoredMatch { chunk: chunk("a", "/a"), distance: 0.99 },
            ScoredMatch { chunk: chunk("b", "/b"), distance: 1.0 },
            ScoredMatch { chunk: chunk("c", "/c"), distance: 1.01 },
        ];
        let kept = filter_by_relevance(matches, 1.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].chunk.content, "a");
    }

    #[test]
    fn relevance_score_is_not_clamped() {
        assert_eq!(relevance_score(0.0), 1.0);
        assert_eq!(relevance_score(2.0), 0.0);
        assert_eq!(relevance_score(3.0), -0.5);
        assert_eq!(relevance_score(0.3), 0.85);
        assert_eq!(relevance_score(0.123), 0.94);
    }

    #[test]
    fn preview_truncates_on_characters() {
        assert_eq!(preview("short"), "short");
        let exact = "é".repeat(PREVIEW_CHARS);
        assert_eq!(preview(&exact), exact);
        let long = "é".repeat(PREVIEW_CHARS + 1);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
    }

    #[tokio::test]
    async fn index_then_query_reports_counts_and_citation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "policy.txt", "Refunds are processed within 5 business days.");
        let store = Arc::new(MockStore::new().with_distances(&[0.3]));
        let llm = Arc::new(MockLlm::healthy("Within 5 business days."));
        let rag = pipeline(store.clone(), llm.clone());

        let indexed = rag
            .index_files(&IndexParams {
                file_paths: vec![path.clone()],
                ..IndexParams::default()
            })
            .await;
        assert!(indexed.success, "{}", indexed.message);
        assert_eq!(indexed.indexed_count, 1);
        assert_eq!(indexed.files_processed, 1);

        let result = rag.query(&QueryParams::new("How long do refunds take?")).await;
        assert!(!result.is_error());
        assert_eq!(result.answer, "Within 5 business days.");
        assert_eq!(result.documents_retrieved, 1);
        assert_eq!(result.documents_used, 1);
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].source, path);
        assert_eq!(result.sources[0].relevance_score, 0.85);

        let request = llm.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.model, "mistral");
        assert_eq!(request.system_prompt.as_deref(), Some(SYSTEM_PROMPT));
        assert!((request.temperature - 0.1).abs() < f32::EPSILON);
        assert!(request.prompt.contains("Refunds are processed"));
    }

    #[tokio::test]
    async fn unhealthy_backend_short_circuits_before_retrieval() {
        let store = Arc::new(MockStore::new());
        store.seed("documents", vec![chunk("x", "/x.txt")]);
        let llm = Arc::new(MockLlm::unhealthy());
        let rag = pipeline(store.clone(), llm.clone());

        let result = rag.query(&QueryParams::new("anything")).await;
        assert!(result.is_error());
        assert!(result.answer.contains("not available"));
        assert_eq!(store.search_calls.load(Ordering::SeqCst), 0);
        assert_eq!(llm.generate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unindexed_collection_is_knowledge_base_not_found() {
        let store = Arc::new(MockStore::new());
        let rag = pipeline(store.clone(), Arc::new(MockLlm::healthy("x")));

        let result = rag
            .query(&QueryParams {
                collection_name: Some("never_indexed".into()),
                ..QueryParams::new("q")
            })
            .await;
        assert!(result.is_error());
        assert!(result.answer.to_lowercase().contains("knowledge base not found"));
        assert!(result.error_message().unwrap().contains("never_indexed"));
        assert_eq!(store.search_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_positive_k_makes_no_backend_calls() {
        let store = Arc::new(MockStore::new());
        let llm = Arc::new(MockLlm::healthy("x"));
        let rag = pipeline(store.clone(), llm.clone());

        for k in [0, -3] {
            let result = rag
                .query(&QueryParams {
                    k: Some(k),
                    ..QueryParams::new("q")
                })
                .await;
            assert!(result.is_error());
            assert_eq!(result.failure.as_ref().unwrap().kind, FailureKind::InvalidRequest);
        }
        assert_eq!(llm.health_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.search_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn threshold_boundary_excludes_match_but_counts_retrieval() {
        let store = Arc::new(MockStore::new().with_distances(&[1.0]));
        store.seed("documents", vec![chunk("borderline", "/b.txt")]);
        let llm = Arc::new(MockLlm::healthy("I don't have that information available."));
        let rag = pipeline(store, llm.clone());

        let result = rag.query(&QueryParams::new("q")).await;
        assert!(!result.is_error());
        assert_eq!(result.documents_retrieved, 1);
        assert_eq!(result.documents_used, 0);
        assert!(result.sources.is_empty());
        assert!(llm.last_prompt().unwrap().contains(NO_CONTEXT));
    }

    #[tokio::test]
    async fn dynamic_context_precedes_documents_in_prompt() {
        let store = Arc::new(MockStore::new().with_distances(&[0.2]));
        store.seed("documents", vec![chunk("doc text", "/d.txt")]);
        let llm = Arc::new(MockLlm::healthy("ok"));
        let rag = pipeline(store, llm.clone());

        rag.query(&QueryParams {
            dynamic_context: Some("open_jobs: 2".into()),
            ..QueryParams::new("q")
        })
        .await;
        let prompt = llm.last_prompt().unwrap();
        assert!(prompt.find(LIVE_DATA_HEADER).unwrap() < prompt.find(DOCUMENTS_HEADER).unwrap());
    }

    #[tokio::test]
    async fn generation_failure_keeps_counts_and_hides_detail() {
        let store = Arc::new(MockStore::new().with_distances(&[0.1, 1.5]));
        store.seed("documents", vec![chunk("a", "/a"), chunk("b", "/b")]);
        let rag = pipeline(store, Arc::new(MockLlm::failing(404)));

        let result = rag.query(&QueryParams::new("q")).await;
        assert!(result.is_error());
        assert_eq!(result.answer, FailureKind::GenerationFailed.user_message());
        assert_eq!(result.documents_retrieved, 2);
        assert_eq!(result.documents_used, 1);
        assert!(result.error_message().unwrap().contains("404"));
        assert!(!result.answer.contains("404"));
    }

    #[tokio::test]
    async fn streaming_query_yields_sources_then_fragments() {
        let store = Arc::new(MockStore::new().with_distances(&[0.4]));
        store.seed("documents", vec![chunk("context", "/c.txt")]);
        let rag = pipeline(store, Arc::new(MockLlm::healthy("streamed answer here")));

        let answer = match rag.query_stream(&QueryParams::new("q")).await {
            Ok(answer) => answer,
            Err(result) => panic!("unexpected failure: {}", result.answer),
        };
        assert_eq!(answer.documents_retrieved, 1);
        assert_eq!(answer.sources[0].relevance_score, 0.8);
        let text: String = answer
            .fragments
            .map(|f| f.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(text, "streamed answer here");
    }

    #[tokio::test]
    async fn indexing_extends_existing_collection_without_recreating() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(&dir, "a.txt", "first file");
        let b = write_file(&dir, "b.txt", "second file");
        let store = Arc::new(MockStore::new());
        let rag = pipeline(store.clone(), Arc::new(MockLlm::healthy("x")));

        for path in [a, b] {
            let out = rag
                .index_files(&IndexParams {
                    file_paths: vec![path],
                    collection_name: Some("kb".into()),
                    ..IndexParams::default()
                })
                .await;
            assert!(out.success);
        }
        assert_eq!(store.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.chunks("kb").len(), 2);
    }

    #[tokio::test]
    async fn indexing_nothing_loadable_is_a_distinct_failure() {
        let rag = pipeline(Arc::new(MockStore::new()), Arc::new(MockLlm::healthy("x")));
        let out = rag
            .index_files(&IndexParams {
                file_paths: vec!["/definitely/not/here.txt".into()],
                ..IndexParams::default()
            })
            .await;
        assert!(!out.success);
        assert_eq!(out.message, "No documents could be loaded from the provided paths.");
        assert_eq!(out.indexed_count, 0);
    }

    #[tokio::test]
    async fn indexing_rejects_invalid_chunking() {
        let rag = pipeline(Arc::new(MockStore::new()), Arc::new(MockLlm::healthy("x")));
        let out = rag
            .index_files(&IndexParams {
                file_paths: vec!["/tmp/whatever.txt".into()],
                chunk_size: Some(100),
                chunk_overlap: Some(100),
                ..IndexParams::default()
            })
            .await;
        assert!(!out.success);
        assert!(out.message.contains("chunk_overlap"));
    }

    #[tokio::test]
    async fn partial_embedding_failure_is_reported_not_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_file(&dir, "good.txt", "fine content");
        let bad = write_file(&dir, "bad.txt", "poison content");
        let store = Arc::new(LocalVectorStore::new(
            dir.path().join("db"),
            Arc::new(FlakyEmbedder::failing_on("poison")),
            1,
        ));
        let rag = RagPipeline::new(
            store,
            Arc::new(MockLlm::healthy("x")),
            DocumentLoader::default(),
            RagSettings::default(),
        );

        let out = rag
            .index_files(&IndexParams {
                file_paths: vec![good, bad],
                ..IndexParams::default()
            })
            .await;
        assert!(!out.success);
        assert_eq!(out.indexed_count, 1);
        assert_eq!(out.files_processed, 2);
        assert!(out.message.contains("1 chunk(s) failed"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = Arc::new(MockStore::new());
        store.seed("documents", vec![chunk("a", "/a.txt"), chunk("b", "/a.txt"), chunk("c", "/c.txt")]);
        let rag = pipeline(store.clone(), Arc::new(MockLlm::healthy("x")));

        let first = rag.delete_documents(&["/a.txt".to_string()], None).await;
        assert!(first.success);
        assert_eq!(first.deleted_count, 2);

        let again = rag.delete_documents(&["/a.txt".to_string(), "/zzz".to_string()], None).await;
        assert!(again.success);
        assert_eq!(again.deleted_count, 0);

        let missing = rag.delete_documents(&["/a.txt".to_string()], Some("nope")).await;
        assert!(missing.success);
        assert_eq!(missing.deleted_count, 0);
        assert_eq!(store.chunks("documents").len(), 1);
    }

    #[tokio::test]
    async fn end_to_end_with_local_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "faq.md", "Office hours are nine to five on weekdays.");
        let db = dir.path().join("db");
        let new_rag = || {
            RagPipeline::new(
                Arc::new(LocalVectorStore::new(&db, Arc::new(HashEmbedder), 8)),
                Arc::new(MockLlm::healthy("Nine to five.")),
                DocumentLoader::default(),
                RagSettings::default(),
            )
        };

        let out = new_rag()
            .index_files(&IndexParams {
                file_paths: vec![path.clone()],
                ..IndexParams::default()
            })
            .await;
        assert!(out.success);

        let result = new_rag()
            .query(&QueryParams::new("Office hours are nine to five on weekdays."))
            .await;
        assert!(!result.is_error());
        assert_eq!(result.documents_used, 1);
        assert_eq!(result.sources[0].source, path);
        assert_eq!(result.sources[0].relevance_score, 1.0);
    }

    #[tokio::test]
    async fn reindexing_an_unchanged_file_adds_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "notes.txt", "Backups run every night at two.");
        let rag = RagPipeline::new(
            Arc::new(LocalVectorStore::new(dir.path().join("db"), Arc::new(HashEmbedder), 8)),
            Arc::new(MockLlm::healthy("At two.")),
            DocumentLoader::default(),
            RagSettings::default(),
        );
        let params = IndexParams {
            file_paths: vec![path],
            ..IndexParams::default()
        };

        assert_eq!(rag.index_files(&params).await.indexed_count, 1);
        let again = rag.index_files(&params).await;
        assert!(again.success);
        assert_eq!(again.indexed_count, 0);

        let result = rag.query(&QueryParams::new("When do backups run?")).await;
        assert_eq!(result.documents_retrieved, 1);
    }
}
