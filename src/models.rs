//! Modelos de dominio: documentos cargados, chunks, coincidencias puntuadas
//! y los resultados que devuelve el pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadatos libres de un documento (`source`, `page`, `sheet`, `row`, ...).
pub type Metadata = Map<String, Value>;

/// Valor usado cuando un chunk no tiene `source`.
pub const UNKNOWN_SOURCE: &str = "Unknown";

/// Unidad de contenido recién extraída de un fichero. No se muta tras crearse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    pub metadata: Metadata,
}

impl Document {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), Value::String(source.into()));
        Self {
            content: content.into(),
            metadata,
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn source(&self) -> &str {
        source_of(&self.metadata)
    }
}

/// Trozo de un `Document`: hereda sus metadatos y añade `chunk_index`
/// (y `start_index`, desplazamiento en caracteres dentro del padre).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
}

impl Chunk {
    pub fn source(&self) -> &str {
        source_of(&self.metadata)
    }

    pub fn chunk_index(&self) -> Option<u64> {
        self.metadata.get("chunk_index").and_then(Value::as_u64)
    }
}

fn source_of(metadata: &Metadata) -> &str {
    metadata
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_SOURCE)
}

/// Chunk recuperado junto a su distancia (menor = más parecido).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMatch {
    pub chunk: Chunk,
    pub distance: f64,
}

/// Cita devuelta al cliente.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub content_preview: String,
    pub relevance_score: f64,
}

/// Motivo por el que una consulta terminó antes de tiempo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidRequest,
    BackendUnavailable,
    CollectionNotFound,
    RetrievalFailed,
    GenerationFailed,
}

impl FailureKind {
    /// Mensaje estable para el usuario final. Nunca incluye detalles internos.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::InvalidRequest => "Error: Invalid query parameters. 'k' must be a positive integer.",
            Self::BackendUnavailable => {
                "Error: LLM service is not available. Please ensure the generation backend is running."
            }
            Self::CollectionNotFound => {
                "Error: Knowledge base not found. Please ensure documents are indexed."
            }
            Self::RetrievalFailed => "Error: Could not search the knowledge base.",
            Self::GenerationFailed => "Error: Failed to generate response from LLM.",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryFailure {
    pub kind: FailureKind,
    /// Detalle diagnóstico (texto del error subyacente).
    pub detail: Option<String>,
}

/// Resultado transitorio de una consulta RAG.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub answer: String,
    pub sources: Vec<Citation>,
    pub documents_retrieved: usize,
    pub documents_used: usize,
    pub failure: Option<QueryFailure>,
}

impl QueryResult {
    pub fn failed(kind: FailureKind, detail: Option<String>) -> Self {
        Self {
            answer: kind.user_message().to_string(),
            sources: Vec::new(),
            documents_retrieved: 0,
            documents_used: 0,
            failure: Some(QueryFailure { kind, detail }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.failure.is_some()
    }

    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().and_then(|f| f.detail.clone())
    }
}

/// Resumen de una operación de indexación.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexOutcome {
    pub success: bool,
    pub message: String,
    pub indexed_count: usize,
    pub files_processed: usize,
}

/// Resumen de un borrado por `source`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteOutcome {
    pub success: bool,
    pub message: String,
    pub deleted_count: usize,
}
