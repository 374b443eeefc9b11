//! Taxonomía de errores del servicio RAG.
//!
//! Los módulos de dominio devuelven `crate::error::Result<T>`; sólo el arranque
//! (`main`, `config`, conexión a Neo4j) trabaja con `anyhow`.

use thiserror::Error;

/// Alias de resultado para las operaciones del pipeline.
pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    /// El backend de generación no responde al chequeo de salud.
    #[error("generation backend is unavailable: {0}")]
    BackendUnavailable(String),

    /// Fallo de conexión (o timeout) al llamar al backend de generación.
    #[error("could not reach the generation backend: {0}")]
    GenerationUnavailable(String),

    /// El backend respondió, pero con un estado no exitoso.
    #[error("generation backend returned HTTP {status}: {body}")]
    Generation { status: u16, body: String },

    #[error("collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("could not load '{path}': {reason}")]
    LoadFailure { path: String, reason: String },

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Parte de los chunks se indexó y parte no.
    #[error("partial index failure: {indexed} chunk(s) indexed, {failed} failed")]
    PartialIndexFailure { indexed: usize, failed: usize },

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RagError {
    pub fn load_failure(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::LoadFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn vector_store(message: impl std::fmt::Display) -> Self {
        Self::VectorStore(message.to_string())
    }

    pub fn embedding(message: impl std::fmt::Display) -> Self {
        Self::Embedding(message.to_string())
    }

    /// Traduce un error de `reqwest` hacia el backend de generación.
    /// Cualquier fallo de transporte (conexión, timeout, cuerpo cortado) cuenta
    /// como backend no disponible.
    pub fn from_generation_transport(err: reqwest::Error) -> Self {
        Self::GenerationUnavailable(err.to_string())
    }
}
