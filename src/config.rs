//! Carga y gestión de configuración de la aplicación (servidor, embeddings,
//! backend vectorial, LLM y parámetros por defecto del pipeline RAG).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::error::RagError;

#[derive(Clone, Debug, PartialEq)]
pub enum EmbeddingProvider {
    Ollama,
    OpenAI,
}

impl EmbeddingProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            other => Err(anyhow!("Proveedor de embeddings no soportado: {other}")),
        }
    }
}

/// Dónde viven las colecciones.
#[derive(Clone, Debug, PartialEq)]
pub enum VectorBackend {
    /// Directorio local (`persist_directory/<colección>/`).
    Local,
    /// Neo4j con índice vectorial sobre `:Chunk(embedding)`.
    Neo4j,
}

impl VectorBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "neo4j" => Ok(Self::Neo4j),
            other => Err(anyhow!("Backend vectorial no soportado: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Valores por defecto del pipeline. Se inyectan explícitamente en
/// `RagPipeline::new`; cada petición puede sobreescribirlos.
#[derive(Clone, Debug, PartialEq)]
pub struct RagSettings {
    pub default_collection: String,
    pub top_k: usize,
    /// Distancia máxima (exclusiva) para considerar relevante un chunk.
    pub threshold: f64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub chat_model: String,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            default_collection: "documents".to_string(),
            top_k: 4,
            threshold: 1.0,
            chunk_size: 1000,
            chunk_overlap: 200,
            temperature: 0.1,
            max_tokens: 1024,
            chat_model: "mistral".to_string(),
        }
    }
}

impl RagSettings {
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_chunking(self.chunk_size, self.chunk_overlap)?;
        if self.top_k == 0 {
            return Err(RagError::InvalidConfiguration(
                "top_k must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// `chunk_overlap` debe ser estrictamente menor que `chunk_size`.
pub fn validate_chunking(chunk_size: usize, chunk_overlap: usize) -> crate::error::Result<()> {
    if chunk_size == 0 {
        return Err(RagError::InvalidConfiguration(
            "chunk_size must be greater than zero".to_string(),
        ));
    }
    if chunk_overlap >= chunk_size {
        return Err(RagError::InvalidConfiguration(format!(
            "chunk_overlap ({chunk_overlap}) must be less than chunk_size ({chunk_size})"
        )));
    }
    Ok(())
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub persist_directory: PathBuf,
    pub vector_backend: VectorBackend,
    pub neo4j: Option<Neo4jConfig>,

    pub embedding_provider: EmbeddingProvider,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_batch_size: usize,

    pub ollama_base_url: String,
    pub health_timeout: Duration,
    pub generation_timeout: Duration,

    pub rag: RagSettings,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let persist_directory = PathBuf::from(
            env::var("PERSIST_DIRECTORY").unwrap_or_else(|_| "./vector_db".to_string()),
        );

        let vector_backend = VectorBackend::from_str(
            &env::var("VECTOR_BACKEND").unwrap_or_else(|_| "local".to_string()),
        )?;
        let neo4j = match vector_backend {
            VectorBackend::Neo4j => Some(Neo4jConfig {
                uri: env::var("NEO4J_URI").map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?,
                user: env::var("NEO4J_USER")
                    .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?,
                password: env::var("NEO4J_PASSWORD")
                    .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?,
            }),
            VectorBackend::Local => None,
        };

        let embedding_provider = EmbeddingProvider::from_str(
            &env::var("EMBEDDING_PROVIDER").unwrap_or_else(|_| "ollama".to_string()),
        )?;
        if embedding_provider == EmbeddingProvider::OpenAI && env::var("OPENAI_API_KEY").is_err() {
            return Err(anyhow!("EMBEDDING_PROVIDER=openai requiere OPENAI_API_KEY"));
        }
        let embedding_model =
            env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "all-minilm".to_string());

        let defaults = RagSettings::default();
        let rag = RagSettings {
            default_collection: env::var("DEFAULT_COLLECTION")
                .unwrap_or(defaults.default_collection),
            top_k: env_parse("RAG_TOP_K", defaults.top_k)?,
            threshold: env_parse("RAG_THRESHOLD", defaults.threshold)?,
            chunk_size: env_parse("RAG_CHUNK_SIZE", defaults.chunk_size)?,
            chunk_overlap: env_parse("RAG_CHUNK_OVERLAP", defaults.chunk_overlap)?,
            temperature: env_parse("RAG_TEMPERATURE", defaults.temperature)?,
            max_tokens: env_parse("LLM_MAX_TOKENS", defaults.max_tokens)?,
            chat_model: env::var("LLM_CHAT_MODEL").unwrap_or(defaults.chat_model),
        };
        rag.validate()
            .map_err(|e| anyhow!("Parámetros RAG por defecto inválidos: {e}"))?;

        Ok(Self {
            server_addr,
            persist_directory,
            vector_backend,
            neo4j,
            embedding_provider,
            embedding_model,
            embedding_dimensions: env_parse("EMBEDDING_DIMENSIONS", 384)?,
            embedding_batch_size: env_parse("EMBEDDING_BATCH_SIZE", 32usize)?.max(1),
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            health_timeout: Duration::from_secs(env_parse("LLM_HEALTH_TIMEOUT_SECS", 5)?),
            generation_timeout: Duration::from_secs(env_parse(
                "LLM_GENERATION_TIMEOUT_SECS",
                120,
            )?),
            rag,
        })
    }
}

/// Lee una variable numérica; si no existe usa `default`, si no parsea falla.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Valor inválido para {key}: '{raw}'")),
        Err(_) => Ok(default),
    }
}
