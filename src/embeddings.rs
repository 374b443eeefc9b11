//! Proveedores de embeddings. El modelo en sí es externo: aquí sólo se habla
//! con él (Ollama por HTTP o OpenAI a través de Rig).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, EmbeddingProvider};
use crate::error::{RagError, Result};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Nombre del modelo; se guarda junto a cada colección.
    fn model_name(&self) -> &str;

    /// Un vector normalizado por texto, en el mismo orden.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f64>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::embedding("no se pudo generar embedding de la query"))
    }
}

/// Construye el proveedor configurado.
pub fn from_config(cfg: &AppConfig) -> Result<std::sync::Arc<dyn Embedder>> {
    Ok(match cfg.embedding_provider {
        EmbeddingProvider::Ollama => std::sync::Arc::new(OllamaEmbedder::new(
            &cfg.ollama_base_url,
            &cfg.embedding_model,
            cfg.generation_timeout,
        )?),
        EmbeddingProvider::OpenAI => std::sync::Arc::new(OpenAiEmbedder::new(&cfg.embedding_model)),
    })
}

/// Normaliza a norma L2 = 1. Un vector nulo se devuelve tal cual.
pub fn normalize(mut vector: Vec<f64>) -> Vec<f64> {
    let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

// ---------------------------------------------------------------------
// OLLAMA
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f64>,
}

pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(5)
            .build()
            .map_err(RagError::embedding)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let mut vectors = Vec::with_capacity(texts.len());

        // La API de Ollama embebe un texto por petición.
        for text in texts {
            let response = self
                .client
                .post(&url)
                .json(&EmbedRequest {
                    model: &self.model,
                    prompt: text,
                })
                .send()
                .await
                .map_err(|e| RagError::embedding(format!("petición de embedding fallida: {e}")))?;

            if !response.status().is_success() {
                return Err(RagError::embedding(format!(
                    "Ollama devolvió HTTP {} al generar embeddings",
                    response.status()
                )));
            }

            let body: EmbedResponse = response
                .json()
                .await
                .map_err(|e| RagError::embedding(format!("respuesta de embedding ilegible: {e}")))?;
            if body.embedding.is_empty() {
                return Err(RagError::embedding(format!(
                    "el modelo '{}' devolvió un embedding vacío",
                    self.model
                )));
            }
            vectors.push(normalize(body.embedding));
        }

        Ok(vectors)
    }
}

// ---------------------------------------------------------------------
// OPENAI (vía Rig)
// ---------------------------------------------------------------------

pub struct OpenAiEmbedder {
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        // Cliente OpenAI de Rig (lee OPENAI_API_KEY, validada al cargar la configuración)
        let client = openai::Client::from_env();
        let model_name = if self.model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let embeddings = embedding_model
            .embed_texts(texts.to_vec())
            .await
            .map_err(RagError::embedding)?;

        if embeddings.len() != texts.len() {
            return Err(RagError::embedding(format!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                texts.len()
            )));
        }

        Ok(embeddings.into_iter().map(|e| normalize(e.vec)).collect())
    }
}
