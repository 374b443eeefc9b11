//! Contrato con el almacén vectorial externo.
//!
//! Las colecciones se abren o se crean explícitamente (`collection_exists` +
//! `open_collection` / `create_collection`); nunca se borran de forma
//! implícita. Las distancias son distancias coseno en [0, 2], menor = mejor.

use async_trait::async_trait;

use crate::error::{RagError, Result};
use crate::models::{Chunk, ScoredMatch};

/// Identidad de una colección abierta.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub name: String,
    /// Modelo de embeddings con el que se creó.
    pub embedding_model: String,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Abre una colección existente; `CollectionNotFound` si no existe.
    async fn open_collection(&self, name: &str) -> Result<Collection>;

    /// Crea una colección vacía. Si ya existe devuelve la existente.
    async fn create_collection(&self, name: &str) -> Result<Collection>;

    /// Garantiza que la colección exista y la devuelve.
    async fn open_or_create(&self, name: &str) -> Result<Collection> {
        if self.collection_exists(name).await? {
            self.open_collection(name).await
        } else {
            self.create_collection(name).await
        }
    }

    /// Embebe y añade los chunks. Devuelve cuántos se añadieron. Los ids ya
    /// presentes se omiten. Si algún lote no se pudo embeber, los demás se
    /// guardan igualmente y se devuelve `PartialIndexFailure`.
    async fn add(&self, collection: &Collection, chunks: &[Chunk]) -> Result<usize>;

    /// Hasta `k` coincidencias ordenadas por distancia ascendente.
    async fn search(&self, collection: &Collection, query: &str, k: usize)
        -> Result<Vec<ScoredMatch>>;

    /// Borra los chunks cuyo `source` coincide. 0 si no hay ninguno.
    async fn delete_by_source(&self, collection: &Collection, source: &str) -> Result<usize>;

    /// Borrado explícito de una colección completa. `false` si no existía.
    async fn delete_collection(&self, name: &str) -> Result<bool>;
}

pub fn ensure_positive_k(k: usize) -> Result<()> {
    if k == 0 {
        return Err(RagError::InvalidArgument("k must be greater than zero".to_string()));
    }
    Ok(())
}

/// Distancia coseno `1 - cos(a, b)`. Vectores de distinta dimensión o nulos
/// quedan a distancia máxima.
pub fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 2.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    (1.0 - dot / (norm_a * norm_b)).clamp(0.0, 2.0)
}

/// Ordena por distancia ascendente y se queda con las `k` primeras.
pub fn top_k(mut matches: Vec<ScoredMatch>, k: usize) -> Vec<ScoredMatch> {
    matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    matches.truncate(k);
    matches
}

/// Reparte `chunks` en lotes, los embebe y devuelve los que salieron bien
/// junto a cuántos fallaron.
pub async fn embed_in_batches(
    embedder: &dyn crate::embeddings::Embedder,
    chunks: &[Chunk],
    batch_size: usize,
) -> (Vec<(Chunk, Vec<f64>)>, usize) {
    let mut embedded = Vec::with_capacity(chunks.len());
    let mut failed = 0;

    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        match embedder.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                embedded.extend(batch.iter().cloned().zip(vectors));
            }
            Ok(vectors) => {
                tracing::warn!(
                    "El proveedor devolvió {} embeddings para un lote de {}",
                    vectors.len(),
                    batch.len()
                );
                failed += batch.len();
            }
            Err(e) => {
                tracing::warn!("Lote de {} chunks sin embedding: {e}", batch.len());
                failed += batch.len();
            }
        }
    }

    (embedded, failed)
}

/// Convierte el recuento final de `add` en el resultado del contrato.
pub fn add_outcome(indexed: usize, failed: usize) -> Result<usize> {
    if failed > 0 {
        Err(RagError::PartialIndexFailure { indexed, failed })
    } else {
        Ok(indexed)
    }
}
