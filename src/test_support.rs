//! Dobles de prueba compartidos por los tests de varios módulos.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::embeddings::{normalize, Embedder};
use crate::error::{RagError, Result};
use crate::llm::{FragmentStream, GenerationRequest, LlmBackend};
use crate::models::{Chunk, ScoredMatch};
use crate::vector_store::{ensure_positive_k, Collection, VectorStore};

/// Embedding determinista: bolsa de palabras con hashing en 64 dimensiones.
#[derive(Default)]
pub struct HashEmbedder;

const HASH_DIMS: usize = 64;

impl HashEmbedder {
    fn vector(text: &str) -> Vec<f64> {
        let mut v = vec![0.0; HASH_DIMS];
        for word in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % HASH_DIMS as u64) as usize] += 1.0;
        }
        normalize(v)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Falla cualquier lote que contenga un texto con `marker`.
pub struct FlakyEmbedder {
    marker: String,
}

impl FlakyEmbedder {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        if texts.iter().any(|t| t.contains(&self.marker)) {
            return Err(RagError::embedding("provider rejected the batch"));
        }
        HashEmbedder.embed_batch(texts).await
    }
}

/// Backend de generación simulado con contadores de llamadas.
pub struct MockLlm {
    healthy: bool,
    answer: std::result::Result<String, u16>,
    fragments: Vec<String>,
    pub health_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub last_request: Mutex<Option<GenerationRequest>>,
}

impl MockLlm {
    pub fn healthy(answer: &str) -> Self {
        Self {
            healthy: true,
            answer: Ok(answer.to_string()),
            fragments: answer.split_inclusive(' ').map(str::to_string).collect(),
            health_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::healthy("")
        }
    }

    /// Sano, pero toda generación devuelve HTTP `status`.
    pub fn failing(status: u16) -> Self {
        Self {
            answer: Err(status),
            ..Self::healthy("")
        }
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_request
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.prompt.clone())
    }

    fn record(&self, request: &GenerationRequest) -> Result<()> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        match &self.answer {
            Ok(_) => Ok(()),
            Err(status) => Err(RagError::Generation {
                status: *status,
                body: "model not found".to_string(),
            }),
        }
    }
}

#[async_trait]
impl LlmBackend for MockLlm {
    async fn health(&self) -> bool {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.healthy
    }

    async fn list_models(&self) -> Vec<String> {
        if self.healthy {
            vec!["mistral".to_string()]
        } else {
            Vec::new()
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.record(request)?;
        Ok(self.answer.clone().unwrap_or_default())
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream> {
        self.record(request)?;
        let items: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        Ok(stream::iter(items).boxed())
    }
}

/// Almacén en memoria. Cada búsqueda devuelve los chunks guardados con una
/// distancia fija, para controlar el filtrado desde el test.
pub struct MockStore {
    collections: Mutex<HashMap<String, Vec<Chunk>>>,
    distances: Mutex<Vec<f64>>,
    pub search_calls: AtomicUsize,
    pub add_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            distances: Mutex::new(vec![0.3]),
            search_calls: AtomicUsize::new(0),
            add_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Distancia del i-ésimo resultado; el último valor se repite.
    pub fn with_distances(self, distances: &[f64]) -> Self {
        *self.distances.lock().unwrap() = distances.to_vec();
        self
    }

    pub fn seed(&self, collection: &str, chunks: Vec<Chunk>) {
        self.collections
            .lock()
            .unwrap()
            .insert(collection.to_string(), chunks);
    }

    pub fn chunks(&self, collection: &str) -> Vec<Chunk> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

fn handle(name: &str) -> Collection {
    Collection {
        name: name.to_string(),
        embedding_model: "hash-embedder".to_string(),
    }
}

#[async_trait]
impl VectorStore for MockStore {
    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.collections.lock().unwrap().contains_key(name))
    }

    async fn open_collection(&self, name: &str) -> Result<Collection> {
        if self.collections.lock().unwrap().contains_key(name) {
            Ok(handle(name))
        } else {
            Err(RagError::CollectionNotFound(name.to_string()))
        }
    }

    async fn create_collection(&self, name: &str) -> Result<Collection> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.collections
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(handle(name))
    }

    async fn add(&self, collection: &Collection, chunks: &[Chunk]) -> Result<usize> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let mut all = self.collections.lock().unwrap();
        let stored = all
            .get_mut(&collection.name)
            .ok_or_else(|| RagError::CollectionNotFound(collection.name.clone()))?;
        let mut added = 0;
        for chunk in chunks {
            if !stored.iter().any(|c| c.id == chunk.id) {
                stored.push(chunk.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn search(
        &self,
        collection: &Collection,
        _query: &str,
        k: usize,
    ) -> Result<Vec<ScoredMatch>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        ensure_positive_k(k)?;
        let distances = self.distances.lock().unwrap().clone();
        let last = distances.last().copied().unwrap_or(0.0);
        Ok(self
            .chunks(&collection.name)
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(i, chunk)| ScoredMatch {
                chunk,
                distance: distances.get(i).copied().unwrap_or(last),
            })
            .collect())
    }

    async fn delete_by_source(&self, collection: &Collection, source: &str) -> Result<usize> {
        let mut all = self.collections.lock().unwrap();
        let Some(stored) = all.get_mut(&collection.name) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|c| c.source() != source);
        Ok(before - stored.len())
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        Ok(self.collections.lock().unwrap().remove(name).is_some())
    }
}
