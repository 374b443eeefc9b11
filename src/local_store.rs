//! Almacén vectorial en disco: una carpeta por colección bajo
//! `persist_directory`, con un `collection.json` que guarda el manifiesto y los
//! registros (id, texto, metadatos, embedding).
//!
//! Las escrituras de una misma colección se serializan con su `RwLock` y se
//! persisten de forma atómica (fichero temporal + rename). Las búsquedas sólo
//! toman el lock de lectura.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::models::{Chunk, Metadata, ScoredMatch};
use crate::vector_store::{
    add_outcome, cosine_distance, embed_in_batches, ensure_positive_k, top_k, Collection,
    VectorStore,
};

const COLLECTION_FILE: &str = "collection.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    content: String,
    metadata: Metadata,
    embedding: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionData {
    name: String,
    embedding_model: String,
    created_at: DateTime<Utc>,
    records: Vec<StoredRecord>,
    /// Marca una colección borrada mientras alguien aún tenía su `Arc`.
    #[serde(skip)]
    dropped: bool,
}

impl CollectionData {
    fn ensure_live(&self) -> Result<()> {
        if self.dropped {
            return Err(RagError::CollectionNotFound(self.name.clone()));
        }
        Ok(())
    }

    fn handle(&self) -> Collection {
        Collection {
            name: self.name.clone(),
            embedding_model: self.embedding_model.clone(),
        }
    }
}

type SharedCollection = Arc<RwLock<CollectionData>>;

pub struct LocalVectorStore {
    root: PathBuf,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    open: RwLock<HashMap<String, SharedCollection>>,
}

impl LocalVectorStore {
    pub fn new(root: impl Into<PathBuf>, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            root: root.into(),
            embedder,
            batch_size: batch_size.max(1),
            open: RwLock::new(HashMap::new()),
        }
    }

    fn collection_dir(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// Devuelve la colección en memoria, cargándola de disco si hace falta.
    async fn load(&self, name: &str) -> Result<SharedCollection> {
        if let Some(found) = self.open.read().await.get(name) {
            return Ok(found.clone());
        }

        let file = self.collection_dir(name)?.join(COLLECTION_FILE);
        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RagError::CollectionNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let data: CollectionData = serde_json::from_slice(&bytes)?;
        if data.embedding_model != self.embedder.model_name() {
            warn!(
                "La colección '{name}' se creó con '{}' pero el modelo actual es '{}'",
                data.embedding_model,
                self.embedder.model_name()
            );
        }
        debug!("Colección '{name}' cargada de disco ({} chunks)", data.records.len());

        let mut open = self.open.write().await;
        // Otra tarea pudo cargarla mientras leíamos.
        let shared = open
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(data)))
            .clone();
        Ok(shared)
    }

    async fn persist(&self, data: &CollectionData) -> Result<()> {
        let dir = self.collection_dir(&data.name)?;
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec(data)?;
        write_atomically(&dir.join(COLLECTION_FILE), &bytes).await
    }
}

/// Nombres de colección: `[A-Za-z0-9_.-]`, sin `..`.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RagError::InvalidArgument(format!(
            "invalid collection name '{name}'"
        )))
    }
}

async fn write_atomically(target: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = target.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, target).await?;
    Ok(())
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn collection_exists(&self, name: &str) -> Result<bool> {
        if self.open.read().await.contains_key(name) {
            return Ok(true);
        }
        let file = self.collection_dir(name)?.join(COLLECTION_FILE);
        Ok(tokio::fs::try_exists(&file).await?)
    }

    async fn open_collection(&self, name: &str) -> Result<Collection> {
        let shared = self.load(name).await?;
        let data = shared.read().await;
        Ok(data.handle())
    }

    async fn create_collection(&self, name: &str) -> Result<Collection> {
        validate_name(name)?;
        match self.load(name).await {
            Ok(existing) => return Ok(existing.read().await.handle()),
            Err(RagError::CollectionNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut open = self.open.write().await;
        if let Some(existing) = open.get(name) {
            return Ok(existing.read().await.handle());
        }
        let data = CollectionData {
            name: name.to_string(),
            embedding_model: self.embedder.model_name().to_string(),
            created_at: Utc::now(),
            records: Vec::new(),
            dropped: false,
        };
        self.persist(&data).await?;
        let handle = data.handle();
        open.insert(name.to_string(), Arc::new(RwLock::new(data)));
        info!("Colección '{name}' creada en {}", self.root.display());
        Ok(handle)
    }

    async fn add(&self, collection: &Collection, chunks: &[Chunk]) -> Result<usize> {
        let shared = self.load(&collection.name).await?;

        // Los embeddings se calculan fuera del lock de escritura.
        let (embedded, failed) =
            embed_in_batches(self.embedder.as_ref(), chunks, self.batch_size).await;

        let mut data = shared.write().await;
        data.ensure_live()?;

        // Se trabaja sobre una copia; la memoria sólo cambia si el disco acepta la escritura.
        let mut staged = data.clone();
        let mut indexed = 0;
        for (chunk, embedding) in embedded {
            if staged.records.iter().any(|r| r.id == chunk.id) {
                debug!("Chunk {} ya existe en '{}', se omite", chunk.id, collection.name);
                continue;
            }
            staged.records.push(StoredRecord {
                id: chunk.id,
                content: chunk.content,
                metadata: chunk.metadata,
                embedding,
            });
            indexed += 1;
        }
        if indexed > 0 {
            self.persist(&staged).await?;
            *data = staged;
        }
        debug!(
            "Colección '{}': +{indexed} chunks ({} en total)",
            collection.name,
            data.records.len()
        );

        add_outcome(indexed, failed)
    }

    async fn search(
        &self,
        collection: &Collection,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredMatch>> {
        ensure_positive_k(k)?;
        let shared = self.load(&collection.name).await?;
        let query_vec = self.embedder.embed_query(query).await?;

        let data = shared.read().await;
        data.ensure_live()?;
        let scored = data
            .records
            .iter()
            .map(|record| ScoredMatch {
                chunk: Chunk {
                    id: record.id.clone(),
                    content: record.content.clone(),
                    metadata: record.metadata.clone(),
                },
                distance: cosine_distance(&record.embedding, &query_vec),
            })
            .collect();

        Ok(top_k(scored, k))
    }

    async fn delete_by_source(&self, collection: &Collection, source: &str) -> Result<usize> {
        let shared = self.load(&collection.name).await?;
        let mut data = shared.write().await;
        data.ensure_live()?;

        let mut staged = data.clone();
        staged.records.retain(|r| {
            r.metadata.get("source").and_then(|v| v.as_str()) != Some(source)
        });
        let deleted = data.records.len() - staged.records.len();
        if deleted > 0 {
            self.persist(&staged).await?;
            *data = staged;
        }
        Ok(deleted)
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        let dir = self.collection_dir(name)?;
        let mut open = self.open.write().await;
        // Espera a las escrituras en curso y las invalida antes de borrar la carpeta.
        let evicted = open.remove(name);
        let _guard = match &evicted {
            Some(shared) => {
                let mut data = shared.write().await;
                data.dropped = true;
                Some(data)
            }
            None => None,
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Colección '{name}' eliminada");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
