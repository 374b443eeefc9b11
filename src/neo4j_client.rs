//! Backend vectorial opcional sobre Neo4j.
//!
//! Modelo en el grafo:
//!   (:Collection {name, embedding_model, created_at})-[:HAS_CHUNK]->
//!   (:Chunk {id, collection, source, text, chunk_index, metadata, embedding})
//!
//! La búsqueda usa el índice vectorial `chunkEmbeddingIndex` (coseno). Como el
//! índice es global, se piden más candidatos de los necesarios y se filtran
//! por colección.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use neo4rs::{query, Graph};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Neo4jConfig;
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::models::{Chunk, Metadata, ScoredMatch};
use crate::vector_store::{
    add_outcome, embed_in_batches, ensure_positive_k, top_k, Collection, VectorStore,
};

const INDEX_NAME: &str = "chunkEmbeddingIndex";
/// Candidatos por resultado pedido al índice antes de filtrar por colección.
const OVERFETCH_FACTOR: usize = 10;
const MIN_CANDIDATES: usize = 100;

pub async fn connect_from_config(cfg: &Neo4jConfig) -> anyhow::Result<Graph> {
    let url = Url::parse(&cfg.uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.user, &cfg.password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Constraints de unicidad para colecciones y chunks.
pub async fn ensure_schema(graph: &Graph) -> anyhow::Result<()> {
    let statements = [
        "CREATE CONSTRAINT collection_name IF NOT EXISTS
         FOR (c:Collection)
         REQUIRE c.name IS UNIQUE",
        "CREATE CONSTRAINT chunk_id IF NOT EXISTS
         FOR (c:Chunk)
         REQUIRE c.id IS UNIQUE",
        "CREATE INDEX chunk_source IF NOT EXISTS
         FOR (c:Chunk)
         ON (c.collection, c.source)",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado.");
    Ok(())
}

/// Garantiza que el índice vectorial sobre `:Chunk(embedding)` exista.
pub async fn ensure_chunk_vector_index(graph: &Graph, dimensions: usize) -> anyhow::Result<()> {
    let mut cursor = graph
        .execute(
            query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                .param("name", INDEX_NAME),
        )
        .await?;

    if cursor.next().await?.is_some() {
        info!("Índice vectorial '{INDEX_NAME}' ya existe.");
        return Ok(());
    }

    let cypher = format!(
        "\
CREATE VECTOR INDEX {INDEX_NAME} IF NOT EXISTS
FOR (c:Chunk)
ON (c.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: 'cosine'
  }}
}}"
    );

    graph.run(query(&cypher)).await?;
    info!("Índice vectorial '{INDEX_NAME}' creado ({dimensions} dimensiones).");
    Ok(())
}

/// Neo4j devuelve `s = (1 + cos) / 2`; la distancia coseno es `1 - cos = 2(1 - s)`.
fn score_to_distance(score: f64) -> f64 {
    (2.0 * (1.0 - score)).clamp(0.0, 2.0)
}

fn candidates_for(k: usize) -> usize {
    k.saturating_mul(OVERFETCH_FACTOR).max(MIN_CANDIDATES)
}

pub struct Neo4jVectorStore {
    graph: Arc<Graph>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl Neo4jVectorStore {
    /// Conecta, asegura el esquema y el índice vectorial.
    pub async fn connect(
        cfg: &Neo4jConfig,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        dimensions: usize,
    ) -> anyhow::Result<Self> {
        let graph = connect_from_config(cfg).await?;
        ensure_schema(&graph).await?;
        ensure_chunk_vector_index(&graph, dimensions).await?;
        Ok(Self {
            graph: Arc::new(graph),
            embedder,
            batch_size: batch_size.max(1),
        })
    }

    async fn existing_ids(&self, ids: Vec<String>) -> Result<Vec<String>> {
        let mut cursor = self
            .graph
            .execute(
                query("MATCH (c:Chunk) WHERE c.id IN $ids RETURN c.id AS id").param("ids", ids),
            )
            .await
            .map_err(RagError::vector_store)?;

        let mut found = Vec::new();
        while let Some(row) = cursor.next().await.map_err(RagError::vector_store)? {
            if let Some(id) = row.get::<String>("id") {
                found.push(id);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl VectorStore for Neo4jVectorStore {
    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let mut cursor = self
            .graph
            .execute(query("MATCH (c:Collection {name: $name}) RETURN c.name AS name").param("name", name))
            .await
            .map_err(RagError::vector_store)?;
        Ok(cursor.next().await.map_err(RagError::vector_store)?.is_some())
    }

    async fn open_collection(&self, name: &str) -> Result<Collection> {
        let mut cursor = self
            .graph
            .execute(
                query("MATCH (c:Collection {name: $name}) RETURN c.embedding_model AS model")
                    .param("name", name),
            )
            .await
            .map_err(RagError::vector_store)?;

        let row = cursor
            .next()
            .await
            .map_err(RagError::vector_store)?
            .ok_or_else(|| RagError::CollectionNotFound(name.to_string()))?;
        let embedding_model: String = row.get("model").unwrap_or_default();
        if embedding_model != self.embedder.model_name() {
            warn!(
                "La colección '{name}' se creó con '{embedding_model}' pero el modelo actual es '{}'",
                self.embedder.model_name()
            );
        }
        Ok(Collection {
            name: name.to_string(),
            embedding_model,
        })
    }

    async fn create_collection(&self, name: &str) -> Result<Collection> {
        if name.trim().is_empty() {
            return Err(RagError::InvalidArgument("empty collection name".to_string()));
        }
        self.graph
            .run(
                query(
                    "MERGE (c:Collection {name: $name})
                     ON CREATE SET c.embedding_model = $model, c.created_at = datetime($created_at)",
                )
                .param("name", name)
                .param("model", self.embedder.model_name())
                .param("created_at", Utc::now().to_rfc3339()),
            )
            .await
            .map_err(RagError::vector_store)?;
        info!("Colección '{name}' asegurada en Neo4j");
        self.open_collection(name).await
    }

    async fn add(&self, collection: &Collection, chunks: &[Chunk]) -> Result<usize> {
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let existing = self.existing_ids(ids).await?;
        let fresh: Vec<Chunk> = chunks
            .iter()
            .filter(|c| !existing.contains(&c.id))
            .cloned()
            .collect();
        if fresh.len() < chunks.len() {
            warn!(
                "{} chunk(s) ya existían en Neo4j, se omiten",
                chunks.len() - fresh.len()
            );
        }

        let (embedded, failed) =
            embed_in_batches(self.embedder.as_ref(), &fresh, self.batch_size).await;

        let tx = self.graph.start_txn().await.map_err(RagError::vector_store)?;
        for (chunk, embedding) in &embedded {
            let metadata = serde_json::to_string(&chunk.metadata)?;
            tx.run(
                query(
                    "MATCH (col:Collection {name: $collection})
                     MERGE (c:Chunk {id: $id})
                     SET c.collection = $collection, c.source = $source, c.text = $text,
                         c.chunk_index = $chunk_index, c.metadata = $metadata,
                         c.embedding = $embedding
                     MERGE (col)-[:HAS_CHUNK]->(c)",
                )
                .param("collection", collection.name.clone())
                .param("id", chunk.id.clone())
                .param("source", chunk.source().to_string())
                .param("text", chunk.content.clone())
                .param("chunk_index", chunk.chunk_index().unwrap_or(0) as i64)
                .param("metadata", metadata)
                .param("embedding", embedding.clone()),
            )
            .await
            .map_err(RagError::vector_store)?;
        }
        tx.commit().await.map_err(RagError::vector_store)?;

        debug!("Neo4j: +{} chunks en '{}'", embedded.len(), collection.name);
        add_outcome(embedded.len(), failed)
    }

    async fn search(
        &self,
        collection: &Collection,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<ScoredMatch>> {
        ensure_positive_k(k)?;
        let query_vec = self.embedder.embed_query(query_text).await?;

        let mut cursor = self
            .graph
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $candidates, $embedding)
                     YIELD node, score
                     WHERE node.collection = $collection
                     RETURN node.id AS id, node.text AS text, node.metadata AS metadata, score
                     ORDER BY score DESC
                     LIMIT $k",
                )
                .param("index_name", INDEX_NAME)
                .param("candidates", candidates_for(k) as i64)
                .param("embedding", query_vec)
                .param("collection", collection.name.clone())
                .param("k", k as i64),
            )
            .await
            .map_err(RagError::vector_store)?;

        let mut matches = Vec::new();
        while let Some(row) = cursor.next().await.map_err(RagError::vector_store)? {
            let id: String = row
                .get("id")
                .ok_or_else(|| RagError::vector_store("Falta campo 'id' en resultado de Neo4j"))?;
            let text: String = row
                .get("text")
                .ok_or_else(|| RagError::vector_store("Falta campo 'text' en resultado de Neo4j"))?;
            let score: f64 = row
                .get("score")
                .ok_or_else(|| RagError::vector_store("Falta campo 'score' en resultado de Neo4j"))?;
            let metadata: Metadata = match row.get::<String>("metadata") {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Metadata::new(),
            };

            matches.push(ScoredMatch {
                chunk: Chunk {
                    id,
                    content: text,
                    metadata,
                },
                distance: score_to_distance(score),
            });
        }

        Ok(top_k(matches, k))
    }

    async fn delete_by_source(&self, collection: &Collection, source: &str) -> Result<usize> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (:Collection {name: $collection})-[:HAS_CHUNK]->(c:Chunk {source: $source})
                     WITH collect(c) AS chunks
                     FOREACH (c IN chunks | DETACH DELETE c)
                     RETURN size(chunks) AS deleted",
                )
                .param("collection", collection.name.clone())
                .param("source", source),
            )
            .await
            .map_err(RagError::vector_store)?;

        let deleted = match cursor.next().await.map_err(RagError::vector_store)? {
            Some(row) => row.get::<i64>("deleted").unwrap_or(0),
            None => 0,
        };
        Ok(deleted.max(0) as usize)
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        if !self.collection_exists(name).await? {
            return Ok(false);
        }
        self.graph
            .run(
                query(
                    "MATCH (col:Collection {name: $name})
                     OPTIONAL MATCH (col)-[:HAS_CHUNK]->(c:Chunk)
                     DETACH DELETE c, col",
                )
                .param("name", name),
            )
            .await
            .map_err(RagError::vector_store)?;
        info!("Colección '{name}' eliminada de Neo4j");
        Ok(true)
    }
}
