// Módulos de la aplicación
mod api;
mod app_state;
mod chunker;
mod config;
mod embeddings;
mod error;
mod ingest;
mod llm;
mod local_store;
mod models;
mod neo4j_client;
mod prompt;
mod rag;
mod vector_store;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{AppConfig, VectorBackend};
use crate::vector_store::VectorStore;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Embeddings y almacén vectorial
    let embedder = embeddings::from_config(&cfg)
        .map_err(|e| anyhow!("Error inicializando el proveedor de embeddings: {e}"))?;
    let store: Arc<dyn VectorStore> = match cfg.vector_backend {
        VectorBackend::Local => {
            info!("Almacén vectorial local en {}", cfg.persist_directory.display());
            Arc::new(local_store::LocalVectorStore::new(
                cfg.persist_directory.clone(),
                embedder,
                cfg.embedding_batch_size,
            ))
        }
        VectorBackend::Neo4j => {
            let neo4j = cfg
                .neo4j
                .as_ref()
                .ok_or_else(|| anyhow!("VECTOR_BACKEND=neo4j requiere NEO4J_URI/USER/PASSWORD"))?;
            let store = neo4j_client::Neo4jVectorStore::connect(
                neo4j,
                embedder,
                cfg.embedding_batch_size,
                cfg.embedding_dimensions,
            )
            .await
            .context("Error preparando Neo4j como almacén vectorial")?;
            Arc::new(store)
        }
    };

    // 4. Backend de generación
    let llm = llm::OllamaClient::from_config(&cfg)
        .map_err(|e| anyhow!("Error inicializando el cliente de generación: {e}"))?;
    info!(
        "Generación vía {} (modelo por defecto '{}')",
        cfg.ollama_base_url, cfg.rag.chat_model
    );

    // 5. Pipeline y estado compartido
    let pipeline = rag::RagPipeline::new(
        store,
        Arc::new(llm),
        ingest::DocumentLoader::default(),
        cfg.rag.clone(),
    );
    let app_state = AppState::new(pipeline);

    // 6. Router con CORS abierto y trazas HTTP
    let app = Router::new()
        .merge(api::create_router(app_state))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
