//! Gateway hacia el servicio de generación de texto (Ollama).
//!
//! - `health()` usa un cliente con timeout corto y nunca falla.
//! - `generate()` / `generate_stream()` usan el timeout largo de generación.
//! - Fallos de transporte → `GenerationUnavailable`; estado HTTP no exitoso →
//!   `Generation { status, body }`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{RagError, Result};

/// Secuencia perezosa y finita de fragmentos de texto, en orden de generación.
/// Soltarla antes de tiempo libera la conexión subyacente.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// `true` si el backend responde dentro del timeout corto.
    async fn health(&self) -> bool;

    /// Modelos disponibles; vacío ante cualquier fallo.
    async fn list_models(&self) -> Vec<String>;

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream>;
}

// ---------------------------------------------------------------------
// OLLAMA
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct GeneratePayload<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

pub struct OllamaClient {
    base_url: String,
    health_client: Client,
    client: Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, health_timeout: Duration, generation_timeout: Duration) -> Result<Self> {
        let build = |timeout: Duration| {
            Client::builder()
                .timeout(timeout)
                .pool_max_idle_per_host(5)
                .build()
                .map_err(|e| RagError::InvalidConfiguration(format!("cliente HTTP: {e}")))
        };
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            health_client: build(health_timeout)?,
            client: build(generation_timeout)?,
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Self::new(&cfg.ollama_base_url, cfg.health_timeout, cfg.generation_timeout)
    }

    async fn fetch_tags(&self) -> Result<reqwest::Response> {
        let response = self
            .health_client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(RagError::from_generation_transport)?;
        check_status(response).await
    }

    async fn model_names(&self) -> Result<Vec<String>> {
        let tags: TagsResponse = self
            .fetch_tags()
            .await?
            .json()
            .await
            .map_err(RagError::from_generation_transport)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn post_generate(&self, request: &GenerationRequest, stream: bool) -> Result<reqwest::Response> {
        let payload = GeneratePayload {
            model: &request.model,
            prompt: &request.prompt,
            stream,
            system: request.system_prompt.as_deref(),
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(RagError::from_generation_transport)?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RagError::Generation {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl LlmBackend for OllamaClient {
    async fn health(&self) -> bool {
        match self.fetch_tags().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Backend de generación no disponible: {e}");
                false
            }
        }
    }

    async fn list_models(&self) -> Vec<String> {
        match self.model_names().await {
            Ok(names) => names,
            Err(e) => {
                debug!("No se pudieron listar los modelos: {e}");
                Vec::new()
            }
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        info!("Generando respuesta con el modelo '{}'", request.model);
        let response = self.post_generate(request, false).await?;
        let body: GenerateResponse = response
            .json()
            .await
            .map_err(RagError::from_generation_transport)?;
        Ok(body.response)
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream> {
        info!("Generando respuesta en streaming con el modelo '{}'", request.model);
        let response = self.post_generate(request, true).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(fragments(bytes))
    }
}

// ---------------------------------------------------------------------
// NDJSON (una línea JSON por fragmento)
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Acumula bytes y devuelve las líneas completas ya decodificadas.
#[derive(Default)]
struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamLine>> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(parsed) = parse_line(&line)? {
                lines.push(parsed);
            }
        }
        Ok(lines)
    }

    /// Última línea sin `\n` final, si la hay.
    fn finish(&mut self) -> Result<Vec<StreamLine>> {
        let rest = std::mem::take(&mut self.buffer);
        Ok(parse_line(&rest)?.into_iter().collect())
    }
}

fn parse_line(raw: &[u8]) -> Result<Option<StreamLine>> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| RagError::GenerationUnavailable(format!("línea de streaming inválida: {e}")))
}

struct StreamState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl StreamState {
    fn absorb(&mut self, lines: Result<Vec<StreamLine>>) {
        let lines = match lines {
            Ok(lines) => lines,
            Err(e) => {
                self.pending.push_back(Err(e));
                self.finished = true;
                return;
            }
        };
        for line in lines {
            if let Some(error) = line.error {
                self.pending.push_back(Err(RagError::Generation { status: 200, body: error }));
                self.finished = true;
                return;
            }
            if !line.response.is_empty() {
                self.pending.push_back(Ok(line.response));
            }
            if line.done {
                self.finished = true;
                return;
            }
        }
    }
}

/// Convierte un flujo de bytes NDJSON en fragmentos de texto. Termina en la
/// línea con `done: true`, al agotarse el cuerpo o en el primer error.
fn fragments(bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> FragmentStream {
    let state = StreamState {
        bytes,
        decoder: NdjsonDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(bytes)) => {
                    let lines = st.decoder.push(&bytes);
                    st.absorb(lines);
                }
                Some(Err(e)) => {
                    st.pending.push_back(Err(RagError::from_generation_transport(e)));
                    st.finished = true;
                }
                None => {
                    let lines = st.decoder.finish();
                    st.absorb(lines);
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "Context:\nx\n\nQuestion: y\n\nAnswer:".into(),
            model: "mistral".into(),
            system_prompt: Some("be grounded".into()),
            temperature: 0.1,
            max_tokens: 1024,
        }
    }

    #[test]
    fn payload_carries_options_and_system_prompt() {
        let req = request();
        let payload = GeneratePayload {
            model: &req.model,
            prompt: &req.prompt,
            stream: false,
            system: req.system_prompt.as_deref(),
            options: GenerateOptions {
                temperature: req.temperature,
                num_predict: req.max_tokens,
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["model"], "mistral");
        assert_eq!(json["stream"], false);
        assert_eq!(json["system"], "be grounded");
        assert_eq!(json["options"]["num_predict"], 1024);

        let no_system = GeneratePayload { system: None, ..payload };
        let json = serde_json::to_value(&no_system).unwrap();
        assert!(json.get("system").is_none());
    }

    #[test]
    fn decoder_handles_lines_split_across_chunks() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(br#"{"response":"Hel"#).unwrap().is_empty());
        let lines = decoder
            .push(b"lo\",\"done\":false}\n{\"response\":\" world\",\"done\":false}\n{\"resp")
            .unwrap();
        let texts: Vec<&str> = lines.iter().map(|l| l.response.as_str()).collect();
        assert_eq!(texts, vec!["Hello", " world"]);

        let tail = decoder.push(br#"onse":"","done":true}"#).unwrap();
        assert!(tail.is_empty());
        let last = decoder.finish().unwrap();
        assert_eq!(last.len(), 1);
        assert!(last[0].done);
    }

    fn byte_stream(parts: Vec<&'static str>) -> BoxStream<'static, reqwest::Result<Vec<u8>>> {
        stream::iter(parts.into_iter().map(|p| Ok(p.as_bytes().to_vec()))).boxed()
    }

    #[tokio::test]
    async fn fragments_stop_at_done_marker() {
        let body = byte_stream(vec![
            "{\"response\":\"Hola\",\"done\":false}\n",
            "{\"response\":\", mundo\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n",
            "{\"response\":\"ignored\",\"done\":false}\n",
        ]);
        let out: Vec<String> = fragments(body).map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["Hola".to_string(), ", mundo".to_string()]);
    }

    #[tokio::test]
    async fn fragments_surface_backend_errors_and_end() {
        let body = byte_stream(vec![
            "{\"response\":\"a\",\"done\":false}\n",
            "{\"error\":\"model crashed\"}\n",
            "{\"response\":\"b\",\"done\":false}\n",
        ]);
        let out: Vec<Result<String>> = fragments(body).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), "a");
        assert!(matches!(out[1], Err(RagError::Generation { .. })));
    }

    /// Se activa cuando el cuerpo HTTP (simulado) se libera.
    struct ReleaseFlag(Arc<AtomicBool>);

    impl Drop for ReleaseFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dropping_fragments_early_releases_the_body() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = ReleaseFlag(released.clone());
        let body = byte_stream(vec![
            "{\"response\":\"1\",\"done\":false}\n",
            "{\"response\":\"2\",\"done\":false}\n",
        ])
        .map(move |part| {
            let _held = &flag;
            part
        })
        .boxed();

        let mut s = fragments(body);
        assert_eq!(s.next().await.unwrap().unwrap(), "1");
        assert!(!released.load(Ordering::SeqCst));
        drop(s);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unreachable_backend_is_unhealthy_and_generation_unavailable() {
        let client = OllamaClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(300),
            Duration::from_millis(300),
        )
        .unwrap();
        assert!(!client.health().await);
        assert!(client.list_models().await.is_empty());
        assert!(matches!(
            client.generate(&request()).await,
            Err(RagError::GenerationUnavailable(_))
        ));
        assert!(matches!(
            client.generate_stream(&request()).await,
            Err(RagError::GenerationUnavailable(_))
        ));
    }
}
