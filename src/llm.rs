//! Orquestación de completions en streaming sobre dos proveedores (OpenAI y
//! Anthropic), cada uno con su endpoint, cabeceras y esquema de eventos SSE.
//!
//! El proveedor se elige una sola vez al construir el `CompletionManager`,
//! por la credencial disponible; OpenAI tiene prioridad si hay ambas.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::config::AppConfig;
use crate::context::build_repository_context;
use crate::models::{ChatMessage, IndexedRepository, Role};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const MAX_TOKENS: u32 = 2000;
const OPENAI_TEMPERATURE: f32 = 0.7;

/// Fallos de una petición de completion. El evento malformado no aparece
/// aquí: se descarta con un aviso y el stream continúa.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("No hay ninguna credencial LLM configurada. Define OPENAI_API_KEY o ANTHROPIC_API_KEY.")]
    NoCredential,
    #[error("{0}")]
    Provider(String),
    #[error("Fallo leyendo el stream de respuesta: {0}")]
    Stream(String),
}

/// Mensaje saliente mínimo, común a ambos proveedores.
#[derive(Debug, Clone, Serialize)]
struct OutboundMessage {
    role: &'static str,
    content: String,
}

/// Variantes del proveedor, cada una con su credencial y su modelo.
#[derive(Debug, Clone)]
enum ProviderClient {
    OpenAI { api_key: String, model: String },
    Anthropic { api_key: String, model: String },
}

/// Gestor de completions. Sin estado mutable: cada `complete` es una
/// petición independiente.
#[derive(Debug, Clone)]
pub struct CompletionManager {
    client: reqwest::Client,
    provider: ProviderClient,
}

impl CompletionManager {
    /// Construye el manager a partir de la configuración. La ausencia de
    /// ambas credenciales se detecta aquí, en el arranque, no en la primera
    /// pregunta del usuario.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, CompletionError> {
        let provider = if let Some(key) = &cfg.openai_api_key {
            ProviderClient::OpenAI {
                api_key: key.clone(),
                model: cfg.openai_chat_model.clone(),
            }
        } else if let Some(key) = &cfg.anthropic_api_key {
            ProviderClient::Anthropic {
                api_key: key.clone(),
                model: cfg.anthropic_chat_model.clone(),
            }
        } else {
            return Err(CompletionError::NoCredential);
        };

        Ok(Self {
            client: reqwest::Client::new(),
            provider,
        })
    }

    /// Genera la respuesta a la conversación en streaming. Cada token
    /// decodificado se entrega a `on_token` en orden de llegada, de forma
    /// síncrona, antes de pedir el siguiente chunk al proveedor.
    pub async fn complete(
        &self,
        history: &[ChatMessage],
        repo: &IndexedRepository,
        on_token: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), CompletionError> {
        let context =
            build_repository_context(&repo.file_tree, &repo.key_files, repo.total_files);
        let system = compose_system_prompt(repo, &context);
        let messages = compose_history(history);

        match &self.provider {
            ProviderClient::OpenAI { api_key, model } => {
                self.stream_openai(api_key, model, &system, messages, on_token)
                    .await
            }
            ProviderClient::Anthropic { api_key, model } => {
                self.stream_anthropic(api_key, model, &system, messages, on_token)
                    .await
            }
        }
    }

    // ---------------------------------------------------------------------
    // Variante A: OpenAI
    // ---------------------------------------------------------------------

    async fn stream_openai(
        &self,
        api_key: &str,
        model: &str,
        system: &str,
        history: Vec<OutboundMessage>,
        on_token: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), CompletionError> {
        // OpenAI lleva el turno de sistema inline en la lista de mensajes.
        let mut messages = vec![OutboundMessage {
            role: "system",
            content: system.to_string(),
        }];
        messages.extend(history);

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(api_key)
            .json(&json!({
                "model": model,
                "messages": messages,
                "stream": true,
                "temperature": OPENAI_TEMPERATURE,
                "max_tokens": MAX_TOKENS,
            }))
            .send()
            .await
            .map_err(|e| CompletionError::Provider(format!("Fallo de red con el proveedor: {e}")))?;

        let response = check_provider_status(response).await?;
        relay_sse(response, extract_openai_token, on_token).await
    }

    // ---------------------------------------------------------------------
    // Variante B: Anthropic
    // ---------------------------------------------------------------------

    async fn stream_anthropic(
        &self,
        api_key: &str,
        model: &str,
        system: &str,
        history: Vec<OutboundMessage>,
        on_token: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), CompletionError> {
        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            // Anthropic separa el turno de sistema en su propio campo.
            .json(&json!({
                "model": model,
                "max_tokens": MAX_TOKENS,
                "system": system,
                "messages": history,
                "stream": true,
            }))
            .send()
            .await
            .map_err(|e| CompletionError::Provider(format!("Fallo de red con el proveedor: {e}")))?;

        let response = check_provider_status(response).await?;
        relay_sse(response, extract_anthropic_token, on_token).await
    }
}

/// Prompt de sistema: resumen del repositorio + contexto reducido +
/// instrucciones fijas.
fn compose_system_prompt(repo: &IndexedRepository, context: &str) -> String {
    format!(
        "You are an expert code analyst assistant. You have access to the following GitHub repository:\n\n\
         Repository: {}\n\
         Description: {}\n\
         Primary Language: {}\n\n\
         {}\n\n\
         Answer questions about this repository's code, structure, functionality, and implementation details. \
         When referencing code, use proper markdown formatting with syntax highlighting. \
         Be specific and reference actual files when possible.",
        repo.repo.full_name, repo.repo.description, repo.repo.language, context
    )
}

/// Proyecta el historial completo a pares rol/contenido.
fn compose_history(history: &[ChatMessage]) -> Vec<OutboundMessage> {
    history
        .iter()
        .map(|m| OutboundMessage {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content.clone(),
        })
        .collect()
}

/// Sobre un estado no-2xx, construye el error con el mensaje del payload de
/// error del proveedor si existe; si no, uno genérico. Sin reintentos.
async fn check_provider_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, CompletionError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| {
            body.get("error")?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("No se pudo generar la respuesta del modelo (HTTP {status})."));

    Err(CompletionError::Provider(message))
}

/// Consume el cuerpo de la respuesta chunk a chunk, re-ensambla las líneas
/// SSE y entrega cada token extraído al sink. El stream se libera al salir
/// en todos los caminos, incluido el error a mitad de lectura.
async fn relay_sse(
    response: reqwest::Response,
    extract: fn(&str) -> Option<String>,
    on_token: &mut (dyn FnMut(&str) + Send),
) -> Result<(), CompletionError> {
    let mut stream = response.bytes_stream();
    let mut lines = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| CompletionError::Stream(e.to_string()))?;
        for line in lines.push(&chunk) {
            if let Some(token) = extract(&line) {
                on_token(&token);
            }
        }
    }

    // Línea final sin salto de línea de cierre.
    if let Some(line) = lines.finish() {
        if let Some(token) = extract(&line) {
            on_token(&token);
        }
    }

    Ok(())
}

/// Re-ensambla líneas a partir de chunks arbitrarios: una línea partida por
/// un límite de chunk se retiene y se completa con el chunk siguiente.
#[derive(Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if matches!(line.last(), Some(b'\r')) {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

// --- Esquemas de los eventos de cada proveedor ---

#[derive(Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Deserialize, Default)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicEvent {
    #[serde(rename = "type")]
    kind: String,
    delta: Option<AnthropicDelta>,
}

#[derive(Deserialize)]
struct AnthropicDelta {
    text: Option<String>,
}

/// Evento OpenAI: payload JSON tras `data: `; el centinela `[DONE]` se
/// traga sin emitir token. Un JSON malformado se descarta con un aviso.
fn extract_openai_token(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data: ")?;
    if payload == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<OpenAiChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()?
            .delta
            .content
            .filter(|s| !s.is_empty()),
        Err(err) => {
            warn!("Evento OpenAI malformado, se descarta: {err}");
            None
        }
    }
}

/// Evento Anthropic: sólo `content_block_delta` lleva texto; el resto de
/// tipos se ignora sin error.
fn extract_anthropic_token(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data: ")?;

    match serde_json::from_str::<AnthropicEvent>(payload) {
        Ok(event) if event.kind == "content_block_delta" => {
            event.delta?.text.filter(|s| !s.is_empty())
        }
        Ok(_) => None,
        Err(err) => {
            warn!("Evento Anthropic malformado, se descarta: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Pasa los chunks por el re-ensamblado de líneas y el extractor, igual
    /// que hace `relay_sse` con el cuerpo real.
    fn decode_chunks(chunks: &[&[u8]], extract: fn(&str) -> Option<String>) -> Vec<String> {
        let mut lines = SseLineBuffer::default();
        let mut tokens = Vec::new();
        for chunk in chunks {
            for line in lines.push(chunk) {
                if let Some(token) = extract(&line) {
                    tokens.push(token);
                }
            }
        }
        if let Some(line) = lines.finish() {
            if let Some(token) = extract(&line) {
                tokens.push(token);
            }
        }
        tokens
    }

    #[test]
    fn openai_un_token_y_centinela_done() {
        let tokens = decode_chunks(
            &[b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n".as_slice()],
            extract_openai_token,
        );
        assert_eq!(tokens, vec!["Hi"]);
    }

    #[test]
    fn anthropic_un_token() {
        let tokens = decode_chunks(
            &[b"data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Yo\"}}\n\n".as_slice()],
            extract_anthropic_token,
        );
        assert_eq!(tokens, vec!["Yo"]);
    }

    #[test]
    fn anthropic_ignora_otros_tipos_de_evento() {
        let tokens = decode_chunks(
            &[
                b"data: {\"type\":\"message_start\",\"message\":{}}\n".as_slice(),
                b"data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"ok\"}}\n",
                b"data: {\"type\":\"message_stop\"}\n",
            ],
            extract_anthropic_token,
        );
        assert_eq!(tokens, vec!["ok"]);
    }

    #[test]
    fn varios_eventos_en_un_solo_chunk() {
        let tokens = decode_chunks(
            &[b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n".as_slice()],
            extract_openai_token,
        );
        assert_eq!(tokens, vec!["a", "b"]);
    }

    #[test]
    fn evento_partido_entre_dos_chunks() {
        // El límite de chunk cae en mitad del payload JSON: la línea
        // incompleta se retiene y se completa con el chunk siguiente.
        let tokens = decode_chunks(
            &[
                b"data: {\"choices\":[{\"delta\":{\"co".as_slice(),
                b"ntent\":\"Hola\"}}]}\n",
            ],
            extract_openai_token,
        );
        assert_eq!(tokens, vec!["Hola"]);
    }

    #[test]
    fn json_malformado_no_aborta_el_stream() {
        let tokens = decode_chunks(
            &[
                b"data: {esto no es json}\n".as_slice(),
                b"data: {\"choices\":[{\"delta\":{\"content\":\"sigue\"}}]}\n",
            ],
            extract_openai_token,
        );
        assert_eq!(tokens, vec!["sigue"]);
    }

    #[test]
    fn linea_final_sin_salto_de_linea() {
        let tokens = decode_chunks(
            &[b"data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"fin\"}}".as_slice()],
            extract_anthropic_token,
        );
        assert_eq!(tokens, vec!["fin"]);
    }

    #[test]
    fn delta_sin_contenido_no_emite_token() {
        let tokens = decode_chunks(
            &[b"data: {\"choices\":[{\"delta\":{}}]}\n".as_slice()],
            extract_openai_token,
        );
        assert!(tokens.is_empty());
    }

    #[test]
    fn delta_con_contenido_vacio_no_emite_token() {
        let tokens = decode_chunks(
            &[b"data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n".as_slice()],
            extract_openai_token,
        );
        assert!(tokens.is_empty());

        let tokens = decode_chunks(
            &[b"data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"\"}}\n".as_slice()],
            extract_anthropic_token,
        );
        assert!(tokens.is_empty());
    }

    #[test]
    fn historial_se_proyecta_a_rol_y_contenido() {
        let history = vec![
            ChatMessage {
                id: 1,
                role: Role::User,
                content: "hola".to_string(),
                timestamp: Utc::now(),
            },
            ChatMessage {
                id: 2,
                role: Role::Assistant,
                content: "buenas".to_string(),
                timestamp: Utc::now(),
            },
        ];

        let outbound = compose_history(&history);
        assert_eq!(outbound.len(), 2);
        assert_eq!(outbound[0].role, "user");
        assert_eq!(outbound[1].role, "assistant");
        assert_eq!(outbound[1].content, "buenas");
    }
}
