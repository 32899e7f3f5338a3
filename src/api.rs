use std::convert::Infallible;
use std::sync::Mutex;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::spawn;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    app_state::{AppState, IndexingStatus},
    indexer,
    models::{ChatMessage, Repository},
    session::{ChatSession, SessionError},
};

// --- Payloads de la API ---

#[derive(Deserialize)]
pub struct IndexPayload {
    url: String,
}

#[derive(Deserialize)]
pub struct ChatPayload {
    message: String,
}

/// Eventos que el handler de chat reenvía al cliente mientras la
/// transcripción va mutando.
enum ChatEvent {
    Token(String),
    Done,
    Error(String),
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/index", post(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/repository", get(repository_handler))
        .route("/api/messages", get(messages_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/clear-chat", post(clear_chat_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers ---

/// Lanza la indexación en segundo plano. Si tiene éxito, la sesión anterior
/// se sustituye entera; si falla, queda intacta y el error se publica en el
/// estado compartido.
#[axum::debug_handler]
async fn index_handler(
    State(state): State<AppState>,
    Json(payload): Json<IndexPayload>,
) -> Result<impl IntoResponse, ApiError> {
    {
        let mut status = state.status.lock().unwrap();
        if status.is_busy {
            return Err(api_error(
                StatusCode::CONFLICT,
                "Ya hay una indexación en curso.",
            ));
        }
        status.is_busy = true;
        status.error = None;
        status.progress = None;
    }

    let state = state.clone();
    spawn(async move {
        let result =
            indexer::index_repository(&state.github, &payload.url, state.status.clone()).await;

        match result {
            Ok(indexed) => {
                let session = ChatSession::new(indexed);
                info!(
                    "Sesión de chat {} sobre {}.",
                    session.id, session.repo.repo.full_name
                );
                install_session(&state.session, &state.status, session);
            }
            Err(err) => {
                error!("Error indexando el repositorio: {err}");
                let mut status = state.status.lock().unwrap();
                status.is_busy = false;
                status.error = Some(err.to_string());
                status.progress = None;
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

/// Sustituye la sesión y deja el estado de indexación limpio: una vez en la
/// fase de chat, el progreso ya no se publica.
fn install_session(
    session_slot: &Mutex<Option<ChatSession>>,
    status_slot: &Mutex<IndexingStatus>,
    session: ChatSession,
) {
    *session_slot.lock().unwrap() = Some(session);
    let mut status = status_slot.lock().unwrap();
    status.is_busy = false;
    status.progress = None;
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<IndexingStatus> {
    Json(state.status.lock().unwrap().clone())
}

#[axum::debug_handler]
async fn repository_handler(
    State(state): State<AppState>,
) -> Result<Json<Repository>, ApiError> {
    state
        .session
        .lock()
        .unwrap()
        .as_ref()
        .map(|s| Json(s.repo.repo.clone()))
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "No hay ningún repositorio indexado.",
            )
        })
}

#[axum::debug_handler]
async fn messages_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    state
        .session
        .lock()
        .unwrap()
        .as_ref()
        .map(|s| Json(s.messages().to_vec()))
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "No hay ningún repositorio indexado.",
            )
        })
}

/// Registra el turno del usuario, abre el stream del proveedor y reenvía
/// cada token al cliente como SSE a la vez que lo acumula en el turno del
/// asistente. Un segundo envío con un turno activo recibe 409.
#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatPayload>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (handle, history, repo) = {
        let mut guard = state.session.lock().unwrap();
        let session = guard.as_mut().ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "No hay ningún repositorio indexado.",
            )
        })?;

        let handle = session.submit(&payload.message).map_err(|err| match err {
            SessionError::Busy => api_error(StatusCode::CONFLICT, err.to_string()),
            _ => api_error(StatusCode::BAD_REQUEST, err.to_string()),
        })?;

        (handle, session.history_for(&handle), session.repo.clone())
    };

    let (tx, rx) = mpsc::unbounded_channel::<ChatEvent>();

    let state = state.clone();
    spawn(async move {
        let mut on_token = |token: &str| {
            if let Some(session) = state.session.lock().unwrap().as_mut() {
                session.append_token(&handle, token);
            }
            let _ = tx.send(ChatEvent::Token(token.to_string()));
        };

        let result = state
            .completions
            .complete(&history, &repo, &mut on_token)
            .await;

        match result {
            Ok(()) => {
                if let Some(session) = state.session.lock().unwrap().as_mut() {
                    session.settle(&handle);
                }
                let _ = tx.send(ChatEvent::Done);
            }
            Err(err) => {
                error!("Error generando la respuesta: {err}");
                if let Some(session) = state.session.lock().unwrap().as_mut() {
                    session.fail(&handle, &err.to_string());
                }
                let _ = tx.send(ChatEvent::Error(err.to_string()));
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| {
            let sse_event = match event {
                ChatEvent::Token(token) => Event::default()
                    .event("token")
                    .data(serde_json::to_string(&json!({ "token": token })).unwrap_or_default()),
                ChatEvent::Done => Event::default().event("done").data("{}"),
                ChatEvent::Error(message) => Event::default()
                    .event("error")
                    .data(serde_json::to_string(&json!({ "error": message })).unwrap_or_default()),
            };
            (Ok::<_, Infallible>(sse_event), rx)
        })
    });

    Ok(Sse::new(stream))
}

#[axum::debug_handler]
async fn clear_chat_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let mut guard = state.session.lock().unwrap();
    let session = guard.as_mut().ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "No hay ningún repositorio indexado.",
        )
    })?;

    session
        .clear()
        .map_err(|err| api_error(StatusCode::CONFLICT, err.to_string()))?;

    Ok(StatusCode::OK)
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        IndexedRepository, IndexingProgress, IndexingStage, Repository,
    };

    fn indexed_repo() -> IndexedRepository {
        IndexedRepository {
            repo: Repository {
                owner: "rust-lang".to_string(),
                name: "cargo".to_string(),
                full_name: "rust-lang/cargo".to_string(),
                description: "El gestor de paquetes de Rust".to_string(),
                stars: 1,
                forks: 1,
                language: "Rust".to_string(),
                updated_at: "2026-01-01T00:00:00Z".to_string(),
                url: "https://github.com/rust-lang/cargo".to_string(),
                default_branch: "master".to_string(),
            },
            file_tree: Vec::new(),
            key_files: Vec::new(),
            total_files: 0,
            total_size: 0,
        }
    }

    #[test]
    fn instalar_la_sesion_descarta_el_progreso() {
        let session_slot = Mutex::new(None);
        let status_slot = Mutex::new(IndexingStatus {
            is_busy: true,
            error: None,
            progress: Some(IndexingProgress::new(
                IndexingStage::Complete,
                100,
                "¡Repositorio indexado!",
            )),
        });

        install_session(&session_slot, &status_slot, ChatSession::new(indexed_repo()));

        let status = status_slot.lock().unwrap();
        assert!(!status.is_busy);
        assert!(status.progress.is_none());
        assert!(session_slot.lock().unwrap().is_some());
    }
}
