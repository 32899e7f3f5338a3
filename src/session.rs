//! Transcripción de la sesión de chat: turnos ordenados y el estado de cada
//! turno del asistente.
//!
//! Sólo puede haber un turno `pending`/`streaming` a la vez; un segundo
//! envío mientras tanto se rechaza, no se encola. El turno en curso se
//! referencia con un handle explícito en vez de re-derivar "el último
//! elemento" en cada token.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::models::{ChatMessage, IndexedRepository, Role};

/// Estados de un turno del asistente.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Placeholder añadido, sin contenido todavía.
    Pending,
    /// Llegan tokens; el contenido sólo crece por el final.
    Streaming,
    /// Stream terminado sin error; el contenido queda congelado.
    Settled,
    /// Fallo terminal; el contenido se sustituyó por la anotación de error.
    Errored,
}

/// Handle al turno del asistente en curso. Se obtiene en `submit` y es la
/// única vía para mutar ese turno. Lleva el id de la sesión que lo emitió:
/// los ids de mensaje se reinician en cada sesión, así que sin él un handle
/// de una sesión ya sustituida podría coincidir con un turno de la nueva.
#[derive(Debug, Clone, Copy)]
pub struct TurnHandle {
    session_id: Uuid,
    message_id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Ya hay una respuesta en curso. Espera a que termine.")]
    Busy,
    #[error("El mensaje está vacío.")]
    EmptyMessage,
    #[error("No se puede vaciar el chat mientras hay una respuesta en curso.")]
    ClearWhileStreaming,
}

/// Una sesión de chat sobre un repositorio ya indexado. Se sustituye entera
/// cuando el usuario indexa otro repositorio.
#[derive(Debug)]
pub struct ChatSession {
    pub id: Uuid,
    pub repo: IndexedRepository,
    messages: Vec<ChatMessage>,
    next_message_id: u64,
    /// Estado de cada turno del asistente, por id de mensaje.
    turn_states: HashMap<u64, TurnState>,
    /// Id del turno activo, si lo hay.
    in_flight: Option<u64>,
}

impl ChatSession {
    pub fn new(repo: IndexedRepository) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo,
            messages: Vec::new(),
            next_message_id: 1,
            turn_states: HashMap::new(),
            in_flight: None,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_generating(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn turn_state(&self, handle: &TurnHandle) -> Option<TurnState> {
        if handle.session_id != self.id {
            return None;
        }
        self.turn_states.get(&handle.message_id).copied()
    }

    fn push_message(&mut self, role: Role, content: String) -> u64 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        self.messages.push(ChatMessage {
            id,
            role,
            content,
            timestamp: Utc::now(),
        });
        id
    }

    fn is_in_flight(&self, handle: &TurnHandle) -> bool {
        handle.session_id == self.id && self.in_flight == Some(handle.message_id)
    }

    /// Añade el turno del usuario y el placeholder del asistente, y marca el
    /// placeholder como en curso. Rechaza envíos vacíos y envíos mientras
    /// otro turno sigue activo.
    pub fn submit(&mut self, content: &str) -> Result<TurnHandle, SessionError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if self.in_flight.is_some() {
            return Err(SessionError::Busy);
        }

        self.push_message(Role::User, content.to_string());
        let assistant_id = self.push_message(Role::Assistant, String::new());
        self.turn_states.insert(assistant_id, TurnState::Pending);
        self.in_flight = Some(assistant_id);

        Ok(TurnHandle {
            session_id: self.id,
            message_id: assistant_id,
        })
    }

    /// Historial que se envía al proveedor: todos los turnos anteriores al
    /// placeholder del asistente, incluido el nuevo turno del usuario.
    pub fn history_for(&self, handle: &TurnHandle) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .filter(|m| m.id < handle.message_id)
            .cloned()
            .collect()
    }

    /// Añade un token al final del turno en curso. El primer token pasa el
    /// turno de `pending` a `streaming`. Un handle caducado no hace nada.
    pub fn append_token(&mut self, handle: &TurnHandle, token: &str) {
        if !self.is_in_flight(handle) {
            return;
        }
        self.turn_states
            .insert(handle.message_id, TurnState::Streaming);

        if let Some(message) = self.messages.iter_mut().find(|m| m.id == handle.message_id) {
            message.content.push_str(token);
        }
    }

    /// Congela el turno en curso al terminar el stream sin error.
    pub fn settle(&mut self, handle: &TurnHandle) {
        if !self.is_in_flight(handle) {
            return;
        }
        self.turn_states.insert(handle.message_id, TurnState::Settled);
        self.in_flight = None;
    }

    /// Resuelve el turno en curso a su estado terminal de error: el
    /// contenido parcial que hubiera se sustituye entero por la anotación.
    pub fn fail(&mut self, handle: &TurnHandle, error_message: &str) {
        if !self.is_in_flight(handle) {
            return;
        }
        self.turn_states.insert(handle.message_id, TurnState::Errored);
        self.in_flight = None;

        if let Some(message) = self.messages.iter_mut().find(|m| m.id == handle.message_id) {
            message.content = format!("Error: {error_message}");
        }
    }

    /// Vacía la transcripción. No permitido mientras hay un turno activo.
    pub fn clear(&mut self) -> Result<(), SessionError> {
        if self.in_flight.is_some() {
            return Err(SessionError::ClearWhileStreaming);
        }
        self.messages.clear();
        self.turn_states.clear();
        Ok(())
    }
}
