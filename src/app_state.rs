use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::{
    config::AppConfig, github::GithubClient, llm::CompletionManager, models::IndexingProgress,
    session::ChatSession,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub github: GithubClient,
    pub completions: CompletionManager,
    pub status: Arc<Mutex<IndexingStatus>>,
    pub session: Arc<Mutex<Option<ChatSession>>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

/// Estado observable de la indexación en curso. El progreso se descarta en
/// cuanto la sesión llega a la fase de chat.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IndexingStatus {
    pub is_busy: bool,
    pub error: Option<String>,
    pub progress: Option<IndexingProgress>,
}
