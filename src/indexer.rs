//! Indexación de un repositorio: validación de la referencia, metadatos,
//! árbol de ficheros, ficheros clave y estadísticas, publicando el progreso
//! en checkpoints fijos (10/20/40/60/80/95/100).
//!
//! Cada paso espera al anterior; sólo la descarga de ficheros clave corre
//! internamente como un lote de peticiones independientes.

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::app_state::IndexingStatus;
use crate::github::{parse_repo_url, GithubClient, GithubError};
use crate::models::{
    calculate_repo_stats, IndexedRepository, IndexingProgress, IndexingStage,
};

fn set_progress(
    status: &Arc<Mutex<IndexingStatus>>,
    stage: IndexingStage,
    percentage: u8,
    message: &str,
) {
    let mut status = status.lock().unwrap();
    status.progress = Some(IndexingProgress::new(stage, percentage, message));
}

/// Ejecuta una indexación completa. El resultado es el agregado inmutable
/// que vivirá durante toda la sesión de chat; cualquier fallo aborta la
/// indexación y deja la sesión anterior intacta.
pub async fn index_repository(
    github: &GithubClient,
    url: &str,
    status: Arc<Mutex<IndexingStatus>>,
) -> Result<IndexedRepository, GithubError> {
    set_progress(
        &status,
        IndexingStage::Fetching,
        10,
        "Validando la URL del repositorio...",
    );
    let (owner, repo_name) = parse_repo_url(url).ok_or(GithubError::InvalidUrl)?;

    set_progress(
        &status,
        IndexingStage::Fetching,
        20,
        "Obteniendo la información del repositorio...",
    );
    let repo = github.fetch_repository(&owner, &repo_name).await?;

    set_progress(
        &status,
        IndexingStage::Fetching,
        40,
        "Cargando la estructura de ficheros...",
    );
    let file_tree = github
        .fetch_file_tree(&owner, &repo_name, &repo.default_branch)
        .await?;

    set_progress(
        &status,
        IndexingStage::Analyzing,
        60,
        "Analizando los ficheros clave...",
    );
    let key_files = github.fetch_key_files(&owner, &repo_name, &file_tree).await;

    set_progress(
        &status,
        IndexingStage::Analyzing,
        80,
        "Calculando las estadísticas del repositorio...",
    );
    let (total_files, total_size) = calculate_repo_stats(&file_tree);

    set_progress(
        &status,
        IndexingStage::Building,
        95,
        "Construyendo el contexto...",
    );
    let indexed = IndexedRepository {
        repo,
        file_tree,
        key_files,
        total_files,
        total_size,
    };

    set_progress(
        &status,
        IndexingStage::Complete,
        100,
        "¡Repositorio indexado!",
    );
    info!(
        "Indexado {} ({} ficheros, {} bytes, {} ficheros clave).",
        indexed.repo.full_name,
        indexed.total_files,
        indexed.total_size,
        indexed.key_files.len()
    );

    Ok(indexed)
}
