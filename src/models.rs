//! Modelos de dominio (metadatos del repositorio, árbol de ficheros y chat).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadatos de un repositorio público de GitHub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub description: String,
    pub stars: u64,
    pub forks: u64,
    pub language: String,
    pub updated_at: String,
    pub url: String,
    pub default_branch: String,
}

/// Un nodo del listado jerárquico del repositorio.
///
/// Invariante: el `path` es único dentro del árbol y los hijos de un
/// directorio tienen `path == padre.path + "/" + hijo.name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
}

impl FileNode {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}

/// Cuerpo de un fichero clave ya descargado y decodificado.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: u64,
}

/// Agregado inmutable que vive durante toda una sesión de chat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedRepository {
    pub repo: Repository,
    pub file_tree: Vec<FileNode>,
    pub key_files: Vec<FileContent>,
    pub total_files: u64,
    pub total_size: u64,
}

/// Rol de un turno del chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Un turno de la conversación. El contenido del turno del asistente es
/// mutable mientras su stream está activo e inmutable después.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Etapas ordenadas de una indexación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingStage {
    Fetching,
    Analyzing,
    Building,
    Complete,
}

/// Estado transitorio de una indexación en curso. Se descarta en cuanto la
/// sesión llega a la fase de chat.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingProgress {
    pub stage: IndexingStage,
    pub percentage: u8,
    pub message: String,
}

impl IndexingProgress {
    pub fn new(stage: IndexingStage, percentage: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percentage,
            message: message.into(),
        }
    }
}

/// Recorre el árbol completo y acumula el número de ficheros y su tamaño
/// total en bytes. Los directorios no cuentan.
pub fn calculate_repo_stats(file_tree: &[FileNode]) -> (u64, u64) {
    fn traverse(nodes: &[FileNode], total_files: &mut u64, total_size: &mut u64) {
        for node in nodes {
            if node.kind == NodeKind::File {
                *total_files += 1;
                *total_size += node.size.unwrap_or(0);
            } else if let Some(children) = &node.children {
                traverse(children, total_files, total_size);
            }
        }
    }

    let mut total_files = 0;
    let mut total_size = 0;
    traverse(file_tree, &mut total_files, &mut total_size);
    (total_files, total_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64) -> FileNode {
        FileNode {
            name: path.rsplit('/').next().unwrap().to_string(),
            path: path.to_string(),
            kind: NodeKind::File,
            size: Some(size),
            children: None,
        }
    }

    fn dir(path: &str, children: Vec<FileNode>) -> FileNode {
        FileNode {
            name: path.rsplit('/').next().unwrap().to_string(),
            path: path.to_string(),
            kind: NodeKind::Dir,
            size: None,
            children: Some(children),
        }
    }

    #[test]
    fn stats_cuentan_ficheros_anidados() {
        let tree = vec![dir(
            "src",
            vec![
                file("src/a.rs", 10),
                dir("src/inner", vec![file("src/inner/b.rs", 20)]),
                file("src/c.rs", 30),
            ],
        )];

        let (files, size) = calculate_repo_stats(&tree);
        assert_eq!(files, 3);
        assert_eq!(size, 60);
    }

    #[test]
    fn stats_ignoran_directorios_vacios() {
        let tree = vec![dir("docs", Vec::new())];
        assert_eq!(calculate_repo_stats(&tree), (0, 0));
    }
}
