//! Cliente de la API de GitHub: metadatos del repositorio, árbol de ficheros
//! recursivo y descarga de los ficheros clave.

use std::collections::HashMap;

use base64::Engine as _;
use futures::future::join_all;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::models::{FileContent, FileNode, NodeKind, Repository};

/// Nombres de fichero que se consideran "clave" para el contexto del modelo.
const KEY_FILE_NAMES: &[&str] = &[
    "README.md",
    "package.json",
    "tsconfig.json",
    "vite.config.ts",
    "vite.config.js",
    "next.config.js",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
];

/// Tamaño máximo (bytes) de un fichero clave descargable.
const MAX_KEY_FILE_SIZE: u64 = 50_000;
/// Número máximo de ficheros clave por indexación.
const MAX_KEY_FILES: usize = 10;
/// Profundidad máxima a la que se buscan ficheros clave.
const MAX_KEY_FILE_DEPTH: usize = 3;

/// Fallos del origen de datos, cada uno con su mensaje para el usuario.
#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("URL de GitHub no válida. Introduce la URL de un repositorio.")]
    InvalidUrl,
    #[error("Repositorio no encontrado. Revisa la URL e inténtalo de nuevo.")]
    NotFound,
    #[error("Límite de peticiones de la API de GitHub superado. Inténtalo más tarde o configura un token.")]
    RateLimited,
    #[error("El repositorio es privado. Usa un repositorio público o proporciona autenticación.")]
    Unauthorized,
    #[error("{0}")]
    Fetch(String),
}

/// Valida una referencia a repositorio. Acepta URLs `github.com/owner/repo`
/// (con o sin esquema) y el atajo `owner/repo`; descarta un `.git` final.
pub fn parse_repo_url(input: &str) -> Option<(String, String)> {
    let trimmed = input.trim();

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let url = Url::parse(trimmed).ok()?;
        if !url.host_str()?.ends_with("github.com") {
            return None;
        }
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        let owner = segments.next()?.to_string();
        let repo = segments.next()?.trim_end_matches(".git").to_string();
        return Some((owner, repo));
    }

    if let Some(idx) = trimmed.find("github.com/") {
        let rest = &trimmed[idx + "github.com/".len()..];
        let mut segments = rest.split('/').filter(|s| !s.is_empty());
        let owner = segments.next()?.to_string();
        let repo = segments.next()?.trim_end_matches(".git").to_string();
        return Some((owner, repo));
    }

    // Atajo owner/repo: exactamente dos segmentos.
    let mut segments = trimmed.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty() => Some((
            owner.to_string(),
            repo.trim_end_matches(".git").to_string(),
        )),
        _ => None,
    }
}

// --- Respuestas crudas de la API ---

#[derive(Deserialize)]
struct RepoOwnerResponse {
    login: String,
}

#[derive(Deserialize)]
struct RepoResponse {
    owner: RepoOwnerResponse,
    name: String,
    full_name: String,
    description: Option<String>,
    stargazers_count: u64,
    forks_count: u64,
    language: Option<String>,
    updated_at: String,
    html_url: String,
    default_branch: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    size: Option<u64>,
}

#[derive(Deserialize)]
struct ContentsResponse {
    content: Option<String>,
}

/// Cliente con el token opcional ya aplicado a todas las peticiones.
#[derive(Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: cfg.github_api_base.clone(),
            token: cfg.github_token.clone(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", "repochat");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Obtiene los metadatos del repositorio, distinguiendo los fallos
    /// que el usuario puede corregir (no existe, privado, rate limit).
    pub async fn fetch_repository(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Repository, GithubError> {
        let response = self
            .get(&format!("/repos/{owner}/{repo}"))
            .send()
            .await
            .map_err(|e| GithubError::Fetch(format!("Fallo de red consultando GitHub: {e}")))?;

        match response.status().as_u16() {
            404 => return Err(GithubError::NotFound),
            403 => return Err(GithubError::RateLimited),
            401 => return Err(GithubError::Unauthorized),
            s if s >= 400 => {
                return Err(GithubError::Fetch(
                    "No se pudo obtener la información del repositorio.".to_string(),
                ))
            }
            _ => {}
        }

        let data: RepoResponse = response.json().await.map_err(|e| {
            GithubError::Fetch(format!("Respuesta de GitHub no válida: {e}"))
        })?;

        Ok(Repository {
            owner: data.owner.login,
            name: data.name,
            full_name: data.full_name,
            description: data
                .description
                .unwrap_or_else(|| "Sin descripción disponible".to_string()),
            stars: data.stargazers_count,
            forks: data.forks_count,
            language: data.language.unwrap_or_else(|| "Desconocido".to_string()),
            updated_at: data.updated_at,
            url: data.html_url,
            default_branch: data.default_branch,
        })
    }

    /// Descarga el listado recursivo de la rama indicada y lo convierte en
    /// un bosque de `FileNode`.
    pub async fn fetch_file_tree(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<FileNode>, GithubError> {
        let response = self
            .get(&format!("/repos/{owner}/{repo}/git/trees/{branch}?recursive=1"))
            .send()
            .await
            .map_err(|e| GithubError::Fetch(format!("Fallo de red consultando GitHub: {e}")))?;

        if !response.status().is_success() {
            return Err(GithubError::Fetch(
                "No se pudo obtener el árbol de ficheros del repositorio.".to_string(),
            ));
        }

        let data: TreeResponse = response.json().await.map_err(|e| {
            GithubError::Fetch(format!("Respuesta de GitHub no válida: {e}"))
        })?;

        if data.truncated {
            warn!("El repositorio es muy grande; el árbol de ficheros puede estar incompleto.");
        }

        Ok(build_tree(data.tree))
    }

    /// Descarga y decodifica el cuerpo de un fichero (contents API, base64).
    pub async fn fetch_file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<String, GithubError> {
        let response = self
            .get(&format!("/repos/{owner}/{repo}/contents/{path}"))
            .send()
            .await
            .map_err(|e| GithubError::Fetch(format!("Fallo de red consultando GitHub: {e}")))?;

        if !response.status().is_success() {
            return Err(GithubError::Fetch(format!(
                "No se pudo obtener el fichero: {path}"
            )));
        }

        let data: ContentsResponse = response.json().await.map_err(|e| {
            GithubError::Fetch(format!("Respuesta de GitHub no válida: {e}"))
        })?;

        let Some(encoded) = data.content else {
            return Ok(String::new());
        };

        let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| GithubError::Fetch(format!("Contenido base64 no válido en {path}: {e}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Selecciona los ficheros clave del árbol (allowlist + techo de tamaño)
    /// y los descarga en paralelo. Un fallo individual se omite con un aviso,
    /// nunca aborta la indexación.
    pub async fn fetch_key_files(
        &self,
        owner: &str,
        repo: &str,
        file_tree: &[FileNode],
    ) -> Vec<FileContent> {
        let candidates = select_key_files(file_tree);

        let fetches = candidates.into_iter().map(|node| async move {
            match self.fetch_file_content(owner, repo, &node.path).await {
                Ok(content) => Some(FileContent {
                    path: node.path,
                    content,
                    size: node.size.unwrap_or(0),
                }),
                Err(err) => {
                    warn!("No se pudo descargar el fichero clave {}: {err}", node.path);
                    None
                }
            }
        });

        let key_files: Vec<FileContent> = join_all(fetches).await.into_iter().flatten().collect();
        info!("Descargados {} ficheros clave.", key_files.len());
        key_files
    }
}

/// Reconstruye el bosque a partir del listado plano del git tree. El orden
/// de hijos respeta el orden del listado; un hijo cuyo padre no aparece en
/// el listado se descarta.
fn build_tree(items: Vec<TreeItem>) -> Vec<FileNode> {
    let mut nodes: HashMap<String, FileNode> = HashMap::new();
    let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
    let mut roots: Vec<String> = Vec::new();

    for item in items {
        let name = item
            .path
            .rsplit('/')
            .next()
            .unwrap_or(item.path.as_str())
            .to_string();
        let node = FileNode {
            name,
            path: item.path.clone(),
            kind: if item.kind == "tree" {
                NodeKind::Dir
            } else {
                NodeKind::File
            },
            size: item.size,
            children: None,
        };

        match item.path.rsplit_once('/') {
            Some((parent, _)) => {
                if nodes.contains_key(parent) {
                    children_of
                        .entry(parent.to_string())
                        .or_default()
                        .push(item.path.clone());
                }
            }
            None => roots.push(item.path.clone()),
        }
        nodes.insert(item.path, node);
    }

    fn assemble(
        path: &str,
        nodes: &mut HashMap<String, FileNode>,
        children_of: &mut HashMap<String, Vec<String>>,
    ) -> Option<FileNode> {
        let mut node = nodes.remove(path)?;
        if let Some(child_paths) = children_of.remove(path) {
            let children = child_paths
                .iter()
                .filter_map(|p| assemble(p, nodes, children_of))
                .collect();
            node.children = Some(children);
        }
        Some(node)
    }

    roots
        .iter()
        .filter_map(|p| assemble(p, &mut nodes, &mut children_of))
        .collect()
}

/// Candidatos a fichero clave del árbol, con el tope de `MAX_KEY_FILES`
/// ya aplicado.
fn select_key_files(file_tree: &[FileNode]) -> Vec<FileNode> {
    let mut candidates = Vec::new();
    find_key_file_nodes(file_tree, 0, &mut candidates);
    candidates.truncate(MAX_KEY_FILES);
    candidates
}

/// Busca nodos candidatos a fichero clave hasta `MAX_KEY_FILE_DEPTH`.
fn find_key_file_nodes(nodes: &[FileNode], depth: usize, found: &mut Vec<FileNode>) {
    if depth > MAX_KEY_FILE_DEPTH {
        return;
    }
    for node in nodes {
        if node.kind == NodeKind::File
            && KEY_FILE_NAMES.contains(&node.name.as_str())
            && node.size.unwrap_or(0) < MAX_KEY_FILE_SIZE
        {
            found.push(node.clone());
        } else if node.kind == NodeKind::Dir {
            if let Some(children) = &node.children {
                find_key_file_nodes(children, depth + 1, found);
            }
        }
    }
}
