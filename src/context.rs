//! Reducción del árbol de ficheros a un contexto textual acotado para el
//! modelo: esquema indentado del árbol + cuerpos de los ficheros clave.

use crate::models::{FileContent, FileNode};

/// Profundidad máxima del esquema; los nodos más profundos se omiten.
const MAX_TREE_DEPTH: usize = 3;
/// Máximo de hermanos renderizados por nivel; el resto se descarta en silencio.
const MAX_SIBLINGS: usize = 50;

/// Umbral de caracteres a partir del cual un fichero clave se trunca.
const TRUNCATE_THRESHOLD: usize = 10_000;
/// Caracteres conservados de un fichero truncado.
const TRUNCATE_KEEP: usize = 5_000;

/// Construye el contexto del repositorio. Determinista: mismo árbol y mismos
/// ficheros clave producen siempre el mismo texto.
pub fn build_repository_context(
    file_tree: &[FileNode],
    key_files: &[FileContent],
    total_files: u64,
) -> String {
    let mut context = format!("File Structure ({total_files} files):\n");
    format_tree(file_tree, 0, &mut context);

    if !key_files.is_empty() {
        context.push_str("\n\nKey Files Content:\n\n");
        for file in key_files {
            // El recuento es de caracteres, no de bytes ni de líneas; el
            // corte puede caer en mitad de una línea.
            let char_count = file.content.chars().count();
            if char_count < TRUNCATE_THRESHOLD {
                context.push_str(&format!("--- {} ---\n{}\n\n", file.path, file.content));
            } else {
                let head: String = file.content.chars().take(TRUNCATE_KEEP).collect();
                context.push_str(&format!("--- {} (truncated) ---\n{}...\n\n", file.path, head));
            }
        }
    }

    context
}

fn format_tree(nodes: &[FileNode], depth: usize, out: &mut String) {
    if depth > MAX_TREE_DEPTH {
        return;
    }

    for node in nodes.iter().take(MAX_SIBLINGS) {
        let indent = "  ".repeat(depth);
        let glyph = if node.is_dir() { "📁" } else { "📄" };
        out.push_str(&format!("{indent}{glyph} {}\n", node.name));

        if let Some(children) = &node.children {
            if depth < MAX_TREE_DEPTH {
                format_tree(children, depth + 1, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeKind;

    fn file(name: &str) -> FileNode {
        FileNode {
            name: name.to_string(),
            path: name.to_string(),
            kind: NodeKind::File,
            size: Some(1),
            children: None,
        }
    }

    fn dir(name: &str, children: Vec<FileNode>) -> FileNode {
        FileNode {
            name: name.to_string(),
            path: name.to_string(),
            kind: NodeKind::Dir,
            size: None,
            children: Some(children),
        }
    }

    fn content(path: &str, body: String) -> FileContent {
        FileContent {
            path: path.to_string(),
            size: body.len() as u64,
            content: body,
        }
    }

    #[test]
    fn esquema_omite_nodos_mas_alla_de_profundidad_3() {
        let tree = vec![dir(
            "a",
            vec![dir(
                "b",
                vec![dir("c", vec![dir("d", vec![file("demasiado_profundo.rs")])])],
            )],
        )];

        let context = build_repository_context(&tree, &[], 1);
        assert!(context.contains("📁 a"));
        assert!(context.contains("📁 d"));
        assert!(!context.contains("demasiado_profundo.rs"));
    }

    #[test]
    fn esquema_corta_en_50_hermanos() {
        let tree: Vec<FileNode> = (0..80).map(|i| file(&format!("f{i}.rs"))).collect();
        let context = build_repository_context(&tree, &[], 80);
        assert!(context.contains("📄 f49.rs"));
        assert!(!context.contains("📄 f50.rs"));
    }

    #[test]
    fn fichero_corto_va_integro() {
        let body = "fn main() {}".to_string();
        let context = build_repository_context(&[], &[content("src/main.rs", body.clone())], 0);
        assert!(context.contains("--- src/main.rs ---"));
        assert!(context.contains(&body));
        assert!(!context.contains("(truncated)"));
    }

    #[test]
    fn fichero_largo_se_trunca_a_5000_caracteres() {
        let body = "x".repeat(12_000);
        let context = build_repository_context(&[], &[content("big.lock", body)], 0);
        assert!(context.contains("--- big.lock (truncated) ---"));

        let after_header = context.split("(truncated) ---\n").nth(1).unwrap();
        let kept = after_header.split("...").next().unwrap();
        assert_eq!(kept.chars().count(), 5_000);
    }

    #[test]
    fn justo_bajo_el_umbral_no_se_trunca() {
        let body = "y".repeat(9_999);
        let context = build_repository_context(&[], &[content("casi.md", body.clone())], 0);
        assert!(!context.contains("(truncated)"));
        assert!(context.contains(&body));
    }

    #[test]
    fn determinista() {
        let tree = vec![dir("src", vec![file("lib.rs")])];
        let files = [content("README.md", "hola".to_string())];
        let a = build_repository_context(&tree, &files, 1);
        let b = build_repository_context(&tree, &files, 1);
        assert_eq!(a, b);
    }
}
