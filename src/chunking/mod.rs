//! Syntax-aware chunking: declaration-level chunks for supported grammars,
//! overlapping line windows for the rest, plus a synthetic anchor chunk per
//! file that concentrates metadata for retrieval.

pub mod anchor;
pub mod ast;
pub mod fallback;

use std::path::Path;

use crate::models::{ChunkKind, ChunkRole};

/// Maximum lines per emitted chunk.
pub const MAX_CHUNK_LINES: usize = 120;
/// Maximum characters per emitted chunk.
pub const MAX_CHUNK_CHARS: usize = 3_200;
/// Lines of overlap when an oversize chunk is re-split.
pub const OVERLAP_LINES: usize = 12;
/// Character overlap bound used alongside [`OVERLAP_LINES`].
pub const OVERLAP_CHARS: usize = 320;
/// Lines of neighboring context attached to each chunk.
pub const CONTEXT_LINES: usize = 6;

/// A chunk before embedding: everything except id, hash, and vectors.
#[derive(Debug, Clone)]
pub struct ChunkSeed {
    /// Breadcrumb header plus content.
    pub text: String,
    /// 1-based inclusive.
    pub line_start: u32,
    pub line_end: u32,
    pub context_prev: String,
    pub context_next: String,
    pub kind: ChunkKind,
    pub role: ChunkRole,
    pub defined_symbols: Vec<String>,
}

/// Languages with tree-sitter grammar support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    JavaScript,
    TypeScript,
    Tsx,
    Python,
    Go,
    Unknown,
}

impl Language {
    /// Static extension → grammar table.
    pub fn from_path(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "rs" => Language::Rust,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "mts" | "cts" => Language::TypeScript,
            "tsx" => Language::Tsx,
            "py" | "pyi" => Language::Python,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    pub fn grammar(&self) -> Option<tree_sitter::Language> {
        match self {
            Language::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            Language::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            Language::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            Language::Tsx => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
            Language::Python => Some(tree_sitter_python::LANGUAGE.into()),
            Language::Go => Some(tree_sitter_go::LANGUAGE.into()),
            Language::Unknown => None,
        }
    }
}

/// Chunk one file. Output order is stable for identical input bytes: the
/// anchor chunk first, then body chunks in line order.
pub fn chunk_file(path: &str, content: &str) -> Vec<ChunkSeed> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let language = Language::from_path(path);
    let lines: Vec<&str> = content.lines().collect();

    let (body, file_role) = match ast::chunk_declarations(content, language) {
        Some(parsed) => parsed,
        None => {
            if language != Language::Unknown {
                tracing::debug!("{}", crate::error::Error::ParseFallback(path.to_string()));
            }
            (fallback::chunk_windows(&lines), ChunkRole::Implementation)
        }
    };

    // Re-split anything over the size bounds with the same overlap policy.
    let mut sized: Vec<ast::RawChunk> = Vec::with_capacity(body.len());
    for chunk in body {
        if chunk.oversize(&lines) {
            sized.extend(fallback::split_oversize(&lines, &chunk));
        } else {
            sized.push(chunk);
        }
    }

    let mut seeds = Vec::with_capacity(sized.len() + 1);
    seeds.push(anchor::build_anchor(path, language, &lines, &sized));

    for chunk in &sized {
        let role = match chunk.kind {
            _ if file_role == ChunkRole::Orchestration => ChunkRole::Orchestration,
            ChunkKind::Function | ChunkKind::Method | ChunkKind::Class => ChunkRole::Definition,
            _ => ChunkRole::Implementation,
        };
        seeds.push(seed_from_raw(path, &lines, chunk, role));
    }

    seeds
}

fn seed_from_raw(path: &str, lines: &[&str], chunk: &ast::RawChunk, role: ChunkRole) -> ChunkSeed {
    let end = chunk.end.min(lines.len().saturating_sub(1));
    let start = chunk.start.min(end);
    let content = lines[start..=end].join("\n");
    let breadcrumb = match &chunk.parent {
        Some(parent) => format!("{path} · {} · {parent}", chunk.kind.as_str()),
        None => format!("{path} · {}", chunk.kind.as_str()),
    };

    ChunkSeed {
        text: format!("{breadcrumb}\n{content}"),
        line_start: start as u32 + 1,
        line_end: end as u32 + 1,
        context_prev: context_before(lines, start),
        context_next: context_after(lines, end),
        kind: chunk.kind,
        role,
        defined_symbols: chunk.symbols.clone(),
    }
}

/// Up to [`CONTEXT_LINES`] lines preceding the window; empty at file start.
fn context_before(lines: &[&str], start: usize) -> String {
    let from = start.saturating_sub(CONTEXT_LINES);
    lines[from..start].join("\n")
}

/// Up to [`CONTEXT_LINES`] lines following the window; empty at file end.
fn context_after(lines: &[&str], end: usize) -> String {
    let from = (end + 1).min(lines.len());
    let to = (end + 1 + CONTEXT_LINES).min(lines.len());
    lines[from..to].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_table() {
        assert_eq!(Language::from_path("src/main.rs"), Language::Rust);
        assert_eq!(Language::from_path("app.py"), Language::Python);
        assert_eq!(Language::from_path("web/index.tsx"), Language::Tsx);
        assert_eq!(Language::from_path("pkg/server.go"), Language::Go);
        assert_eq!(Language::from_path("notes.md"), Language::Unknown);
    }

    #[test]
    fn test_empty_file_yields_no_chunks() {
        assert!(chunk_file("a.rs", "").is_empty());
        assert!(chunk_file("a.rs", "  \n \n").is_empty());
    }

    #[test]
    fn test_anchor_is_first_and_unique() {
        let source = "fn one() {}\n\nfn two() {}\n";
        let seeds = chunk_file("src/lib.rs", source);
        assert!(seeds.len() >= 2);
        assert_eq!(seeds[0].kind, ChunkKind::Anchor);
        let anchors = seeds.iter().filter(|s| s.kind == ChunkKind::Anchor).count();
        assert_eq!(anchors, 1);
    }

    #[test]
    fn test_breadcrumb_prepended() {
        let seeds = chunk_file("src/lib.rs", "fn solo() { let x = 1; }\n");
        let body = seeds.iter().find(|s| s.kind != ChunkKind::Anchor).unwrap();
        let header = body.text.lines().next().unwrap();
        assert!(header.starts_with("src/lib.rs · "), "got header {header:?}");
    }

    #[test]
    fn test_contexts_empty_at_edges() {
        let source = "fn only() {\n    body();\n}\n";
        let seeds = chunk_file("src/lib.rs", source);
        let body = seeds.iter().find(|s| s.kind != ChunkKind::Anchor).unwrap();
        assert_eq!(body.context_prev, "");
        assert_eq!(body.context_next, "");
    }

    #[test]
    fn test_deterministic_output() {
        let source = "fn a() {}\n\nstruct B;\n\nfn c() { a(); }\n";
        let first = chunk_file("src/lib.rs", source);
        let second = chunk_file("src/lib.rs", source);
        assert_eq!(first.len(), second.len());
        for (x, y) in first.iter().zip(second.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.line_start, y.line_start);
        }
    }

    #[test]
    fn test_unknown_language_uses_fallback_kind() {
        let text = (0..40).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let seeds = chunk_file("README.md", &text);
        assert!(seeds
            .iter()
            .filter(|s| s.kind != ChunkKind::Anchor)
            .all(|s| s.kind == ChunkKind::Fallback));
    }

    #[test]
    fn test_oversize_chunks_are_split_with_overlap() {
        // One giant function body, far over the line budget.
        let mut source = String::from("fn big() {\n");
        for i in 0..400 {
            source.push_str(&format!("    let v{i} = {i};\n"));
        }
        source.push_str("}\n");

        let seeds = chunk_file("src/big.rs", &source);
        let bodies: Vec<_> = seeds.iter().filter(|s| s.kind != ChunkKind::Anchor).collect();
        assert!(bodies.len() >= 3, "expected split, got {}", bodies.len());
        for s in &bodies {
            let lines = (s.line_end - s.line_start + 1) as usize;
            assert!(lines <= MAX_CHUNK_LINES);
        }
        // Consecutive windows overlap.
        assert!(bodies[1].line_start < bodies[0].line_end);
    }
}
