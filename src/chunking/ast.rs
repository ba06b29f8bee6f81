//! Declaration-level chunking using tree-sitter.
//!
//! Walks the top-level declarations of a parsed file and emits one chunk per
//! function/class/method/module block. Runs of non-declaration statements
//! between declarations are merged into block chunks. Falls back (returns
//! `None`) when the grammar is unavailable or the parse error rate exceeds
//! the threshold.

use super::Language;
use crate::models::{ChunkKind, ChunkRole};

/// If more than this fraction of AST nodes are error nodes, fall back.
const ERROR_THRESHOLD: f64 = 0.30;

/// Imports at or above this count, combined with an entry point, classify a
/// file as orchestration.
const ORCHESTRATION_IMPORTS: usize = 8;

/// A chunk as line indices into the file, before sizing and breadcrumbs.
#[derive(Debug, Clone)]
pub struct RawChunk {
    /// 0-based inclusive line range.
    pub start: usize,
    pub end: usize,
    pub kind: ChunkKind,
    /// Enclosing scope name for methods; `None` at top level.
    pub parent: Option<String>,
    pub symbols: Vec<String>,
}

impl RawChunk {
    pub fn oversize(&self, lines: &[&str]) -> bool {
        let line_count = self.end - self.start + 1;
        if line_count > super::MAX_CHUNK_LINES {
            return true;
        }
        let chars: usize = lines[self.start..=self.end].iter().map(|l| l.len() + 1).sum();
        chars > super::MAX_CHUNK_CHARS
    }
}

/// Parse and walk `content`. Returns the body chunks plus the file-level
/// role, or `None` when line-window fallback should be used instead.
pub fn chunk_declarations(
    content: &str,
    language: Language,
) -> Option<(Vec<RawChunk>, ChunkRole)> {
    let grammar = language.grammar()?;
    let mut parser = tree_sitter::Parser::new();
    parser.set_language(&grammar).ok()?;
    let tree = parser.parse(content, None)?;
    let root = tree.root_node();

    let (total, errors) = count_nodes(root);
    if total > 0 && (errors as f64 / total as f64) > ERROR_THRESHOLD {
        tracing::warn!(
            "AST error rate {:.0}% exceeds threshold, falling back to line windows",
            (errors as f64 / total as f64) * 100.0
        );
        return None;
    }

    let src = content.as_bytes();
    let mut chunks: Vec<RawChunk> = Vec::new();
    let mut import_count = 0usize;
    let mut has_entry = false;

    // Accumulator for runs of non-declaration top-level nodes.
    let mut run_start: Option<usize> = None;
    let mut run_end = 0usize;

    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        let node = unwrap_wrapper(child, language);

        if is_import(node.kind(), language) {
            import_count += 1;
        }

        match declaration_kind(node.kind(), language) {
            Some(kind) => {
                if let Some(start) = run_start.take() {
                    chunks.push(block_chunk(start, run_end));
                }

                let name = declaration_name(node, src);
                if matches!(name.as_deref(), Some("main")) {
                    has_entry = true;
                }

                if kind == ChunkKind::Class {
                    emit_container(child, node, language, src, name, &mut chunks, &mut has_entry);
                } else {
                    let mut symbols = Vec::new();
                    if let Some(n) = &name {
                        symbols.push(n.clone());
                    }
                    collect_nested_symbols(node, language, src, &mut symbols);
                    chunks.push(RawChunk {
                        start: child.start_position().row,
                        end: child.end_position().row,
                        kind,
                        parent: None,
                        symbols,
                    });
                }
            }
            None => {
                let start = child.start_position().row;
                if run_start.is_none() {
                    run_start = Some(start);
                }
                run_end = child.end_position().row;
            }
        }
    }
    if let Some(start) = run_start {
        chunks.push(block_chunk(start, run_end));
    }

    if chunks.is_empty() {
        return None;
    }

    let file_role = if import_count >= ORCHESTRATION_IMPORTS && has_entry {
        ChunkRole::Orchestration
    } else {
        ChunkRole::Implementation
    };

    Some((chunks, file_role))
}

fn block_chunk(start: usize, end: usize) -> RawChunk {
    RawChunk {
        start,
        end,
        kind: ChunkKind::Block,
        parent: None,
        symbols: Vec::new(),
    }
}

/// Containers (classes, impl blocks) keep the whole body in one class chunk
/// but additionally record their method names; oversize containers are split
/// into per-method chunks by the caller's sizing pass, so the method walk
/// here also emits methods when the container itself would be oversize.
fn emit_container(
    outer: tree_sitter::Node,
    node: tree_sitter::Node,
    language: Language,
    src: &[u8],
    name: Option<String>,
    chunks: &mut Vec<RawChunk>,
    has_entry: &mut bool,
) {
    let mut symbols = Vec::new();
    if let Some(n) = &name {
        symbols.push(n.clone());
    }

    let mut methods: Vec<RawChunk> = Vec::new();
    if let Some(body) = node.child_by_field_name("body") {
        let mut cursor = body.walk();
        for member in body.children(&mut cursor) {
            let member = unwrap_wrapper(member, language);
            if is_method(member.kind(), language) {
                let method_name = declaration_name(member, src);
                if matches!(method_name.as_deref(), Some("main")) {
                    *has_entry = true;
                }
                if let Some(m) = &method_name {
                    symbols.push(m.clone());
                }
                methods.push(RawChunk {
                    start: member.start_position().row,
                    end: member.end_position().row,
                    kind: ChunkKind::Method,
                    parent: name.clone(),
                    symbols: method_name.into_iter().collect(),
                });
            }
        }
    }

    let whole = RawChunk {
        start: outer.start_position().row,
        end: outer.end_position().row,
        kind: ChunkKind::Class,
        parent: None,
        symbols,
    };

    // Small containers stay whole; large ones are represented per-method so
    // the sizing pass never has to cut through a method body.
    let span = whole.end - whole.start + 1;
    if span > super::MAX_CHUNK_LINES && methods.len() > 1 {
        let header_end = methods
            .first()
            .map(|m| m.start.saturating_sub(1))
            .unwrap_or(whole.start)
            .max(whole.start);
        chunks.push(RawChunk {
            start: whole.start,
            end: header_end,
            kind: ChunkKind::Class,
            parent: None,
            symbols: whole.symbols,
        });
        chunks.extend(methods);
    } else {
        chunks.push(whole);
    }
}

/// Map a top-level node kind to a chunk kind, per grammar.
fn declaration_kind(kind: &str, language: Language) -> Option<ChunkKind> {
    match language {
        Language::Rust => match kind {
            "function_item" => Some(ChunkKind::Function),
            "struct_item" | "enum_item" | "trait_item" | "union_item" => Some(ChunkKind::Class),
            "impl_item" => Some(ChunkKind::Class),
            "mod_item" => Some(ChunkKind::Module),
            "macro_definition" => Some(ChunkKind::Function),
            _ => None,
        },
        Language::JavaScript | Language::TypeScript | Language::Tsx => match kind {
            "function_declaration" | "generator_function_declaration" => Some(ChunkKind::Function),
            "class_declaration" | "abstract_class_declaration" => Some(ChunkKind::Class),
            "interface_declaration" | "enum_declaration" | "type_alias_declaration" => {
                Some(ChunkKind::Class)
            }
            "module" | "internal_module" => Some(ChunkKind::Module),
            _ => None,
        },
        Language::Python => match kind {
            "function_definition" => Some(ChunkKind::Function),
            "class_definition" => Some(ChunkKind::Class),
            _ => None,
        },
        Language::Go => match kind {
            "function_declaration" => Some(ChunkKind::Function),
            "method_declaration" => Some(ChunkKind::Method),
            "type_declaration" => Some(ChunkKind::Class),
            _ => None,
        },
        Language::Unknown => None,
    }
}

fn is_method(kind: &str, language: Language) -> bool {
    match language {
        Language::Rust => kind == "function_item",
        Language::JavaScript | Language::TypeScript | Language::Tsx => {
            kind == "method_definition"
        }
        Language::Python => kind == "function_definition",
        Language::Go => false,
        Language::Unknown => false,
    }
}

fn is_import(kind: &str, language: Language) -> bool {
    match language {
        Language::Rust => kind == "use_declaration" || kind == "extern_crate_declaration",
        Language::JavaScript | Language::TypeScript | Language::Tsx => kind == "import_statement",
        Language::Python => kind == "import_statement" || kind == "import_from_statement",
        Language::Go => kind == "import_declaration",
        Language::Unknown => false,
    }
}

/// Peel wrapper nodes (export statements, decorated definitions) down to the
/// declaration they carry.
fn unwrap_wrapper(node: tree_sitter::Node, language: Language) -> tree_sitter::Node {
    match language {
        Language::JavaScript | Language::TypeScript | Language::Tsx
            if node.kind() == "export_statement" =>
        {
            node.child_by_field_name("declaration")
                .or_else(|| node.named_child(0))
                .unwrap_or(node)
        }
        Language::Python if node.kind() == "decorated_definition" => node
            .child_by_field_name("definition")
            .unwrap_or(node),
        _ => node,
    }
}

fn declaration_name(node: tree_sitter::Node, src: &[u8]) -> Option<String> {
    let name_node = node
        .child_by_field_name("name")
        .or_else(|| node.child_by_field_name("type"));
    let name_node = match name_node {
        Some(n) => n,
        // Go `type_declaration` nests the name inside a type_spec child.
        None => {
            let mut cursor = node.walk();
            let type_spec = node
                .children(&mut cursor)
                .find(|c| c.kind() == "type_spec")?;
            type_spec.child_by_field_name("name")?
        }
    };
    name_node.utf8_text(src).ok().map(|s| s.to_string())
}

/// Collect names of declarations nested under `node` (closures, inner fns).
fn collect_nested_symbols(
    node: tree_sitter::Node,
    language: Language,
    src: &[u8],
    out: &mut Vec<String>,
) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if declaration_kind(child.kind(), language).is_some() || is_method(child.kind(), language)
        {
            if let Some(name) = declaration_name(child, src) {
                if !out.contains(&name) {
                    out.push(name);
                }
            }
        }
        collect_nested_symbols(child, language, src, out);
    }
}

fn count_nodes(node: tree_sitter::Node) -> (usize, usize) {
    let mut total = 1usize;
    let mut errors = usize::from(node.is_error());

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let (t, e) = count_nodes(child);
        total += t;
        errors += e;
    }

    (total, errors)
}
