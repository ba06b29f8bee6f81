//! The anchor chunk: a synthetic, metadata-rich chunk emitted at the top of
//! every file. It concatenates the path, top-of-file comments, import lines,
//! and the exported symbol list, intentionally duplicating content so a
//! file-level query has one strong landing point.

use super::ast::RawChunk;
use super::{ChunkSeed, Language};
use crate::models::{ChunkKind, ChunkRole};

/// Cap on comment/import lines copied into the anchor.
const MAX_HEADER_LINES: usize = 40;

pub fn build_anchor(
    path: &str,
    language: Language,
    lines: &[&str],
    body: &[RawChunk],
) -> ChunkSeed {
    let mut text = String::new();
    text.push_str(path);
    text.push('\n');

    let mut header_lines = 0usize;

    // Leading comment block.
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if is_comment(trimmed) && header_lines < MAX_HEADER_LINES {
            text.push_str(trimmed);
            text.push('\n');
            header_lines += 1;
        } else {
            break;
        }
    }

    // Import lines from anywhere in the file.
    for line in lines {
        let trimmed = line.trim();
        if is_import_line(trimmed) && header_lines < MAX_HEADER_LINES {
            text.push_str(trimmed);
            text.push('\n');
            header_lines += 1;
        }
    }

    let exports = exported_symbols(language, lines, body);
    if !exports.is_empty() {
        text.push_str("exports: ");
        text.push_str(&exports.join(", "));
        text.push('\n');
    }

    let end = lines.len().min(MAX_HEADER_LINES).max(1) as u32;

    ChunkSeed {
        text,
        line_start: 1,
        line_end: end,
        context_prev: String::new(),
        context_next: String::new(),
        kind: ChunkKind::Anchor,
        role: ChunkRole::Orchestration,
        defined_symbols: exports,
    }
}

fn is_comment(line: &str) -> bool {
    line.starts_with("//")
        || line.starts_with('#') && !line.starts_with("#include") && !line.starts_with("#[")
        || line.starts_with("/*")
        || line.starts_with('*')
        || line.starts_with("\"\"\"")
}

fn is_import_line(line: &str) -> bool {
    line.starts_with("use ")
        || line.starts_with("import ")
        || line.starts_with("from ") && line.contains(" import ")
        || line.starts_with("require(")
        || line.starts_with("const ") && line.contains("require(")
        || line.starts_with("#include")
        || line.starts_with("extern crate ")
}

/// Symbols from body chunks whose declarations look exported for the
/// language: `pub`/`export` markers, Go capitalization, Python non-underscore
/// top-level names. Unknown languages export everything the chunker named.
fn exported_symbols(language: Language, lines: &[&str], body: &[RawChunk]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for chunk in body {
        let first_line = lines.get(chunk.start).map(|l| l.trim()).unwrap_or("");
        for symbol in &chunk.symbols {
            let exported = match language {
                Language::Rust => first_line.starts_with("pub "),
                Language::JavaScript | Language::TypeScript | Language::Tsx => {
                    first_line.starts_with("export ")
                }
                Language::Go => symbol.chars().next().is_some_and(|c| c.is_uppercase()),
                Language::Python => !symbol.starts_with('_'),
                Language::Unknown => true,
            };
            if exported && !out.contains(symbol) {
                out.push(symbol.clone());
            }
        }
    }
    out
}
