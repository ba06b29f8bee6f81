//! Line-window fallback chunker for files without grammar support, and the
//! oversize re-split shared with the declaration chunker.
//!
//! Windows are bounded by both a line count and a character count; each
//! window after the first starts inside the previous one so no boundary
//! falls between two windows without overlap.

use super::ast::RawChunk;
use super::{MAX_CHUNK_CHARS, MAX_CHUNK_LINES, OVERLAP_CHARS, OVERLAP_LINES};
use crate::models::ChunkKind;

/// Chunk a whole file into overlapping line windows.
pub fn chunk_windows(lines: &[&str]) -> Vec<RawChunk> {
    windows_in_range(lines, 0, lines.len().saturating_sub(1), ChunkKind::Fallback, None, &[])
}

/// Re-split one oversize chunk with the same overlap policy, preserving its
/// kind, parent, and symbols on every part.
pub fn split_oversize(lines: &[&str], chunk: &RawChunk) -> Vec<RawChunk> {
    windows_in_range(
        lines,
        chunk.start,
        chunk.end,
        chunk.kind,
        chunk.parent.clone(),
        &chunk.symbols,
    )
}

fn windows_in_range(
    lines: &[&str],
    start: usize,
    end: usize,
    kind: ChunkKind,
    parent: Option<String>,
    symbols: &[String],
) -> Vec<RawChunk> {
    if lines.is_empty() || start > end {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut window_start = start;

    loop {
        let mut window_end = window_start;
        let mut chars = lines[window_start].len() + 1;

        while window_end < end {
            let next_chars = lines[window_end + 1].len() + 1;
            if window_end - window_start + 1 >= MAX_CHUNK_LINES
                || chars + next_chars > MAX_CHUNK_CHARS
            {
                break;
            }
            window_end += 1;
            chars += next_chars;
        }

        chunks.push(RawChunk {
            start: window_start,
            end: window_end,
            kind,
            parent: parent.clone(),
            symbols: symbols.to_vec(),
        });

        if window_end >= end {
            break;
        }

        // Step back for overlap, bounded by lines and characters.
        let mut overlap_start = window_end + 1;
        let mut overlap_chars = 0usize;
        while overlap_start > window_start + 1
            && window_end + 1 - overlap_start < OVERLAP_LINES
            && overlap_chars + lines[overlap_start - 1].len() + 1 <= OVERLAP_CHARS
        {
            overlap_start -= 1;
            overlap_chars += lines[overlap_start].len() + 1;
        }
        window_start = overlap_start;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines_of(source: &str) -> Vec<&str> {
        source.lines().collect()
    }

    #[test]
    fn test_small_file_single_window() {
        let source = "a\nb\nc";
        let lines = lines_of(source);
        let chunks = chunk_windows(&lines);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 2);
        assert_eq!(chunks[0].kind, ChunkKind::Fallback);
    }

    #[test]
    fn test_line_budget_respected() {
        let source: String = (0..300).map(|i| format!("line {i}\n")).collect();
        let lines = lines_of(&source);
        let chunks = chunk_windows(&lines);
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.end - c.start + 1 <= MAX_CHUNK_LINES);
        }
    }

    #[test]
    fn test_windows_overlap_and_cover() {
        let source: String = (0..300).map(|i| format!("line {i}\n")).collect();
        let lines = lines_of(&source);
        let chunks = chunk_windows(&lines);

        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, lines.len() - 1);
        for pair in chunks.windows(2) {
            assert!(pair[1].start <= pair[0].end, "gap between windows");
            assert!(pair[1].start > pair[0].start, "no forward progress");
        }
    }

    #[test]
    fn test_char_budget_splits_long_lines() {
        // Few lines, but each one is heavy.
        let source: String = (0..10).map(|i| format!("{}{i}\n", "x".repeat(800))).collect();
        let lines = lines_of(&source);
        let chunks = chunk_windows(&lines);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn test_split_preserves_kind_and_symbols() {
        let source: String = (0..300).map(|i| format!("line {i}\n")).collect();
        let lines = lines_of(&source);
        let big = RawChunk {
            start: 0,
            end: lines.len() - 1,
            kind: ChunkKind::Function,
            parent: Some("Outer".to_string()),
            symbols: vec!["big".to_string()],
        };

        let parts = split_oversize(&lines, &big);
        assert!(parts.len() >= 2);
        for p in &parts {
            assert_eq!(p.kind, ChunkKind::Function);
            assert_eq!(p.parent.as_deref(), Some("Outer"));
            assert_eq!(p.symbols, ["big"]);
        }
    }

    #[test]
    fn test_empty_input() {
        let lines: Vec<&str> = Vec::new();
        assert!(chunk_windows(&lines).is_empty());
    }
}
