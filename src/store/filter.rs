//! Compilation of the search filter DSL into a record predicate.
//!
//! Both retrieval paths (ANN and FTS) apply the same compiled predicate, so
//! a filtered search never leaks rows the caller excluded.

use crate::models::{ChunkRecord, Filter, FilterCond, FilterOp};

pub struct CompiledFilter {
    pred: Box<dyn Fn(&ChunkRecord) -> bool + Send + Sync>,
}

impl CompiledFilter {
    /// Compile an optional DSL filter plus an optional path prefix into one
    /// predicate. With neither present every record matches.
    pub fn compile(filter: Option<&Filter>, path_prefix: Option<&str>) -> Self {
        let filter = filter.cloned();
        let prefix = path_prefix.map(|p| p.to_string());

        Self {
            pred: Box::new(move |record| {
                if let Some(p) = &prefix {
                    if !record.path.starts_with(p.as_str()) {
                        return false;
                    }
                }
                match &filter {
                    Some(f) => eval(f, record),
                    None => true,
                }
            }),
        }
    }

    pub fn matches(&self, record: &ChunkRecord) -> bool {
        (self.pred)(record)
    }
}

fn eval(filter: &Filter, record: &ChunkRecord) -> bool {
    match filter {
        Filter::All(items) => items.iter().all(|f| eval(f, record)),
        Filter::Any(items) => items.iter().any(|f| eval(f, record)),
        Filter::Not(inner) => !eval(inner, record),
        Filter::Cond(cond) => eval_cond(cond, record),
    }
}

fn eval_cond(cond: &FilterCond, record: &ChunkRecord) -> bool {
    // defined_symbols is set-valued; the op applies per element.
    if cond.key == "defined_symbols" {
        return match cond.op {
            FilterOp::Equals => scalar(cond)
                .map(|v| record.defined_symbols.iter().any(|s| s == v))
                .unwrap_or(false),
            FilterOp::StartsWith => scalar(cond)
                .map(|v| record.defined_symbols.iter().any(|s| s.starts_with(v)))
                .unwrap_or(false),
            FilterOp::Contains => scalar(cond)
                .map(|v| record.defined_symbols.iter().any(|s| s.contains(v)))
                .unwrap_or(false),
            FilterOp::In => list(cond)
                .map(|vs| record.defined_symbols.iter().any(|s| vs.contains(&s.as_str())))
                .unwrap_or(false),
        };
    }

    let field = match cond.key.as_str() {
        "path" => record.path.as_str(),
        "kind" => record.kind.as_str(),
        "role" => record.role.as_str(),
        "hash" => record.hash.as_str(),
        // Unknown keys match nothing rather than everything.
        _ => return false,
    };

    match cond.op {
        FilterOp::Equals => scalar(cond).map(|v| field == v).unwrap_or(false),
        FilterOp::StartsWith => scalar(cond).map(|v| field.starts_with(v)).unwrap_or(false),
        FilterOp::Contains => scalar(cond).map(|v| field.contains(v)).unwrap_or(false),
        FilterOp::In => list(cond).map(|vs| vs.contains(&field)).unwrap_or(false),
    }
}

fn scalar(cond: &FilterCond) -> Option<&str> {
    cond.value.as_str()
}

fn list(cond: &FilterCond) -> Option<Vec<&str>> {
    cond.value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{COLBERT_DIM, VECTOR_DIM};
    use crate::models::{ChunkKind, ChunkRole};
    use uuid::Uuid;

    fn record(path: &str, kind: ChunkKind) -> ChunkRecord {
        let mut dense = vec![0.0f32; VECTOR_DIM];
        dense[0] = 1.0;
        let mut pooled = vec![0.0f32; COLBERT_DIM];
        pooled[0] = 1.0;
        ChunkRecord {
            id: Uuid::new_v4(),
            path: path.to_string(),
            hash: "h".to_string(),
            line_start: 1,
            line_end: 2,
            text: String::new(),
            context_prev: String::new(),
            context_next: String::new(),
            kind,
            role: ChunkRole::Definition,
            defined_symbols: vec!["login".to_string(), "logout".to_string()],
            dense,
            colbert: vec![0i8; COLBERT_DIM],
            colbert_scale: 0.01,
            pooled_colbert: pooled,
        }
    }

    fn cond(key: &str, op: FilterOp, value: serde_json::Value) -> Filter {
        Filter::Cond(FilterCond {
            key: key.to_string(),
            op,
            value,
        })
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let f = CompiledFilter::compile(None, None);
        assert!(f.matches(&record("src/a.rs", ChunkKind::Function)));
    }

    #[test]
    fn test_path_prefix() {
        let f = CompiledFilter::compile(None, Some("src/"));
        assert!(f.matches(&record("src/a.rs", ChunkKind::Function)));
        assert!(!f.matches(&record("tests/a.rs", ChunkKind::Function)));
    }

    #[test]
    fn test_starts_with_on_path() {
        let f = CompiledFilter::compile(
            Some(&cond("path", FilterOp::StartsWith, "main.ts".into())),
            None,
        );
        assert!(f.matches(&record("main.ts", ChunkKind::Function)));
        assert!(!f.matches(&record("utils.ts", ChunkKind::Function)));
    }

    #[test]
    fn test_all_any_not_combinators() {
        let f = Filter::All(vec![
            cond("path", FilterOp::StartsWith, "src/".into()),
            Filter::Not(Box::new(cond("kind", FilterOp::Equals, "anchor".into()))),
        ]);
        let compiled = CompiledFilter::compile(Some(&f), None);
        assert!(compiled.matches(&record("src/a.rs", ChunkKind::Function)));
        assert!(!compiled.matches(&record("src/a.rs", ChunkKind::Anchor)));

        let f = Filter::Any(vec![
            cond("kind", FilterOp::Equals, "anchor".into()),
            cond("kind", FilterOp::Equals, "function".into()),
        ]);
        let compiled = CompiledFilter::compile(Some(&f), None);
        assert!(compiled.matches(&record("x", ChunkKind::Anchor)));
        assert!(compiled.matches(&record("x", ChunkKind::Function)));
        assert!(!compiled.matches(&record("x", ChunkKind::Block)));
    }

    #[test]
    fn test_in_op() {
        let f = cond(
            "role",
            FilterOp::In,
            serde_json::json!(["definition", "orchestration"]),
        );
        let compiled = CompiledFilter::compile(Some(&f), None);
        assert!(compiled.matches(&record("x", ChunkKind::Function)));
    }

    #[test]
    fn test_symbols_are_set_valued() {
        let f = cond("defined_symbols", FilterOp::Equals, "login".into());
        let compiled = CompiledFilter::compile(Some(&f), None);
        assert!(compiled.matches(&record("x", ChunkKind::Function)));

        let f = cond("defined_symbols", FilterOp::Equals, "missing".into());
        let compiled = CompiledFilter::compile(Some(&f), None);
        assert!(!compiled.matches(&record("x", ChunkKind::Function)));
    }

    #[test]
    fn test_unknown_key_matches_nothing() {
        let f = cond("nope", FilterOp::Equals, "x".into());
        let compiled = CompiledFilter::compile(Some(&f), None);
        assert!(!compiled.matches(&record("x", ChunkKind::Function)));
    }
}
