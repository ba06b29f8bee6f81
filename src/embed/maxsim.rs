//! Late-interaction (MaxSim) scoring over quantized token grids.
//!
//! Documents store int8 grids with a per-chunk scale; queries keep f32 rows.
//! Score = Σ over query tokens of the best dot product against any document
//! token. Query tokens whose tokenizer id is in the skiplist (punctuation,
//! control) contribute nothing.

use std::collections::HashSet;

/// MaxSim between an f32 query matrix and a quantized document grid.
///
/// `grid` is row-major `[tokens, dim]`; true values are `grid * scale`. The
/// result is invariant to permutations of the document rows.
pub fn max_sim_quantized(
    query: &[Vec<f32>],
    token_ids: &[u32],
    skiplist: &HashSet<u32>,
    grid: &[i8],
    scale: f32,
    dim: usize,
) -> f32 {
    if dim == 0 || grid.len() < dim {
        return 0.0;
    }
    let doc_tokens = grid.len() / dim;

    let mut total = 0.0f32;
    for (i, q_row) in query.iter().enumerate() {
        if token_ids.get(i).is_some_and(|id| skiplist.contains(id)) {
            continue;
        }
        let mut best = f32::NEG_INFINITY;
        for d in 0..doc_tokens {
            let row = &grid[d * dim..(d + 1) * dim];
            let mut dot = 0.0f32;
            for (qv, dv) in q_row.iter().zip(row.iter()) {
                dot += qv * (*dv as f32);
            }
            dot *= scale;
            if dot > best {
                best = dot;
            }
        }
        if best.is_finite() {
            total += best;
        }
    }
    total
}

/// L2-normalized mean of a dequantized grid; the lightweight single-vector
/// summary stored alongside the grid.
pub fn pool_grid(grid: &[i8], scale: f32, dim: usize) -> Vec<f32> {
    if dim == 0 || grid.len() < dim {
        return vec![0.0; dim];
    }
    let tokens = grid.len() / dim;
    let mut mean = vec![0.0f32; dim];
    for t in 0..tokens {
        for (k, v) in grid[t * dim..(t + 1) * dim].iter().enumerate() {
            mean[k] += *v as f32 * scale;
        }
    }
    for v in &mut mean {
        *v /= tokens as f32;
    }
    normalize_l2(mean)
}

pub fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Quantize one f32 token grid to int8: values scaled into `[-127, 127]` by
/// the grid's max magnitude. Returns the flat grid and the scale such that
/// `int8 * scale` reproduces the input.
pub fn quantize_grid(rows: &[Vec<f32>]) -> (Vec<i8>, f32) {
    let max_abs = rows
        .iter()
        .flat_map(|r| r.iter())
        .fold(0.0f32, |acc, v| acc.max(v.abs()));

    // A zero grid still needs a positive, finite scale.
    if max_abs <= f32::EPSILON {
        let len = rows.iter().map(|r| r.len()).sum();
        return (vec![0i8; len], 1.0 / 127.0);
    }

    let scale = max_abs / 127.0;
    let quantized = rows
        .iter()
        .flat_map(|r| r.iter().map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8))
        .collect();
    (quantized, scale)
}
