//! Scalar kernel bodies shared by the device dispatch and the CPU path.
//!
//! Every function here computes the result for one logical work item (one
//! embedding, one vector, one partition). The device decides how the work
//! items are spread over thread groups; the CPU path simply loops.
//!
//! # Top-k ordering
//! Both top-k variants rank entries by a strict total order: higher score
//! first, lower original index first on equal scores, NaN below every
//! number. Because the order is total, the true top-k set is unique and the
//! partitioned variant merges to exactly the linear result.

use std::cmp::Ordering;

use rayon::prelude::*;

use super::types::{SENTINEL_INDEX, SENTINEL_SCORE};

/// Dot product of two equally sized vectors.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Squared L2 norm.
#[inline]
pub fn squared_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum()
}

/// Computes cosine similarity between two vectors.
///
/// Returns exactly 0.0 when either vector has zero norm, never NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

/// Similarity of one embedding against the query.
///
/// `normalized` asserts both sides have unit norm, which turns the score into
/// a plain dot product.
#[inline]
pub fn similarity(embedding: &[f32], query: &[f32], normalized: bool) -> f32 {
    if normalized {
        dot(embedding, query)
    } else {
        cosine_similarity(embedding, query)
    }
}

/// L2 distance. Lower is closer.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Fast inverse square root with two Newton-Raphson refinements.
///
/// The bit-level estimate alone is off by up to ~0.2%; two refinement steps
/// bring the relative error well below 1e-5.
#[inline]
pub fn fast_inv_sqrt(x: f32) -> f32 {
    let half = 0.5 * x;
    let mut y = f32::from_bits(0x5f37_59df - (x.to_bits() >> 1));
    y *= 1.5 - half * y * y;
    y *= 1.5 - half * y * y;
    y
}

/// Rescales a vector to unit length in place.
///
/// Components are first divided by the largest magnitude so the squared norm
/// lies in `[1, len]` whatever the input scale. Zero vectors and vectors
/// holding non-finite values are left unchanged. Returns whether the vector
/// was scaled.
pub fn normalize_in_place(vector: &mut [f32]) -> bool {
    let scale = vector.iter().fold(0.0f32, |max, v| max.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return false;
    }
    let norm_sq: f32 = vector
        .iter()
        .map(|v| {
            let scaled = v / scale;
            scaled * scaled
        })
        .sum();
    if !norm_sq.is_normal() {
        return false;
    }
    let inv = fast_inv_sqrt(norm_sq);
    for value in vector.iter_mut() {
        *value = *value / scale * inv;
    }
    true
}

/// Strict ranking order used by both top-k variants.
#[inline]
fn rank(a: (f32, u32), b: (f32, u32)) -> Ordering {
    let key = |s: f32| if s.is_nan() { f32::NEG_INFINITY } else { s };
    match key(b.0).partial_cmp(&key(a.0)) {
        Some(Ordering::Equal) | None => match (a.0.is_nan(), b.0.is_nan()) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => a.1.cmp(&b.1),
        },
        Some(order) => order,
    }
}

/// Bounded insertion list holding the best `k` entries seen so far.
#[derive(Debug, Clone)]
pub struct TopK {
    k: usize,
    entries: Vec<(f32, u32)>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            entries: Vec::with_capacity(k.saturating_add(1).min(4096)),
        }
    }

    /// Offers one candidate; keeps it only if it ranks inside the top `k`.
    #[inline]
    pub fn offer(&mut self, score: f32, index: u32) {
        if self.k == 0 {
            return;
        }
        let candidate = (score, index);
        if self.entries.len() == self.k {
            // Full: quick reject against the current worst entry
            if let Some(&worst) = self.entries.last() {
                if rank(candidate, worst) != Ordering::Less {
                    return;
                }
            }
            self.entries.pop();
        }
        let position = self
            .entries
            .partition_point(|&existing| rank(existing, candidate) == Ordering::Less);
        self.entries.insert(position, candidate);
    }

    /// Folds another accumulator into this one.
    pub fn merge(&mut self, other: TopK) {
        for (score, index) in other.entries {
            self.offer(score, index);
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the ranked entries into `k` slots, padding unused slots.
    pub fn into_selection(self) -> TopKSelection {
        let mut indices = vec![SENTINEL_INDEX; self.k];
        let mut scores = vec![SENTINEL_SCORE; self.k];
        let valid = self.entries.len();
        for (slot, (score, index)) in self.entries.into_iter().enumerate() {
            indices[slot] = index;
            scores[slot] = score;
        }
        TopKSelection {
            indices,
            scores,
            valid,
        }
    }
}

/// Output of a top-k kernel: `k` slots, the first `valid` of them filled.
#[derive(Debug, Clone, PartialEq)]
pub struct TopKSelection {
    pub indices: Vec<u32>,
    pub scores: Vec<f32>,
    pub valid: usize,
}

/// Single-pass insertion top-k. Best below roughly 10,000 candidates.
pub fn topk_linear(scores: &[f32], k: usize) -> TopKSelection {
    let mut topk = TopK::new(k);
    for (index, &score) in scores.iter().enumerate() {
        topk.offer(score, index as u32);
    }
    topk.into_selection()
}

/// Partitioned top-k: each partition keeps a local top-k, then the local
/// lists are merged. Produces the same selection as [`topk_linear`].
pub fn topk_parallel(scores: &[f32], k: usize, partition_len: usize) -> TopKSelection {
    let partition_len = partition_len.max(1);
    let merged = scores
        .par_chunks(partition_len)
        .enumerate()
        .map(|(partition, chunk)| {
            let base = partition * partition_len;
            let mut local = TopK::new(k);
            for (offset, &score) in chunk.iter().enumerate() {
                local.offer(score, (base + offset) as u32);
            }
            local
        })
        .reduce(
            || TopK::new(k),
            |mut left, right| {
                left.merge(right);
                left
            },
        );
    merged.into_selection()
}
