//! Search orchestration: allocate, score, select, read back, release.

use super::device::Device;
use super::kernels::{similarity, topk_linear};
use super::types::{SearchResult, StorageMode};
use super::Accelerator;
use crate::error::{ComputeError, ComputeResult};

fn validate(embeddings: &[f32], query: &[f32], n: usize, dims: usize) -> ComputeResult<()> {
    if query.len() != dims {
        return Err(ComputeError::DimensionMismatch {
            expected: dims,
            actual: query.len(),
        });
    }
    let required = n.saturating_mul(dims);
    if embeddings.len() < required {
        return Err(ComputeError::DimensionMismatch {
            expected: required,
            actual: embeddings.len(),
        });
    }
    Ok(())
}

/// Runs a full search on the device.
///
/// Temporary buffers are released when they go out of scope, so every exit
/// path returns their memory to the device.
pub(crate) fn orchestrate(
    device: &Device,
    embeddings: &[f32],
    query: &[f32],
    n: usize,
    dims: usize,
    k: usize,
    normalized: bool,
) -> ComputeResult<Vec<SearchResult>> {
    validate(embeddings, query, n, dims)?;
    let k = k.min(n);
    if k == 0 || dims == 0 {
        return Ok(Vec::new());
    }

    let embeddings = device.new_buffer(&embeddings[..n * dims], StorageMode::Shared)?;
    let query = device.new_buffer(query, StorageMode::Shared)?;
    let mut scores = device.new_empty_buffer(n * 4, StorageMode::Shared)?;

    if normalized && n >= device.matrix_threshold() && device.info().supports_matrix {
        device.batch_cosine_similarity(&embeddings, &query, &mut scores, n, dims)?;
    } else {
        device.compute_cosine_similarity(&embeddings, &query, &mut scores, n, dims, normalized)?;
    }

    let mut indices = device.new_empty_buffer(k * 4, StorageMode::Shared)?;
    let mut top_scores = device.new_empty_buffer(k * 4, StorageMode::Shared)?;
    device.compute_topk(&scores, &mut indices, &mut top_scores, n, k)?;

    let indices = indices.read_u32(k)?;
    let top_scores = top_scores.read_f32(k)?;
    device.record_search();

    Ok(indices
        .into_iter()
        .zip(top_scores)
        .map(|(index, score)| SearchResult { index, score })
        .collect())
}

/// Scalar search on the calling thread.
///
/// Produces the same ranking as the device path; used when acceleration is
/// gated off or no device is available.
pub fn cpu_search(
    embeddings: &[f32],
    query: &[f32],
    n: usize,
    dims: usize,
    k: usize,
    normalized: bool,
) -> ComputeResult<Vec<SearchResult>> {
    validate(embeddings, query, n, dims)?;
    let k = k.min(n);
    if k == 0 || dims == 0 {
        return Ok(Vec::new());
    }

    let scores: Vec<f32> = embeddings[..n * dims]
        .chunks_exact(dims)
        .map(|row| similarity(row, query, normalized))
        .collect();
    let selection = topk_linear(&scores, k);

    Ok(selection
        .indices
        .into_iter()
        .zip(selection.scores)
        .take(selection.valid)
        .map(|(index, score)| SearchResult { index, score })
        .collect())
}
