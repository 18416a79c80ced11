//! Accelerator used when no compute device can be created.

use super::buffer::Buffer;
use super::types::{Backend, ComputeStats, DeviceInfo, MemoryInfo, SearchResult, StorageMode};
use super::Accelerator;
use crate::error::{ComputeError, ComputeResult};

/// Implements the full [`Accelerator`] contract and fails every operation
/// with the error it was built with.
#[derive(Debug, Clone)]
pub struct UnavailableDevice {
    error: ComputeError,
}

impl UnavailableDevice {
    /// No device exists; operations fail with [`ComputeError::Unavailable`].
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            error: ComputeError::unavailable(reason),
        }
    }

    /// Acceleration was switched off; operations fail with
    /// [`ComputeError::Disabled`].
    pub fn disabled() -> Self {
        Self {
            error: ComputeError::Disabled,
        }
    }

    fn fail<T>(&self) -> ComputeResult<T> {
        Err(self.error.clone())
    }
}

impl Accelerator for UnavailableDevice {
    fn is_available(&self) -> bool {
        false
    }

    fn backend(&self) -> Backend {
        Backend::None
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "unavailable".to_string(),
            backend: Backend::None,
            total_memory: 0,
            available_memory: 0,
            max_buffer_length: 0,
            max_threads_per_group: 0,
            compute_units: 0,
            unified_memory: false,
            supports_matrix: false,
        }
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryInfo::default()
    }

    fn new_buffer(&self, _data: &[f32], _mode: StorageMode) -> ComputeResult<Buffer<'static>> {
        self.fail()
    }

    fn new_buffer_u32(&self, _data: &[u32], _mode: StorageMode) -> ComputeResult<Buffer<'static>> {
        self.fail()
    }

    fn new_buffer_no_copy<'a>(
        &self,
        _data: &'a mut [f32],
        _mode: StorageMode,
    ) -> ComputeResult<Buffer<'a>> {
        self.fail()
    }

    fn new_empty_buffer(
        &self,
        _size_bytes: usize,
        _mode: StorageMode,
    ) -> ComputeResult<Buffer<'static>> {
        self.fail()
    }

    fn compute_cosine_similarity(
        &self,
        _embeddings: &Buffer<'_>,
        _query: &Buffer<'_>,
        _scores: &mut Buffer<'_>,
        _n: usize,
        _dims: usize,
        _normalized: bool,
    ) -> ComputeResult<()> {
        self.fail()
    }

    fn normalize_vectors(
        &self,
        _vectors: &mut Buffer<'_>,
        _n: usize,
        _dims: usize,
    ) -> ComputeResult<()> {
        self.fail()
    }

    fn compute_topk(
        &self,
        _scores: &Buffer<'_>,
        _indices: &mut Buffer<'_>,
        _topk_scores: &mut Buffer<'_>,
        _n: usize,
        _k: usize,
    ) -> ComputeResult<()> {
        self.fail()
    }

    fn batch_dot_product(
        &self,
        _embeddings: &Buffer<'_>,
        _query: &Buffer<'_>,
        _out: &mut Buffer<'_>,
        _n: usize,
        _dims: usize,
    ) -> ComputeResult<()> {
        self.fail()
    }

    fn euclidean_distance(
        &self,
        _embeddings: &Buffer<'_>,
        _query: &Buffer<'_>,
        _distances: &mut Buffer<'_>,
        _n: usize,
        _dims: usize,
    ) -> ComputeResult<()> {
        self.fail()
    }

    fn filter_by_similarity(
        &self,
        _scores: &Buffer<'_>,
        _indices: &mut Buffer<'_>,
        _n: usize,
        _threshold: f32,
    ) -> ComputeResult<usize> {
        self.fail()
    }

    fn matrix_multiply(
        &self,
        _a: &Buffer<'_>,
        _b: &Buffer<'_>,
        _c: &mut Buffer<'_>,
        _m: usize,
        _n: usize,
        _k: usize,
        _alpha: f32,
        _beta: f32,
    ) -> ComputeResult<()> {
        self.fail()
    }

    fn matrix_vector_multiply(
        &self,
        _a: &Buffer<'_>,
        _x: &Buffer<'_>,
        _y: &mut Buffer<'_>,
        _m: usize,
        _n: usize,
        _alpha: f32,
        _beta: f32,
    ) -> ComputeResult<()> {
        self.fail()
    }

    fn batch_cosine_similarity(
        &self,
        _embeddings: &Buffer<'_>,
        _query: &Buffer<'_>,
        _scores: &mut Buffer<'_>,
        _n: usize,
        _dims: usize,
    ) -> ComputeResult<()> {
        self.fail()
    }

    fn search(
        &self,
        _embeddings: &[f32],
        _query: &[f32],
        _n: usize,
        _dims: usize,
        _k: usize,
        _normalized: bool,
    ) -> ComputeResult<Vec<SearchResult>> {
        self.fail()
    }

    fn stats(&self) -> ComputeStats {
        ComputeStats::default()
    }

    fn release(&self) {}
}
