//! Compute devices, buffers and similarity kernels.
//!
//! Callers talk to an [`Accelerator`]. Exactly two implementations exist:
//! [`Device`], a host compute device backed by a dedicated rayon pool, and
//! [`UnavailableDevice`], which reports unavailability from every operation.
//! [`probe`] picks one of them once at start-up so callers never branch on
//! the platform.

mod buffer;
mod device;
mod fallback;
pub mod kernels;
mod matrix;
mod search;
mod types;

use std::fmt;
use std::sync::Arc;

pub use buffer::Buffer;
pub use device::{Device, DeviceOptions, log_device_info};
pub use fallback::UnavailableDevice;
pub use search::cpu_search;
pub use types::{
    Backend, ComputeStats, DeviceInfo, MemoryInfo, SENTINEL_INDEX, SENTINEL_SCORE, SearchResult,
    StorageMode,
};

use crate::config::ComputeSettings;
use crate::error::{ComputeError, ComputeResult};

/// Capability interface of a compute device.
///
/// Kernels take read-only inputs by shared reference and outputs by mutable
/// reference, so a buffer can never be written by two dispatches at once.
/// All dispatches complete before returning.
pub trait Accelerator: Send + Sync + fmt::Debug {
    /// Whether the device can currently accept allocations and dispatches.
    fn is_available(&self) -> bool;

    fn backend(&self) -> Backend;

    /// Identity and capabilities.
    fn info(&self) -> DeviceInfo;

    /// Current memory accounting.
    fn memory_info(&self) -> MemoryInfo;

    /// Creates a buffer holding a copy of `data`.
    fn new_buffer(&self, data: &[f32], mode: StorageMode) -> ComputeResult<Buffer<'static>>;

    /// Creates a buffer holding a copy of index data.
    fn new_buffer_u32(&self, data: &[u32], mode: StorageMode) -> ComputeResult<Buffer<'static>>;

    /// Creates a buffer aliasing caller memory. Requires shared storage.
    fn new_buffer_no_copy<'a>(
        &self,
        data: &'a mut [f32],
        mode: StorageMode,
    ) -> ComputeResult<Buffer<'a>>;

    /// Allocates zeroed space, rounded up to whole 32-bit elements.
    fn new_empty_buffer(&self, size_bytes: usize, mode: StorageMode)
    -> ComputeResult<Buffer<'static>>;

    /// Scores `n` embeddings of `dims` elements against the query.
    fn compute_cosine_similarity(
        &self,
        embeddings: &Buffer<'_>,
        query: &Buffer<'_>,
        scores: &mut Buffer<'_>,
        n: usize,
        dims: usize,
        normalized: bool,
    ) -> ComputeResult<()>;

    /// Rescales `n` vectors to unit length in place; zero vectors are kept.
    fn normalize_vectors(&self, vectors: &mut Buffer<'_>, n: usize, dims: usize)
    -> ComputeResult<()>;

    /// Selects the `k` best of `n` scores into `indices` and `topk_scores`.
    fn compute_topk(
        &self,
        scores: &Buffer<'_>,
        indices: &mut Buffer<'_>,
        topk_scores: &mut Buffer<'_>,
        n: usize,
        k: usize,
    ) -> ComputeResult<()>;

    /// Raw dot product of each embedding with the query.
    fn batch_dot_product(
        &self,
        embeddings: &Buffer<'_>,
        query: &Buffer<'_>,
        out: &mut Buffer<'_>,
        n: usize,
        dims: usize,
    ) -> ComputeResult<()>;

    /// L2 distance of each embedding to the query.
    fn euclidean_distance(
        &self,
        embeddings: &Buffer<'_>,
        query: &Buffer<'_>,
        distances: &mut Buffer<'_>,
        n: usize,
        dims: usize,
    ) -> ComputeResult<()>;

    /// Writes the indices of scores at or above `threshold` into `indices`
    /// without gaps and returns how many were written.
    fn filter_by_similarity(
        &self,
        scores: &Buffer<'_>,
        indices: &mut Buffer<'_>,
        n: usize,
        threshold: f32,
    ) -> ComputeResult<usize>;

    /// `C = alpha * A * B + beta * C` with row-major `A (m x k)`,
    /// `B (k x n)` and `C (m x n)`.
    #[allow(clippy::too_many_arguments)]
    fn matrix_multiply(
        &self,
        a: &Buffer<'_>,
        b: &Buffer<'_>,
        c: &mut Buffer<'_>,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        beta: f32,
    ) -> ComputeResult<()>;

    /// `y = alpha * A * x + beta * y` with row-major `A (m x n)`.
    #[allow(clippy::too_many_arguments)]
    fn matrix_vector_multiply(
        &self,
        a: &Buffer<'_>,
        x: &Buffer<'_>,
        y: &mut Buffer<'_>,
        m: usize,
        n: usize,
        alpha: f32,
        beta: f32,
    ) -> ComputeResult<()>;

    /// Scores pre-normalized embeddings through the matrix path.
    fn batch_cosine_similarity(
        &self,
        embeddings: &Buffer<'_>,
        query: &Buffer<'_>,
        scores: &mut Buffer<'_>,
        n: usize,
        dims: usize,
    ) -> ComputeResult<()>;

    /// Full search: allocate, score, select, read back, release.
    fn search(
        &self,
        embeddings: &[f32],
        query: &[f32],
        n: usize,
        dims: usize,
        k: usize,
        normalized: bool,
    ) -> ComputeResult<Vec<SearchResult>>;

    fn stats(&self) -> ComputeStats;

    /// Releases the device and invalidates every buffer created from it.
    fn release(&self);
}

/// Selects the accelerator for this process.
///
/// Returns the host device when acceleration is enabled and the device can
/// be created. Otherwise returns an [`UnavailableDevice`], unless the device
/// failed to start and `fallback_on_error` is off.
pub fn probe(settings: &ComputeSettings) -> ComputeResult<Arc<dyn Accelerator>> {
    if !settings.enabled {
        tracing::debug!("compute acceleration disabled by configuration");
        return Ok(Arc::new(UnavailableDevice::disabled()));
    }

    if settings.preferred_backend == Backend::None {
        tracing::info!("preferred compute backend is 'none'; using the CPU path");
        return Ok(Arc::new(UnavailableDevice::new(
            "preferred backend is none",
        )));
    }

    match Device::new(DeviceOptions::from(settings)) {
        Ok(device) => {
            log_device_info(&device);
            Ok(Arc::new(device))
        }
        Err(e) if settings.fallback_on_error => {
            tracing::warn!("compute device unavailable, falling back to CPU: {e}");
            Ok(Arc::new(UnavailableDevice::new(e.to_string())))
        }
        Err(e) => Err(e),
    }
}

/// Like [`probe`] but never fails; used where a device is optional.
pub fn probe_or_unavailable(settings: &ComputeSettings) -> Arc<dyn Accelerator> {
    probe(settings).unwrap_or_else(|e: ComputeError| Arc::new(UnavailableDevice::new(e.to_string())))
}
