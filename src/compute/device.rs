//! Host compute device.
//!
//! A [`Device`] owns a dedicated rayon pool that executes kernels, a single
//! command queue that serializes dispatches, and the memory accounting of
//! every buffer it creates. Each dispatch splits its work items into thread
//! groups of `threads_per_group` items and completes before returning.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;

use super::buffer::Buffer;
use super::kernels::{self, topk_linear, topk_parallel};
use super::matrix;
use super::search;
use super::types::{Backend, ComputeStats, DeviceInfo, MemoryInfo, SearchResult, StorageMode};
use super::Accelerator;
use crate::config::ComputeSettings;
use crate::error::{ComputeError, ComputeResult};

const MIB: u64 = 1024 * 1024;

/// Construction parameters of a host device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Total bytes the device may hand out across live buffers.
    pub memory_limit_bytes: u64,
    /// Largest single buffer in bytes.
    pub max_buffer_bytes: u64,
    /// Worker threads; 0 uses one per logical CPU.
    pub threads: usize,
    pub threads_per_group: usize,
    /// Candidate count at which top-k switches to the partitioned variant.
    pub parallel_topk_threshold: usize,
    /// Candidate count at which searches may take the matrix path.
    pub matrix_threshold: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self::from(&ComputeSettings::default())
    }
}

impl From<&ComputeSettings> for DeviceOptions {
    fn from(settings: &ComputeSettings) -> Self {
        Self {
            memory_limit_bytes: settings.memory_limit_mb.saturating_mul(MIB),
            max_buffer_bytes: settings.max_buffer_mb.saturating_mul(MIB),
            threads: settings.threads,
            threads_per_group: settings.threads_per_group.max(1),
            parallel_topk_threshold: settings.parallel_topk_threshold,
            matrix_threshold: settings.matrix_threshold,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    allocated: u64,
    peak: u64,
    live_buffers: u64,
}

#[derive(Debug, Default)]
struct Counters {
    kernel_executions: AtomicU64,
    kernel_failures: AtomicU64,
    searches: AtomicU64,
    matrix_dispatches: AtomicU64,
    bytes_transferred: AtomicU64,
    kernel_time_ns: AtomicU64,
}

/// State shared between a device and its buffers.
#[derive(Debug)]
pub(crate) struct DeviceShared {
    released: AtomicBool,
    memory: Mutex<MemoryState>,
    total_memory: u64,
    max_buffer_bytes: u64,
    counters: Counters,
}

impl DeviceShared {
    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn reserve(&self, bytes: usize) -> ComputeResult<()> {
        let requested = bytes as u64;
        if requested > self.max_buffer_bytes {
            return Err(ComputeError::AllocationFailed {
                requested: bytes,
                reason: format!(
                    "exceeds the maximum buffer length of {} bytes",
                    self.max_buffer_bytes
                ),
            });
        }

        let mut memory = self.memory.lock();
        if self.is_released() {
            return Err(ComputeError::unavailable("device has been released"));
        }
        if memory.allocated.saturating_add(requested) > self.total_memory {
            return Err(ComputeError::AllocationFailed {
                requested: bytes,
                reason: format!(
                    "device memory limit of {} bytes reached ({} allocated)",
                    self.total_memory, memory.allocated
                ),
            });
        }
        memory.allocated += requested;
        memory.peak = memory.peak.max(memory.allocated);
        memory.live_buffers += 1;
        Ok(())
    }

    pub(crate) fn free(&self, bytes: usize) {
        let mut memory = self.memory.lock();
        // Accounting was reset when the device was released
        if self.is_released() {
            return;
        }
        memory.allocated = memory.allocated.saturating_sub(bytes as u64);
        memory.live_buffers = memory.live_buffers.saturating_sub(1);
    }

    pub(crate) fn record_transfer(&self, bytes: usize) {
        self.counters
            .bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Host compute device backed by a dedicated thread pool.
pub struct Device {
    shared: Arc<DeviceShared>,
    pool: rayon::ThreadPool,
    /// Command queue. Dispatches are submitted and completed one at a time.
    queue: Mutex<()>,
    options: DeviceOptions,
    name: String,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("threads", &self.pool.current_num_threads())
            .field("options", &self.options)
            .field("released", &self.shared.is_released())
            .finish()
    }
}

/// Fails a dispatch whose buffer is smaller than the work requires.
fn require(kernel: &'static str, buffer: &str, have: usize, need: usize) -> ComputeResult<()> {
    if have < need {
        return Err(ComputeError::KernelFailed {
            kernel,
            diagnostic: format!("{buffer} buffer holds {have} elements, {need} required"),
        });
    }
    Ok(())
}

fn require_dims(kernel: &'static str, dims: usize) -> ComputeResult<()> {
    if dims == 0 {
        return Err(ComputeError::KernelFailed {
            kernel,
            diagnostic: "vector dimension must be non-zero".to_string(),
        });
    }
    Ok(())
}

fn elements(kernel: &'static str, a: usize, b: usize) -> ComputeResult<usize> {
    a.checked_mul(b).ok_or_else(|| ComputeError::KernelFailed {
        kernel,
        diagnostic: format!("{a} x {b} elements overflows the address space"),
    })
}

impl Device {
    /// Whether this build can create a host device at all.
    pub fn is_supported() -> bool {
        num_cpus::get() > 0
    }

    /// Creates the device and its worker pool.
    ///
    /// A `threads_per_group` of zero is raised to one.
    pub fn new(mut options: DeviceOptions) -> ComputeResult<Self> {
        options.threads_per_group = options.threads_per_group.max(1);
        if !Self::is_supported() {
            return Err(ComputeError::unavailable("no CPUs reported by the platform"));
        }

        let threads = if options.threads == 0 {
            num_cpus::get()
        } else {
            options.threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("embedsearch-compute-{i}"))
            .build()
            .map_err(|e| ComputeError::unavailable(format!("failed to start compute pool: {e}")))?;

        let shared = Arc::new(DeviceShared {
            released: AtomicBool::new(false),
            memory: Mutex::new(MemoryState::default()),
            total_memory: options.memory_limit_bytes,
            max_buffer_bytes: options.max_buffer_bytes.min(options.memory_limit_bytes),
            counters: Counters::default(),
        });

        Ok(Self {
            shared,
            pool,
            queue: Mutex::new(()),
            name: format!("host compute device ({threads} threads)"),
            options,
        })
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Candidate count at which a normalized search takes the matrix path.
    pub fn matrix_threshold(&self) -> usize {
        self.options.matrix_threshold
    }

    pub(crate) fn record_search(&self) {
        self.shared.counters.searches.fetch_add(1, Ordering::Relaxed);
    }

    fn allocate(&self, words: Vec<u32>, mode: StorageMode) -> ComputeResult<Buffer<'static>> {
        if words.is_empty() {
            return Err(ComputeError::EmptyBuffer);
        }
        self.shared.reserve(words.len() * 4)?;
        self.shared.record_transfer(words.len() * 4);
        Ok(Buffer::owned(Arc::clone(&self.shared), words, mode))
    }

    fn check_buffers(&self, buffers: &[&Buffer<'_>]) -> ComputeResult<()> {
        for buffer in buffers {
            if !buffer.is_valid() || !buffer.belongs_to(&self.shared) {
                return Err(ComputeError::InvalidBuffer);
            }
        }
        Ok(())
    }

    /// Submits one kernel to the queue and waits for completion.
    fn dispatch<T, F>(&self, kernel: &'static str, work: F) -> ComputeResult<T>
    where
        F: FnOnce(usize) -> ComputeResult<T> + Send,
        T: Send,
    {
        if self.shared.is_released() {
            return Err(ComputeError::InvalidBuffer);
        }

        let _queue = self.queue.lock();
        let group = self.options.threads_per_group;
        let start = Instant::now();
        let result = self.pool.install(|| work(group));
        let elapsed = start.elapsed().as_nanos() as u64;

        let counters = &self.shared.counters;
        counters.kernel_executions.fetch_add(1, Ordering::Relaxed);
        counters.kernel_time_ns.fetch_add(elapsed, Ordering::Relaxed);
        if let Err(e) = &result {
            counters.kernel_failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(kernel, "kernel dispatch failed: {e}");
        }
        result
    }

    /// Applies `op(row, query)` to each of `n` rows, writing one output
    /// per row.
    #[allow(clippy::too_many_arguments)]
    fn per_row<F>(
        &self,
        kernel: &'static str,
        embeddings: &Buffer<'_>,
        query: &Buffer<'_>,
        out: &mut Buffer<'_>,
        n: usize,
        dims: usize,
        op: F,
    ) -> ComputeResult<()>
    where
        F: Fn(&[f32], &[f32]) -> f32 + Send + Sync,
    {
        self.check_buffers(&[embeddings, query, &*out])?;
        require_dims(kernel, dims)?;
        let rows = embeddings.device_f32()?;
        let query = query.device_f32()?;
        require(kernel, "embeddings", rows.len(), elements(kernel, n, dims)?)?;
        require(kernel, "query", query.len(), dims)?;
        require(kernel, "output", out.len(), n)?;
        let query = &query[..dims];

        let slots = &mut out.device_f32_mut()?[..n];
        self.dispatch(kernel, |group| {
            slots
                .par_chunks_mut(group)
                .enumerate()
                .for_each(|(group_id, slots)| {
                    let base = group_id * group;
                    for (offset, slot) in slots.iter_mut().enumerate() {
                        let row = (base + offset) * dims;
                        *slot = op(&rows[row..row + dims], query);
                    }
                });
            Ok(())
        })?;
        out.sync_to_host(0..n);
        Ok(())
    }
}

impl Accelerator for Device {
    fn is_available(&self) -> bool {
        !self.shared.is_released()
    }

    fn backend(&self) -> Backend {
        Backend::Host
    }

    fn info(&self) -> DeviceInfo {
        let allocated = self.shared.memory.lock().allocated;
        DeviceInfo {
            name: self.name.clone(),
            backend: Backend::Host,
            total_memory: self.shared.total_memory,
            available_memory: self.shared.total_memory.saturating_sub(allocated),
            max_buffer_length: self.shared.max_buffer_bytes,
            max_threads_per_group: self.options.threads_per_group as u32,
            compute_units: self.pool.current_num_threads() as u32,
            unified_memory: true,
            supports_matrix: true,
        }
    }

    fn memory_info(&self) -> MemoryInfo {
        let memory = self.shared.memory.lock();
        MemoryInfo {
            total: self.shared.total_memory,
            allocated: memory.allocated,
            peak: memory.peak,
            available: self.shared.total_memory.saturating_sub(memory.allocated),
            live_buffers: memory.live_buffers,
        }
    }

    fn new_buffer(&self, data: &[f32], mode: StorageMode) -> ComputeResult<Buffer<'static>> {
        self.allocate(bytemuck::cast_slice(data).to_vec(), mode)
    }

    fn new_buffer_u32(&self, data: &[u32], mode: StorageMode) -> ComputeResult<Buffer<'static>> {
        self.allocate(data.to_vec(), mode)
    }

    fn new_buffer_no_copy<'a>(
        &self,
        data: &'a mut [f32],
        mode: StorageMode,
    ) -> ComputeResult<Buffer<'a>> {
        if mode != StorageMode::Shared {
            return Err(ComputeError::NoCopyRequiresShared);
        }
        if data.is_empty() {
            return Err(ComputeError::EmptyBuffer);
        }
        self.shared.reserve(std::mem::size_of_val(data))?;
        Ok(Buffer::borrowed(
            Arc::clone(&self.shared),
            bytemuck::cast_slice_mut(data),
        ))
    }

    fn new_empty_buffer(
        &self,
        size_bytes: usize,
        mode: StorageMode,
    ) -> ComputeResult<Buffer<'static>> {
        self.allocate(vec![0; size_bytes.div_ceil(4)], mode)
    }

    fn compute_cosine_similarity(
        &self,
        embeddings: &Buffer<'_>,
        query: &Buffer<'_>,
        scores: &mut Buffer<'_>,
        n: usize,
        dims: usize,
        normalized: bool,
    ) -> ComputeResult<()> {
        self.per_row(
            "cosine_similarity",
            embeddings,
            query,
            scores,
            n,
            dims,
            |row, query| kernels::similarity(row, query, normalized),
        )
    }

    fn normalize_vectors(
        &self,
        vectors: &mut Buffer<'_>,
        n: usize,
        dims: usize,
    ) -> ComputeResult<()> {
        const KERNEL: &str = "normalize_vectors";
        self.check_buffers(&[&*vectors])?;
        require_dims(KERNEL, dims)?;
        let total = elements(KERNEL, n, dims)?;
        require(KERNEL, "vectors", vectors.len(), total)?;

        let data = &mut vectors.device_f32_mut()?[..total];
        self.dispatch(KERNEL, |group| {
            data.par_chunks_mut(dims * group).for_each(|rows| {
                for row in rows.chunks_mut(dims) {
                    kernels::normalize_in_place(row);
                }
            });
            Ok(())
        })?;
        vectors.sync_to_host(0..total);
        Ok(())
    }

    fn compute_topk(
        &self,
        scores: &Buffer<'_>,
        indices: &mut Buffer<'_>,
        topk_scores: &mut Buffer<'_>,
        n: usize,
        k: usize,
    ) -> ComputeResult<()> {
        const KERNEL: &str = "topk";
        self.check_buffers(&[scores, &*indices, &*topk_scores])?;
        let values = scores.device_f32()?;
        require(KERNEL, "scores", values.len(), n)?;
        require(KERNEL, "indices", indices.len(), k)?;
        require(KERNEL, "topk_scores", topk_scores.len(), k)?;
        let values = &values[..n];

        let threshold = self.options.parallel_topk_threshold;
        let workers = self.pool.current_num_threads().max(1);
        let selection = self.dispatch(KERNEL, |group| {
            Ok(if n >= threshold {
                topk_parallel(values, k, (n / workers).max(group))
            } else {
                topk_linear(values, k)
            })
        })?;

        indices.device_u32_mut()?[..k].copy_from_slice(&selection.indices);
        topk_scores.device_f32_mut()?[..k].copy_from_slice(&selection.scores);
        indices.sync_to_host(0..k);
        topk_scores.sync_to_host(0..k);
        Ok(())
    }

    fn batch_dot_product(
        &self,
        embeddings: &Buffer<'_>,
        query: &Buffer<'_>,
        out: &mut Buffer<'_>,
        n: usize,
        dims: usize,
    ) -> ComputeResult<()> {
        self.per_row("batch_dot_product", embeddings, query, out, n, dims, kernels::dot)
    }

    fn euclidean_distance(
        &self,
        embeddings: &Buffer<'_>,
        query: &Buffer<'_>,
        distances: &mut Buffer<'_>,
        n: usize,
        dims: usize,
    ) -> ComputeResult<()> {
        self.per_row(
            "euclidean_distance",
            embeddings,
            query,
            distances,
            n,
            dims,
            kernels::euclidean_distance,
        )
    }

    fn filter_by_similarity(
        &self,
        scores: &Buffer<'_>,
        indices: &mut Buffer<'_>,
        n: usize,
        threshold: f32,
    ) -> ComputeResult<usize> {
        const KERNEL: &str = "filter_by_similarity";
        self.check_buffers(&[scores, &*indices])?;
        let values = scores.device_f32()?;
        require(KERNEL, "scores", values.len(), n)?;
        require(KERNEL, "indices", indices.len(), n)?;
        let values = &values[..n];

        let out = indices.device_u32_mut()?;
        let count = self.dispatch(KERNEL, |group| {
            let counter = AtomicU32::new(0);
            let blocks: Vec<(usize, Vec<u32>)> = values
                .par_chunks(group)
                .enumerate()
                .map(|(group_id, chunk)| {
                    let base = group_id * group;
                    let matches: Vec<u32> = chunk
                        .iter()
                        .enumerate()
                        .filter(|&(_, &score)| score >= threshold)
                        .map(|(offset, _)| (base + offset) as u32)
                        .collect();
                    let slot = counter.fetch_add(matches.len() as u32, Ordering::Relaxed);
                    (slot as usize, matches)
                })
                .collect();

            for (slot, matches) in blocks {
                out[slot..slot + matches.len()].copy_from_slice(&matches);
            }
            Ok(counter.load(Ordering::Relaxed) as usize)
        })?;
        indices.sync_to_host(0..count);
        Ok(count)
    }

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
    ) -> ComputeResult<()> {
        const KERNEL: &str = "matrix_multiply";
        self.check_buffers(&[a, b, &*c])?;
        let lhs = a.device_f32()?;
        let rhs = b.device_f32()?;
        let out_len = elements(KERNEL, m, n)?;
        require(KERNEL, "A", lhs.len(), elements(KERNEL, m, k)?)?;
        require(KERNEL, "B", rhs.len(), elements(KERNEL, k, n)?)?;
        require(KERNEL, "C", c.len(), out_len)?;

        let out = c.device_f32_mut()?;
        self.dispatch(KERNEL, |_| {
            matrix::gemm(lhs, rhs, out, m, n, k, alpha, beta).map_err(|e| {
                ComputeError::KernelFailed {
                    kernel: KERNEL,
                    diagnostic: e.to_string(),
                }
            })
        })?;
        self.shared
            .counters
            .matrix_dispatches
            .fetch_add(1, Ordering::Relaxed);
        c.sync_to_host(0..out_len);
        Ok(())
    }

    fn matrix_vector_multiply(
        &self,
        a: &Buffer<'_>,
        x: &Buffer<'_>,
        y: &mut Buffer<'_>,
        m: usize,
        n: usize,
        alpha: f32,
        beta: f32,
    ) -> ComputeResult<()> {
        const KERNEL: &str = "matrix_vector_multiply";
        self.check_buffers(&[a, x, &*y])?;
        let matrix_data = a.device_f32()?;
        let vector = x.device_f32()?;
        require(KERNEL, "A", matrix_data.len(), elements(KERNEL, m, n)?)?;
        require(KERNEL, "x", vector.len(), n)?;
        require(KERNEL, "y", y.len(), m)?;

        let out = y.device_f32_mut()?;
        self.dispatch(KERNEL, |_| {
            matrix::gemv(matrix_data, vector, out, m, n, alpha, beta).map_err(|e| {
                ComputeError::KernelFailed {
                    kernel: KERNEL,
                    diagnostic: e.to_string(),
                }
            })
        })?;
        self.shared
            .counters
            .matrix_dispatches
            .fetch_add(1, Ordering::Relaxed);
        y.sync_to_host(0..m);
        Ok(())
    }

    fn batch_cosine_similarity(
        &self,
        embeddings: &Buffer<'_>,
        query: &Buffer<'_>,
        scores: &mut Buffer<'_>,
        n: usize,
        dims: usize,
    ) -> ComputeResult<()> {
        require_dims("batch_cosine_similarity", dims)?;
        self.matrix_vector_multiply(embeddings, query, scores, n, dims, 1.0, 0.0)
    }

    fn search(
        &self,
        embeddings: &[f32],
        query: &[f32],
        n: usize,
        dims: usize,
        k: usize,
        normalized: bool,
    ) -> ComputeResult<Vec<SearchResult>> {
        search::orchestrate(self, embeddings, query, n, dims, k, normalized)
    }

    fn stats(&self) -> ComputeStats {
        let counters = &self.shared.counters;
        let executions = counters.kernel_executions.load(Ordering::Relaxed);
        let total_ns = counters.kernel_time_ns.load(Ordering::Relaxed);
        ComputeStats {
            kernel_executions: executions,
            kernel_failures: counters.kernel_failures.load(Ordering::Relaxed),
            searches: counters.searches.load(Ordering::Relaxed),
            matrix_dispatches: counters.matrix_dispatches.load(Ordering::Relaxed),
            bytes_transferred: counters.bytes_transferred.load(Ordering::Relaxed),
            average_kernel_time_ns: total_ns.checked_div(executions).unwrap_or(0),
        }
    }

    fn release(&self) {
        let mut memory = self.shared.memory.lock();
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            live_buffers = memory.live_buffers,
            allocated = memory.allocated,
            "releasing compute device"
        );
        memory.allocated = 0;
        memory.live_buffers = 0;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.release();
    }
}

/// Logs the start-up banner for a device.
pub fn log_device_info(device: &dyn Accelerator) {
    let info = device.info();
    tracing::info!(
        backend = %info.backend,
        compute_units = info.compute_units,
        max_threads_per_group = info.max_threads_per_group,
        total_memory_mb = info.total_memory / MIB,
        max_buffer_mb = info.max_buffer_length / MIB,
        unified_memory = info.unified_memory,
        supports_matrix = info.supports_matrix,
        "compute device ready: {}",
        info.name
    );
}
