//! Plain data types exchanged with a compute device.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Score written into unused top-k slots. Strictly below any cosine similarity.
pub const SENTINEL_SCORE: f32 = f32::MIN;

/// Index written into unused top-k slots.
pub const SENTINEL_INDEX: u32 = u32::MAX;

/// How buffer memory is shared between host and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// One copy visible to both host and device (unified memory).
    Shared,
    /// Separate host mirror and device copy; host edits reach the device
    /// only through an explicit modified-range notification.
    Managed,
    /// Device-only memory. The host can neither read nor write it.
    Private,
}

impl StorageMode {
    /// Whether the host may read or write the buffer contents.
    #[must_use]
    pub fn host_visible(self) -> bool {
        !matches!(self, StorageMode::Private)
    }
}

/// Compute backend behind an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Dedicated host thread pool acting as the compute device.
    Host,
    /// No compute device; every constructor reports unavailability.
    None,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Host => f.write_str("host"),
            Backend::None => f.write_str("none"),
        }
    }
}

/// Identity and capabilities of a compute device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub backend: Backend,
    pub total_memory: u64,
    pub available_memory: u64,
    pub max_buffer_length: u64,
    pub max_threads_per_group: u32,
    pub compute_units: u32,
    pub unified_memory: bool,
    pub supports_matrix: bool,
}

/// Snapshot of device memory accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub allocated: u64,
    pub peak: u64,
    pub available: u64,
    pub live_buffers: u64,
}

/// One entry of a top-k result: position in the scored set and its score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchResult {
    pub index: u32,
    pub score: f32,
}

/// Usage counters of a compute device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ComputeStats {
    pub kernel_executions: u64,
    pub kernel_failures: u64,
    pub searches: u64,
    pub matrix_dispatches: u64,
    pub bytes_transferred: u64,
    pub average_kernel_time_ns: u64,
}
