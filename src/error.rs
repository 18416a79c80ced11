//! Error types for the vector search engine
//!
//! This module provides structured error types using thiserror for better
//! error handling and actionable error messages.

use thiserror::Error;

use crate::cluster::ClusteringError;

/// Errors raised by a compute device, its buffers and its kernels.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    /// No compute device exists on this platform or configuration
    #[error("compute device unavailable: {reason}")]
    Unavailable { reason: String },

    /// Acceleration is switched off in the configuration
    #[error("compute acceleration is disabled by configuration")]
    Disabled,

    #[error("buffer allocation of {requested} bytes failed: {reason}")]
    AllocationFailed { requested: usize, reason: String },

    #[error("kernel '{kernel}' failed: {diagnostic}")]
    KernelFailed {
        kernel: &'static str,
        diagnostic: String,
    },

    /// The buffer was released, or its device was released
    #[error("invalid buffer: it has been released or its device is gone")]
    InvalidBuffer,

    #[error("cannot create an empty buffer")]
    EmptyBuffer,

    #[error("write of {len} elements at offset {offset} exceeds buffer of {capacity} elements")]
    WriteOutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("read of {count} elements exceeds buffer of {capacity} elements")]
    ReadOutOfBounds { count: usize, capacity: usize },

    #[error("buffer uses private storage and cannot be accessed from the host")]
    HostAccessDenied,

    #[error("no-copy buffers require shared storage mode")]
    NoCopyRequiresShared,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl ComputeError {
    /// Shorthand for an unavailable device with a reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Whether the caller can recover by switching to the CPU path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Disabled)
    }

    /// Get a stable status code for this error type.
    pub fn status_code(&self) -> String {
        match self {
            Self::Unavailable { .. } => "COMPUTE_UNAVAILABLE",
            Self::Disabled => "COMPUTE_DISABLED",
            Self::AllocationFailed { .. } => "ALLOCATION_FAILED",
            Self::KernelFailed { .. } => "KERNEL_FAILED",
            Self::InvalidBuffer => "INVALID_BUFFER",
            Self::EmptyBuffer => "EMPTY_BUFFER",
            Self::WriteOutOfBounds { .. } => "WRITE_OUT_OF_BOUNDS",
            Self::ReadOutOfBounds { .. } => "READ_OUT_OF_BOUNDS",
            Self::HostAccessDenied => "HOST_ACCESS_DENIED",
            Self::NoCopyRequiresShared => "NO_COPY_REQUIRES_SHARED",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Unavailable { .. } | Self::Disabled => vec![
                "Searches continue on the CPU scalar path",
                "Set compute.enabled = true to attempt acceleration",
            ],
            Self::AllocationFailed { .. } => vec![
                "Raise compute.memory_limit_mb or compute.max_buffer_mb",
                "Retry the search once concurrent searches have finished",
            ],
            Self::KernelFailed { .. } => vec![
                "The search failed closed; retrying the whole search is safe",
            ],
            Self::InvalidBuffer => vec![
                "Buffers must not be used after release() or after the device is released",
            ],
            Self::HostAccessDenied => vec![
                "Use StorageMode::Shared or StorageMode::Managed for buffers read by the host",
            ],
            Self::NoCopyRequiresShared => vec!["Use StorageMode::Shared for no-copy buffers"],
            _ => vec![],
        }
    }
}

/// Errors raised by the embedding corpus.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all vectors use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error("Batch length mismatch: {ids} ids for {vectors} vectors")]
    LengthMismatch { ids: usize, vectors: usize },

    #[error(
        "Serialized index is corrupt: {reason}\nSuggestion: Re-export the index from a running instance"
    )]
    Corrupt { reason: String },
}

/// Errors surfaced to callers of a search.
///
/// Clustering failures never appear here: they degrade to brute force.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("query dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("search deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("search worker failed: {0}")]
    Worker(String),
}

impl SearchError {
    /// Get a stable status code for this error type.
    pub fn status_code(&self) -> String {
        match self {
            Self::DimensionMismatch { .. } => "QUERY_DIMENSION_MISMATCH".to_string(),
            Self::Compute(e) => e.status_code(),
            Self::Index(_) => "INDEX_ERROR".to_string(),
            Self::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED".to_string(),
            Self::Worker(_) => "WORKER_FAILED".to_string(),
        }
    }
}

/// Errors returned by the administrative clustering operation.
#[derive(Error, Debug)]
pub enum AdminError {
    #[error(transparent)]
    Clustering(#[from] ClusteringError),

    #[error("a clustering pass is already running")]
    AlreadyRunning,
}

/// Result type alias for compute operations
pub type ComputeResult<T> = Result<T, ComputeError>;
