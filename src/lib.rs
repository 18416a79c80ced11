//! Embedding similarity search with a pluggable compute device and
//! background clustering.
//!
//! - [`compute`]: device abstraction, buffers and similarity kernels
//! - [`index`]: in-memory embedding corpus
//! - [`cluster`]: k-means snapshots and the brute-force / clustered dispatcher
//! - [`config`]: layered settings

pub mod cluster;
pub mod compute;
pub mod config;
pub mod error;
pub mod index;
pub mod io;
pub mod types;

// Explicit exports for better API clarity
pub use cluster::{
    AsyncSearcher, ClusterScheduler, ClusteringParams, Dispatcher, DispatcherStatus,
    FallbackReason, SearchDiagnostics, SearchMode, SearchOutcome,
};
pub use compute::{Accelerator, Backend, Buffer, StorageMode, probe, probe_or_unavailable};
pub use config::Settings;
pub use error::{AdminError, ComputeError, ComputeResult, IndexError, SearchError};
pub use index::EmbeddingIndex;
pub use types::{ClusterId, NodeId, ScoredNode, VectorDimension};
