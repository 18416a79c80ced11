//! Clustering-assisted search.
//!
//! - [`kmeans`]: cosine k-means with k-means++ seeding
//! - [`snapshot`]: immutable published cluster index
//! - [`dispatcher`]: brute-force vs clustered routing and clustering passes
//! - [`scheduler`]: periodic background re-clustering
//! - [`async_search`]: bounded async search with deadlines

pub mod async_search;
pub mod dispatcher;
pub mod kmeans;
pub mod scheduler;
pub mod snapshot;

pub use async_search::AsyncSearcher;
pub use dispatcher::{
    ClusteringParams, Dispatcher, DispatcherState, DispatcherStats, DispatcherStatus,
    ExecutionBackend, FallbackReason, SearchDiagnostics, SearchMode, SearchOutcome,
};
pub use kmeans::{
    ClusteringError, KMeansParams, KMeansResult, assign_to_nearest_centroid, kmeans_clustering,
};
pub use scheduler::ClusterScheduler;
pub use snapshot::{Cluster, ClusterIndex, ClusterSummary};
