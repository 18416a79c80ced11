//! Clustering-assisted search dispatcher.
//!
//! The dispatcher owns the embedding corpus and the published
//! [`ClusterIndex`], and decides per search whether to score the whole
//! corpus (brute force) or only the members of the clusters nearest to the
//! query. Every search records why it was served the way it was.
//!
//! # Consistency
//! Corpus mutations and index publication both take the corpus write lock.
//! A search loads the snapshot and copies its candidate rows while holding
//! the read lock, then scores the copy after releasing it. A search
//! therefore sees a published index together with exactly the embeddings
//! inserted after that index was built, and a waiting publish only ever
//! waits for candidate gathering.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::kmeans::{ClusteringError, KMeansParams, kmeans_clustering};
use super::snapshot::{ClusterIndex, ClusterSummary};
use crate::compute::{self, Accelerator, SearchResult};
use crate::config::Settings;
use crate::error::{AdminError, ComputeError, IndexError, SearchError};
use crate::index::EmbeddingIndex;
use crate::types::{NodeId, ScoredNode, VectorDimension};

/// How a search was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Clustered,
    BruteForce,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Clustered => f.write_str("clustered"),
            SearchMode::BruteForce => f.write_str("brute_force"),
        }
    }
}

/// Why a search did not use the cluster shortlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Corpus is below the clustering threshold
    TooFewEmbeddings,
    /// No cluster index has been published yet
    NotYetClustered,
    /// The shortlist produced no candidates
    BruteForceFallback,
    /// Acceleration is gated off by configuration
    AccelerationDisabled,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FallbackReason::TooFewEmbeddings => "too_few_embeddings",
            FallbackReason::NotYetClustered => "not_yet_clustered",
            FallbackReason::BruteForceFallback => "brute_force_fallback",
            FallbackReason::AccelerationDisabled => "acceleration_disabled",
        };
        f.write_str(name)
    }
}

/// Where the scoring kernels ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    /// The compute device
    Device,
    /// Scalar kernels on the calling thread
    Cpu,
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionBackend::Device => f.write_str("device"),
            ExecutionBackend::Cpu => f.write_str("cpu"),
        }
    }
}

/// Observability record attached to every search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchDiagnostics {
    pub mode: SearchMode,
    pub fallback_reason: Option<FallbackReason>,
    /// Embeddings actually scored
    pub candidates: usize,
    pub clusters_searched: usize,
    pub backend: ExecutionBackend,
    pub duration: Duration,
}

/// Ranked results plus how they were produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<ScoredNode>,
    pub diagnostics: SearchDiagnostics,
}

/// Lifecycle of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    /// No usable cluster index; searches are brute force
    Idle,
    /// A clustering pass is running
    Clustering,
    /// A cluster index is published and the corpus is above the threshold
    Ready,
}

/// Parameters of an administrative clustering run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClusteringParams {
    /// Cluster count; 0 derives it from the corpus size
    pub k: usize,
    pub max_iterations: usize,
    pub tolerance: f32,
}

/// Monotonic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub searches: u64,
    pub clustered_searches: u64,
    pub brute_force_searches: u64,
    pub cpu_searches: u64,
    pub clustering_runs: u64,
    pub clustering_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    searches: AtomicU64,
    clustered_searches: AtomicU64,
    brute_force_searches: AtomicU64,
    cpu_searches: AtomicU64,
    clustering_runs: AtomicU64,
    clustering_failures: AtomicU64,
}

/// Read-only view returned by [`Dispatcher::status`].
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub state: DispatcherState,
    /// Mode the next search would use
    pub mode: SearchMode,
    pub corpus_size: usize,
    pub threshold: usize,
    pub acceleration_enabled: bool,
    pub backend: compute::Backend,
    pub clusters: usize,
    /// Embeddings inserted since the last published pass
    pub pending_embeddings: usize,
    pub last_clustering_duration: Option<Duration>,
    pub last_clustered_at: Option<DateTime<Utc>>,
    pub last_clustering_error: Option<String>,
    pub last_search: Option<SearchDiagnostics>,
    pub stats: DispatcherStats,
}

struct Corpus {
    embeddings: EmbeddingIndex,
    /// Bumped by every mutation
    seq: u64,
    /// Bumped by `clear`; passes started in an older epoch are discarded
    epoch: u64,
    /// Ids written after the published pass, with the seq of their last write
    pending: HashMap<NodeId, u64>,
}

/// Resets the in-progress flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Chooses between brute-force and clustered search and runs background
/// clustering passes.
pub struct Dispatcher {
    settings: Settings,
    accelerator: Arc<dyn Accelerator>,
    corpus: RwLock<Corpus>,
    index: ArcSwapOption<ClusterIndex>,
    /// Runtime acceleration gate, seeded from `compute.enabled`
    accelerated: AtomicBool,
    clustering: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_search: Mutex<Option<SearchDiagnostics>>,
    counters: Counters,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("accelerator", &self.accelerator)
            .field("corpus_size", &self.len())
            .field("clustered", &self.index.load().is_some())
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over an empty corpus.
    pub fn new(settings: Settings, accelerator: Arc<dyn Accelerator>) -> Result<Self, IndexError> {
        let dimension = VectorDimension::new(settings.index.dimensions)?;
        let embeddings = EmbeddingIndex::with_capacity(
            dimension,
            settings.index.normalize,
            settings.index.initial_capacity,
        );

        Ok(Self {
            accelerated: AtomicBool::new(settings.compute.enabled),
            settings,
            accelerator,
            corpus: RwLock::new(Corpus {
                embeddings,
                seq: 0,
                epoch: 0,
                pending: HashMap::new(),
            }),
            index: ArcSwapOption::empty(),
            clustering: AtomicBool::new(false),
            last_error: Mutex::new(None),
            last_search: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    /// Probes for a compute device and creates the dispatcher.
    pub fn from_settings(settings: Settings) -> Result<Self, SearchError> {
        let accelerator = compute::probe(&settings.compute)?;
        Ok(Self::new(settings, accelerator)?)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accelerator
    }

    pub fn dimension(&self) -> usize {
        self.settings.index.dimensions
    }

    /// Currently published cluster index.
    pub fn cluster_index(&self) -> Option<Arc<ClusterIndex>> {
        self.index.load_full()
    }

    // --- corpus mutations ---

    /// Inserts or replaces an embedding. Returns `true` when the id was new.
    pub fn insert(&self, id: NodeId, vector: &[f32]) -> Result<bool, IndexError> {
        let mut corpus = self.corpus.write();
        let inserted = corpus.embeddings.add(id.clone(), vector)?;
        corpus.seq += 1;
        let seq = corpus.seq;
        corpus.pending.insert(id, seq);
        Ok(inserted)
    }

    /// Inserts many embeddings; a batch with any bad vector changes nothing.
    pub fn insert_batch(&self, ids: &[NodeId], vectors: &[Vec<f32>]) -> Result<usize, IndexError> {
        let mut corpus = self.corpus.write();
        let inserted = corpus.embeddings.add_batch(ids, vectors)?;
        corpus.seq += 1;
        let seq = corpus.seq;
        for id in ids {
            corpus.pending.insert(id.clone(), seq);
        }
        Ok(inserted)
    }

    /// Removes an embedding. Returns `false` when the id was unknown.
    pub fn remove(&self, id: &NodeId) -> bool {
        let mut corpus = self.corpus.write();
        if !corpus.embeddings.remove(id) {
            return false;
        }
        corpus.seq += 1;
        corpus.pending.remove(id);
        true
    }

    /// Drops every embedding and the published index.
    pub fn clear(&self) {
        let mut corpus = self.corpus.write();
        corpus.embeddings.clear();
        corpus.pending.clear();
        corpus.seq += 1;
        corpus.epoch += 1;
        self.index.store(None);
    }

    pub fn len(&self) -> usize {
        self.corpus.read().embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.corpus.read().embeddings.contains(id)
    }

    /// Encodes the corpus in the [`EmbeddingIndex`] serialized layout.
    pub fn export_embeddings(&self) -> Vec<u8> {
        self.corpus.read().embeddings.serialize()
    }

    /// Replaces the corpus with an exported one.
    ///
    /// Like [`Dispatcher::clear`], the published index is dropped and any
    /// running pass is discarded; the next tick re-clusters. A rejected
    /// buffer leaves the corpus and index untouched.
    pub fn import_embeddings(&self, bytes: &[u8]) -> Result<usize, IndexError> {
        let mut corpus = self.corpus.write();
        let loaded = corpus.embeddings.deserialize(bytes)?;
        corpus.pending.clear();
        corpus.seq += 1;
        corpus.epoch += 1;
        self.index.store(None);
        tracing::info!(embeddings = loaded, "imported embedding corpus");
        Ok(loaded)
    }

    // --- acceleration gate ---

    /// Turns acceleration on or off at runtime.
    ///
    /// While off, searches are brute force on the CPU and scheduled passes
    /// are skipped. The published index is kept and used again once
    /// acceleration is back on.
    pub fn set_acceleration(&self, enabled: bool) {
        let previous = self.accelerated.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            tracing::info!(enabled, "acceleration toggled");
        }
    }

    pub fn is_acceleration_enabled(&self) -> bool {
        self.accelerated.load(Ordering::Acquire)
    }

    // --- search ---

    fn acceleration_enabled(&self) -> bool {
        self.is_acceleration_enabled() && self.settings.clustering.enabled
    }

    /// Finds the `k` embeddings most similar to `query`.
    ///
    /// Clustering problems never fail a search; they only change the mode.
    pub fn search(&self, query: &[f32], k: usize) -> Result<SearchOutcome, SearchError> {
        let start = Instant::now();
        let dims = self.dimension();
        if query.len() != dims {
            return Err(SearchError::DimensionMismatch {
                expected: dims,
                actual: query.len(),
            });
        }

        let (plan, candidates, query, normalized) = {
            let corpus = self.corpus.read();
            let normalized = corpus.embeddings.is_normalized();
            let mut query = query.to_vec();
            if normalized {
                compute::kernels::normalize_in_place(&mut query);
            }
            let plan = self.plan(&corpus, &query);
            let candidates = Candidates::gather(&corpus.embeddings, &plan);
            (plan, candidates, query, normalized)
        };

        let n = candidates.ids.len();
        let (ranked, backend) = self.execute(&candidates.vectors, &query, n, k, normalized)?;
        let results: Vec<ScoredNode> = ranked
            .into_iter()
            .filter_map(|hit| {
                Some(ScoredNode {
                    id: candidates.ids.get(hit.index as usize)?.clone(),
                    score: hit.score,
                })
            })
            .collect();

        let diagnostics = SearchDiagnostics {
            mode: plan.mode(),
            fallback_reason: plan.reason(),
            candidates: n,
            clusters_searched: plan.clusters_searched(),
            backend,
            duration: start.elapsed(),
        };
        self.record(&diagnostics);

        Ok(SearchOutcome {
            results,
            diagnostics,
        })
    }

    fn plan(&self, corpus: &Corpus, query: &[f32]) -> Plan {
        if !self.acceleration_enabled() {
            return Plan::BruteForce {
                reason: FallbackReason::AccelerationDisabled,
            };
        }
        if corpus.embeddings.len() < self.settings.clustering.min_embeddings {
            return Plan::BruteForce {
                reason: FallbackReason::TooFewEmbeddings,
            };
        }
        let Some(index) = self.index.load_full() else {
            return Plan::BruteForce {
                reason: FallbackReason::NotYetClustered,
            };
        };

        let nearest = index.nearest_clusters(query, self.settings.clustering.fan_out.max(1));
        let mut seen = HashSet::new();
        let mut positions = Vec::new();
        let members = nearest.iter().flat_map(|cluster| cluster.members.iter());
        for id in members.chain(corpus.pending.keys()) {
            if let Some(position) = corpus.embeddings.position_of(id) {
                if seen.insert(position) {
                    positions.push(position);
                }
            }
        }

        if positions.is_empty() {
            return Plan::BruteForce {
                reason: FallbackReason::BruteForceFallback,
            };
        }
        Plan::Clustered {
            positions,
            clusters_searched: nearest.len(),
        }
    }

    /// Scores candidates on the device, or on the CPU when the device is
    /// gated off or unavailable.
    fn execute(
        &self,
        vectors: &[f32],
        query: &[f32],
        n: usize,
        k: usize,
        normalized: bool,
    ) -> Result<(Vec<SearchResult>, ExecutionBackend), ComputeError> {
        let dims = query.len();
        if self.is_acceleration_enabled() && self.accelerator.is_available() {
            match self.accelerator.search(vectors, query, n, dims, k, normalized) {
                Ok(results) => return Ok((results, ExecutionBackend::Device)),
                Err(e) if e.is_recoverable() => {
                    tracing::debug!("device unavailable for search, using CPU: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        self.counters.cpu_searches.fetch_add(1, Ordering::Relaxed);
        let results = compute::cpu_search(vectors, query, n, dims, k, normalized)?;
        Ok((results, ExecutionBackend::Cpu))
    }

    fn record(&self, diagnostics: &SearchDiagnostics) {
        self.counters.searches.fetch_add(1, Ordering::Relaxed);
        let by_mode = match diagnostics.mode {
            SearchMode::Clustered => &self.counters.clustered_searches,
            SearchMode::BruteForce => &self.counters.brute_force_searches,
        };
        by_mode.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            mode = %diagnostics.mode,
            fallback_reason = ?diagnostics.fallback_reason,
            candidates = diagnostics.candidates,
            clusters_searched = diagnostics.clusters_searched,
            backend = %diagnostics.backend,
            duration_us = diagnostics.duration.as_micros() as u64,
            "search served"
        );
        *self.last_search.lock() = Some(diagnostics.clone());
    }

    // --- clustering ---

    /// Scheduled re-clustering hook.
    ///
    /// Runs a pass when clustering is enabled, the corpus is above the
    /// threshold and it changed since the published pass. Failures are
    /// logged and retried on the next call. Returns whether a new index was
    /// published.
    pub fn tick(&self) -> bool {
        if !self.acceleration_enabled() {
            return false;
        }

        let (size, seq) = {
            let corpus = self.corpus.read();
            (corpus.embeddings.len(), corpus.seq)
        };
        if size < self.settings.clustering.min_embeddings {
            tracing::trace!(size, "corpus below clustering threshold");
            return false;
        }
        if let Some(index) = self.index.load_full() {
            if index.corpus_seq() == seq {
                return false;
            }
        }

        let clustering = &self.settings.clustering;
        let params = ClusteringParams {
            k: 0,
            max_iterations: clustering.max_iterations,
            tolerance: clustering.tolerance,
        };
        match self.run_pass(&params) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("clustering pass failed, searches stay on the previous index: {e}");
                false
            }
        }
    }

    /// Runs a clustering pass now and publishes it.
    pub fn run_clustering(
        &self,
        params: ClusteringParams,
    ) -> Result<Vec<ClusterSummary>, AdminError> {
        match self.run_pass(&params)? {
            Some(index) => Ok(index.summaries()),
            None => Err(AdminError::AlreadyRunning),
        }
    }

    /// One pass: copy the corpus, cluster off-lock, publish atomically.
    /// Returns `Ok(None)` when another pass is already running.
    fn run_pass(&self, params: &ClusteringParams) -> Result<Option<Arc<ClusterIndex>>, ClusteringError> {
        if self
            .clustering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = PassGuard(&self.clustering);

        let result = self.build_and_publish(params);
        self.counters.clustering_runs.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(_) => *self.last_error.lock() = None,
            Err(e) => {
                self.counters
                    .clustering_failures
                    .fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
        result.map(Some)
    }

    fn build_and_publish(&self, params: &ClusteringParams) -> Result<Arc<ClusterIndex>, ClusteringError> {
        let min = self.settings.clustering.min_embeddings;
        let dims = self.dimension();
        let (ids, vectors, seq, epoch) = {
            let corpus = self.corpus.read();
            let size = corpus.embeddings.len();
            if size == 0 {
                return Err(ClusteringError::EmptyVectorSet);
            }
            if size < min {
                return Err(ClusteringError::CorpusTooSmall { size, min });
            }
            (
                corpus.embeddings.ids().to_vec(),
                corpus.embeddings.vectors().to_vec(),
                corpus.seq,
                corpus.epoch,
            )
        };

        let start = Instant::now();
        let k = if params.k == 0 {
            self.settings.clustering.cluster_count(ids.len())
        } else {
            params.k
        };
        tracing::debug!(k, corpus_size = ids.len(), "starting clustering pass");
        let result = kmeans_clustering(
            &vectors,
            dims,
            &KMeansParams {
                k,
                max_iterations: params.max_iterations,
                tolerance: params.tolerance,
                seed: self.settings.clustering.seed,
            },
        )?;
        let snapshot = Arc::new(ClusterIndex::build(ids, result, seq, start.elapsed()));

        let mut corpus = self.corpus.write();
        if corpus.epoch != epoch {
            return Err(ClusteringError::Superseded);
        }
        corpus.pending.retain(|_, written| *written > seq);
        self.index.store(Some(Arc::clone(&snapshot)));
        let pending = corpus.pending.len();
        drop(corpus);

        tracing::info!(
            clusters = snapshot.len(),
            corpus_size = snapshot.corpus_size(),
            iterations = snapshot.iterations(),
            converged = snapshot.converged(),
            pending,
            duration_ms = snapshot.build_duration().as_millis() as u64,
            "published cluster index"
        );
        Ok(snapshot)
    }

    // --- status ---

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.counters;
        DispatcherStats {
            searches: c.searches.load(Ordering::Relaxed),
            clustered_searches: c.clustered_searches.load(Ordering::Relaxed),
            brute_force_searches: c.brute_force_searches.load(Ordering::Relaxed),
            cpu_searches: c.cpu_searches.load(Ordering::Relaxed),
            clustering_runs: c.clustering_runs.load(Ordering::Relaxed),
            clustering_failures: c.clustering_failures.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> DispatcherStatus {
        let (corpus_size, pending_embeddings) = {
            let corpus = self.corpus.read();
            (corpus.embeddings.len(), corpus.pending.len())
        };
        let index = self.index.load_full();
        let threshold = self.settings.clustering.min_embeddings;
        let ready = index.is_some() && corpus_size >= threshold && self.acceleration_enabled();

        let state = if self.clustering.load(Ordering::Acquire) {
            DispatcherState::Clustering
        } else if ready {
            DispatcherState::Ready
        } else {
            DispatcherState::Idle
        };

        DispatcherStatus {
            state,
            mode: if ready {
                SearchMode::Clustered
            } else {
                SearchMode::BruteForce
            },
            corpus_size,
            threshold,
            acceleration_enabled: self.is_acceleration_enabled(),
            backend: self.accelerator.backend(),
            clusters: index.as_ref().map_or(0, |i| i.len()),
            pending_embeddings,
            last_clustering_duration: index.as_ref().map(|i| i.build_duration()),
            last_clustered_at: index.as_ref().map(|i| i.built_at()),
            last_clustering_error: self.last_error.lock().clone(),
            last_search: self.last_search.lock().clone(),
            stats: self.stats(),
        }
    }
}

/// Rows a search scores, copied out of the corpus.
struct Candidates {
    ids: Vec<NodeId>,
    vectors: Vec<f32>,
}

impl Candidates {
    fn gather(embeddings: &EmbeddingIndex, plan: &Plan) -> Self {
        match plan {
            Plan::BruteForce { .. } => Self {
                ids: embeddings.ids().to_vec(),
                vectors: embeddings.vectors().to_vec(),
            },
            Plan::Clustered { positions, .. } => {
                let dims = embeddings.dimension().get();
                let mut ids = Vec::with_capacity(positions.len());
                let mut vectors = Vec::with_capacity(positions.len() * dims);
                for &position in positions {
                    if let Some(id) = embeddings.id_at(position) {
                        ids.push(id.clone());
                        vectors.extend_from_slice(embeddings.row(position));
                    }
                }
                Self { ids, vectors }
            }
        }
    }
}

enum Plan {
    BruteForce {
        reason: FallbackReason,
    },
    Clustered {
        positions: Vec<usize>,
        clusters_searched: usize,
    },
}

impl Plan {
    fn mode(&self) -> SearchMode {
        match self {
            Plan::BruteForce { .. } => SearchMode::BruteForce,
            Plan::Clustered { .. } => SearchMode::Clustered,
        }
    }

    fn reason(&self) -> Option<FallbackReason> {
        match self {
            Plan::BruteForce { reason } => Some(*reason),
            Plan::Clustered { .. } => None,
        }
    }

    fn clusters_searched(&self) -> usize {
        match self {
            Plan::BruteForce { .. } => 0,
            Plan::Clustered {
                clusters_searched, ..
            } => *clusters_searched,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{OnceLock, Weak};

    use super::*;
    use crate::compute::{Buffer, Device, DeviceOptions, StorageMode, UnavailableDevice};
    use crate::error::ComputeResult;

    fn settings(dims: usize, min_embeddings: usize) -> Settings {
        let mut settings = Settings::default();
        settings.index.dimensions = dims;
        settings.index.initial_capacity = 0;
        settings.clustering.min_embeddings = min_embeddings;
        settings.clustering.seed = Some(11);
        settings
    }

    fn host() -> Arc<dyn Accelerator> {
        Arc::new(Device::new(DeviceOptions::default()).unwrap())
    }

    /// Points on a few well separated directions.
    fn populate(dispatcher: &Dispatcher, count: usize) {
        let dims = dispatcher.dimension();
        for i in 0..count {
            let mut vector = vec![0.01; dims];
            vector[i % dims] = 1.0;
            vector[(i / dims) % dims] += 0.2;
            dispatcher.insert(NodeId::new(format!("n{i}")), &vector).unwrap();
        }
    }

    #[test]
    fn test_below_threshold_is_brute_force() {
        let dispatcher = Dispatcher::new(settings(4, 10), host()).unwrap();
        populate(&dispatcher, 5);

        let outcome = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(outcome.diagnostics.mode, SearchMode::BruteForce);
        assert_eq!(
            outcome.diagnostics.fallback_reason,
            Some(FallbackReason::TooFewEmbeddings)
        );
        assert_eq!(outcome.diagnostics.candidates, 5);
        assert_eq!(outcome.diagnostics.backend, ExecutionBackend::Device);
        assert_eq!(outcome.results.len(), 3);
        assert!(!dispatcher.tick());
    }

    #[test]
    fn test_not_yet_clustered_then_clustered() {
        let dispatcher = Dispatcher::new(settings(4, 20), host()).unwrap();
        populate(&dispatcher, 40);

        let outcome = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap();
        assert_eq!(
            outcome.diagnostics.fallback_reason,
            Some(FallbackReason::NotYetClustered)
        );
        assert_eq!(dispatcher.status().state, DispatcherState::Idle);

        assert!(dispatcher.tick());
        // Nothing changed since the pass
        assert!(!dispatcher.tick());
        assert_eq!(dispatcher.status().state, DispatcherState::Ready);

        let outcome = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap();
        assert_eq!(outcome.diagnostics.mode, SearchMode::Clustered);
        assert!(outcome.diagnostics.fallback_reason.is_none());
        assert!(outcome.diagnostics.clusters_searched > 0);
        assert!(outcome.diagnostics.candidates <= 40);
        assert_eq!(outcome.results.len(), 5);
    }

    #[test]
    fn test_inserted_after_pass_is_searchable() {
        let dispatcher = Dispatcher::new(settings(4, 20), host()).unwrap();
        populate(&dispatcher, 40);
        assert!(dispatcher.tick());

        let late = NodeId::new("late");
        dispatcher.insert(late.clone(), &[0.0, 0.0, -1.0, 0.0]).unwrap();
        assert_eq!(dispatcher.status().pending_embeddings, 1);

        let outcome = dispatcher.search(&[0.0, 0.0, -1.0, 0.0], 1).unwrap();
        assert_eq!(outcome.diagnostics.mode, SearchMode::Clustered);
        assert_eq!(outcome.results[0].id, late);

        // The next pass absorbs it
        assert!(dispatcher.tick());
        assert_eq!(dispatcher.status().pending_embeddings, 0);
    }

    #[test]
    fn test_removed_member_is_not_returned() {
        let dispatcher = Dispatcher::new(settings(4, 20), host()).unwrap();
        populate(&dispatcher, 40);
        assert!(dispatcher.tick());

        let best = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap().results[0]
            .id
            .clone();
        assert!(dispatcher.remove(&best));
        let outcome = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 40).unwrap();
        assert!(outcome.results.iter().all(|hit| hit.id != best));
    }

    #[test]
    fn test_acceleration_gate() {
        let mut settings = settings(4, 1);
        settings.compute.enabled = false;
        let dispatcher =
            Dispatcher::new(settings, Arc::new(UnavailableDevice::disabled())).unwrap();
        populate(&dispatcher, 10);

        assert!(!dispatcher.tick());
        let outcome = dispatcher.search(&[0.0, 1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(
            outcome.diagnostics.fallback_reason,
            Some(FallbackReason::AccelerationDisabled)
        );
        assert_eq!(outcome.diagnostics.backend, ExecutionBackend::Cpu);
        assert_eq!(dispatcher.stats().cpu_searches, 1);
    }

    #[test]
    fn test_unavailable_device_uses_cpu() {
        let dispatcher = Dispatcher::new(
            settings(4, 100),
            Arc::new(UnavailableDevice::new("no device")),
        )
        .unwrap();
        populate(&dispatcher, 8);
        let outcome = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(outcome.diagnostics.backend, ExecutionBackend::Cpu);
        assert_eq!(outcome.results.len(), 2);
    }

    #[test]
    fn test_query_dimension_checked() {
        let dispatcher = Dispatcher::new(settings(4, 10), host()).unwrap();
        assert!(matches!(
            dispatcher.search(&[1.0, 0.0], 1),
            Err(SearchError::DimensionMismatch {
                expected: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_admin_clustering() {
        let dispatcher = Dispatcher::new(settings(4, 20), host()).unwrap();
        populate(&dispatcher, 10);

        let params = ClusteringParams {
            k: 4,
            max_iterations: 50,
            tolerance: 1e-4,
        };
        assert!(matches!(
            dispatcher.run_clustering(params),
            Err(AdminError::Clustering(ClusteringError::CorpusTooSmall {
                size: 10,
                min: 20
            }))
        ));
        assert_eq!(dispatcher.stats().clustering_failures, 1);
        assert!(dispatcher.status().last_clustering_error.is_some());

        populate(&dispatcher, 30);
        let summaries = dispatcher.run_clustering(params).unwrap();
        assert_eq!(summaries.len(), 4);
        assert_eq!(summaries.iter().map(|s| s.size).sum::<usize>(), 30);

        let status = dispatcher.status();
        assert_eq!(status.clusters, 4);
        assert!(status.last_clustering_duration.is_some());
        assert!(status.last_clustering_error.is_none());
    }

    #[test]
    fn test_failed_pass_keeps_previous_index() {
        let dispatcher = Dispatcher::new(settings(4, 20), host()).unwrap();
        populate(&dispatcher, 40);
        assert!(dispatcher.tick());
        let before = dispatcher.cluster_index().unwrap();

        let err = dispatcher.run_clustering(ClusteringParams {
            k: 1_000,
            max_iterations: 10,
            tolerance: 1e-4,
        });
        assert!(matches!(
            err,
            Err(AdminError::Clustering(ClusteringError::InvalidClusterCount(1_000)))
        ));
        let after = dispatcher.cluster_index().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_clear_drops_index() {
        let dispatcher = Dispatcher::new(settings(4, 20), host()).unwrap();
        populate(&dispatcher, 40);
        assert!(dispatcher.tick());
        dispatcher.clear();
        assert!(dispatcher.is_empty());
        assert!(dispatcher.cluster_index().is_none());
        assert_eq!(dispatcher.status().state, DispatcherState::Idle);
    }

    #[test]
    fn test_duplicate_heavy_corpus_still_clusters() {
        let dispatcher = Dispatcher::new(settings(8, 1_000), host()).unwrap();
        // 2,000 embeddings over 8 directions, far fewer than sqrt(2000) clusters
        for i in 0..2_000 {
            let mut vector = vec![0.0; 8];
            vector[i % 8] = 1.0;
            dispatcher.insert(NodeId::new(format!("d{i}")), &vector).unwrap();
        }

        assert!(dispatcher.tick());
        let status = dispatcher.status();
        assert!(status.last_clustering_error.is_none());
        assert_eq!(status.clusters, 8);

        let mut query = vec![0.0; 8];
        query[3] = 1.0;
        let outcome = dispatcher.search(&query, 5).unwrap();
        assert_eq!(outcome.diagnostics.mode, SearchMode::Clustered);
        assert!(outcome.diagnostics.fallback_reason.is_none());
        assert!(outcome.results.iter().all(|hit| (hit.score - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_emptied_clusters_fall_back_to_brute_force() {
        let mut settings = settings(4, 5);
        settings.clustering.fan_out = 1;
        let dispatcher = Dispatcher::new(settings, host()).unwrap();
        for i in 0..10 {
            dispatcher.insert(NodeId::new(format!("x{i}")), &[1.0, 0.0, 0.0, 0.0]).unwrap();
            dispatcher.insert(NodeId::new(format!("y{i}")), &[0.0, 1.0, 0.0, 0.0]).unwrap();
        }
        let summaries = dispatcher
            .run_clustering(ClusteringParams {
                k: 2,
                max_iterations: 20,
                tolerance: 1e-4,
            })
            .unwrap();
        assert_eq!(summaries.len(), 2);

        for i in 0..10 {
            assert!(dispatcher.remove(&NodeId::new(format!("x{i}"))));
        }
        let status = dispatcher.status();
        assert_eq!(status.pending_embeddings, 0);
        assert_eq!(status.state, DispatcherState::Ready);

        let outcome = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(outcome.diagnostics.mode, SearchMode::BruteForce);
        assert_eq!(
            outcome.diagnostics.fallback_reason,
            Some(FallbackReason::BruteForceFallback)
        );
        assert_eq!(outcome.diagnostics.candidates, 10);
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results.iter().all(|hit| hit.id.as_str().starts_with('y')));
    }

    #[test]
    fn test_acceleration_toggled_at_runtime() {
        let dispatcher = Dispatcher::new(settings(4, 20), host()).unwrap();
        populate(&dispatcher, 40);
        assert!(dispatcher.is_acceleration_enabled());
        assert!(dispatcher.tick());

        dispatcher.set_acceleration(false);
        assert!(!dispatcher.status().acceleration_enabled);
        let outcome = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(
            outcome.diagnostics.fallback_reason,
            Some(FallbackReason::AccelerationDisabled)
        );
        assert_eq!(outcome.diagnostics.backend, ExecutionBackend::Cpu);
        dispatcher.insert(NodeId::new("late"), &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert!(!dispatcher.tick());

        dispatcher.set_acceleration(true);
        let outcome = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(outcome.diagnostics.mode, SearchMode::Clustered);
        assert_eq!(outcome.diagnostics.backend, ExecutionBackend::Device);
        assert!(dispatcher.tick());
    }

    #[test]
    fn test_export_and_import_corpus() {
        let source = Dispatcher::new(settings(4, 20), host()).unwrap();
        populate(&source, 40);
        let bytes = source.export_embeddings();

        let target = Dispatcher::new(settings(4, 20), host()).unwrap();
        populate(&target, 25);
        assert!(target.tick());
        assert_eq!(target.import_embeddings(&bytes).unwrap(), 40);
        assert_eq!(target.len(), 40);
        assert!(target.cluster_index().is_none());
        assert!(target.contains(&NodeId::new("n39")));

        let query = [0.0, 0.0, 1.0, 0.0];
        let ids = |d: &Dispatcher| -> Vec<NodeId> {
            d.search(&query, 5)
                .unwrap()
                .results
                .into_iter()
                .map(|hit| hit.id)
                .collect()
        };
        assert_eq!(ids(&target), ids(&source));

        let other = Dispatcher::new(settings(8, 20), host()).unwrap();
        assert!(matches!(
            other.import_embeddings(&bytes),
            Err(IndexError::DimensionMismatch {
                expected: 8,
                actual: 4
            })
        ));
        assert!(other.is_empty());
    }

    /// Host device that records whether the corpus write lock was free
    /// while it scored.
    #[derive(Debug)]
    struct LockObservingDevice {
        inner: Device,
        dispatcher: OnceLock<Weak<Dispatcher>>,
        writer_could_enter: AtomicBool,
    }

    impl Accelerator for LockObservingDevice {
        fn is_available(&self) -> bool {
            self.inner.is_available()
        }
        fn backend(&self) -> compute::Backend {
            self.inner.backend()
        }
        fn info(&self) -> compute::DeviceInfo {
            self.inner.info()
        }
        fn memory_info(&self) -> compute::MemoryInfo {
            self.inner.memory_info()
        }
        fn new_buffer(&self, data: &[f32], mode: StorageMode) -> ComputeResult<Buffer<'static>> {
            self.inner.new_buffer(data, mode)
        }
        fn new_buffer_u32(&self, data: &[u32], mode: StorageMode) -> ComputeResult<Buffer<'static>> {
            self.inner.new_buffer_u32(data, mode)
        }
        fn new_buffer_no_copy<'a>(
            &self,
            data: &'a mut [f32],
            mode: StorageMode,
        ) -> ComputeResult<Buffer<'a>> {
            self.inner.new_buffer_no_copy(data, mode)
        }
        fn new_empty_buffer(
            &self,
            size_bytes: usize,
            mode: StorageMode,
        ) -> ComputeResult<Buffer<'static>> {
            self.inner.new_empty_buffer(size_bytes, mode)
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
            self.inner
                .compute_cosine_similarity(embeddings, query, scores, n, dims, normalized)
        }
        fn normalize_vectors(
            &self,
            vectors: &mut Buffer<'_>,
            n: usize,
            dims: usize,
        ) -> ComputeResult<()> {
            self.inner.normalize_vectors(vectors, n, dims)
        }
        fn compute_topk(
            &self,
            scores: &Buffer<'_>,
            indices: &mut Buffer<'_>,
            topk_scores: &mut Buffer<'_>,
            n: usize,
            k: usize,
        ) -> ComputeResult<()> {
            self.inner.compute_topk(scores, indices, topk_scores, n, k)
        }
        fn batch_dot_product(
            &self,
            embeddings: &Buffer<'_>,
            query: &Buffer<'_>,
            out: &mut Buffer<'_>,
            n: usize,
            dims: usize,
        ) -> ComputeResult<()> {
            self.inner.batch_dot_product(embeddings, query, out, n, dims)
        }
        fn euclidean_distance(
            &self,
            embeddings: &Buffer<'_>,
            query: &Buffer<'_>,
            distances: &mut Buffer<'_>,
            n: usize,
            dims: usize,
        ) -> ComputeResult<()> {
            self.inner.euclidean_distance(embeddings, query, distances, n, dims)
        }
        fn filter_by_similarity(
            &self,
            scores: &Buffer<'_>,
            indices: &mut Buffer<'_>,
            n: usize,
            threshold: f32,
        ) -> ComputeResult<usize> {
            self.inner.filter_by_similarity(scores, indices, n, threshold)
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
            self.inner.matrix_multiply(a, b, c, m, n, k, alpha, beta)
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
            self.inner.matrix_vector_multiply(a, x, y, m, n, alpha, beta)
        }
        fn batch_cosine_similarity(
            &self,
            embeddings: &Buffer<'_>,
            query: &Buffer<'_>,
            scores: &mut Buffer<'_>,
            n: usize,
            dims: usize,
        ) -> ComputeResult<()> {
            self.inner
                .batch_cosine_similarity(embeddings, query, scores, n, dims)
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
            if let Some(dispatcher) = self.dispatcher.get().and_then(Weak::upgrade) {
                let free = dispatcher.corpus.try_write().is_some();
                self.writer_could_enter.store(free, Ordering::SeqCst);
            }
            self.inner.search(embeddings, query, n, dims, k, normalized)
        }
        fn stats(&self) -> compute::ComputeStats {
            self.inner.stats()
        }
        fn release(&self) {
            self.inner.release()
        }
    }

    #[test]
    fn test_scoring_runs_outside_the_corpus_lock() {
        let device = Arc::new(LockObservingDevice {
            inner: Device::new(DeviceOptions::default()).unwrap(),
            dispatcher: OnceLock::new(),
            writer_could_enter: AtomicBool::new(false),
        });
        let dispatcher = Arc::new(Dispatcher::new(settings(4, 20), device.clone()).unwrap());
        device.dispatcher.set(Arc::downgrade(&dispatcher)).unwrap();
        populate(&dispatcher, 40);

        dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 3).unwrap();
        assert!(device.writer_could_enter.load(Ordering::SeqCst));

        assert!(dispatcher.tick());
        device.writer_could_enter.store(false, Ordering::SeqCst);
        let outcome = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(outcome.diagnostics.mode, SearchMode::Clustered);
        assert!(device.writer_could_enter.load(Ordering::SeqCst));
    }

    #[test]
    fn test_last_search_recorded() {
        let dispatcher = Dispatcher::new(settings(4, 10), host()).unwrap();
        populate(&dispatcher, 3);
        assert!(dispatcher.status().last_search.is_none());
        dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
        let status = dispatcher.status();
        assert_eq!(status.stats.searches, 1);
        assert_eq!(status.stats.brute_force_searches, 1);
        assert_eq!(status.last_search.unwrap().candidates, 3);
    }
}
