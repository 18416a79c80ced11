//! Configuration module for the vector search engine.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file (`.embedsearch/settings.toml`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `EMBEDSEARCH_` and use double
//! underscores to separate nested levels:
//! - `EMBEDSEARCH_COMPUTE__ENABLED=false` sets `compute.enabled`
//! - `EMBEDSEARCH_CLUSTERING__MIN_EMBEDDINGS=5000` sets `clustering.min_embeddings`
//! - `EMBEDSEARCH_SEARCH__DEADLINE_MS=250` sets `search.deadline_ms`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compute::Backend;
use crate::types::DEFAULT_DIMENSION;

/// Directory holding the workspace configuration.
pub const CONFIG_DIR: &str = ".embedsearch";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "EMBEDSEARCH_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Compute device selection and limits
    #[serde(default)]
    pub compute: ComputeSettings,

    /// Background clustering and shortlist search
    #[serde(default)]
    pub clustering: ClusteringSettings,

    /// Embedding corpus layout
    #[serde(default)]
    pub index: IndexSettings,

    /// Request handling
    #[serde(default)]
    pub search: SearchSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ComputeSettings {
    /// Global acceleration gate. When off every search is brute force on the
    /// CPU path and clustering is never attempted.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_backend")]
    pub preferred_backend: Backend,

    /// Memory the device may hand out across all live buffers
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    /// Largest single buffer
    #[serde(default = "default_max_buffer_mb")]
    pub max_buffer_mb: u64,

    /// Compute worker threads (0 = one per logical CPU)
    #[serde(default)]
    pub threads: usize,

    #[serde(default = "default_threads_per_group")]
    pub threads_per_group: usize,

    /// Candidate count from which normalized searches use the matrix path
    #[serde(default = "default_matrix_threshold")]
    pub matrix_threshold: usize,

    /// Candidate count from which top-k uses the partitioned variant
    #[serde(default = "default_parallel_topk_threshold")]
    pub parallel_topk_threshold: usize,

    /// Use the CPU path when the device cannot be created
    #[serde(default = "default_true")]
    pub fallback_on_error: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ClusteringSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Corpus size below which searches stay brute force
    #[serde(default = "default_min_embeddings")]
    pub min_embeddings: usize,

    /// Number of clusters (0 = square root of the corpus size)
    #[serde(default)]
    pub num_clusters: usize,

    /// Upper bound for the automatic cluster count
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Mean centroid movement below which k-means stops
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,

    /// Seconds between scheduled re-clustering checks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Clusters searched per query
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,

    /// Fixed seed for reproducible centroid initialization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexSettings {
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Embeddings to reserve room for up front
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,

    /// Store vectors at unit length so searches can use plain dot products
    #[serde(default = "default_true")]
    pub normalize: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchSettings {
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Searches allowed to run at once through the async front end
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    /// Per-request deadline (0 = none)
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingSettings {
    /// One of trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_backend() -> Backend {
    Backend::Host
}
fn default_memory_limit_mb() -> u64 {
    2048
}
fn default_max_buffer_mb() -> u64 {
    1024
}
fn default_threads_per_group() -> usize {
    256
}
fn default_matrix_threshold() -> usize {
    1_000
}
fn default_parallel_topk_threshold() -> usize {
    10_000
}
fn default_min_embeddings() -> usize {
    1_000
}
fn default_max_clusters() -> usize {
    256
}
fn default_max_iterations() -> usize {
    100
}
fn default_tolerance() -> f32 {
    1e-4
}
fn default_interval_secs() -> u64 {
    60
}
fn default_fan_out() -> usize {
    3
}
fn default_dimensions() -> usize {
    DEFAULT_DIMENSION
}
fn default_initial_capacity() -> usize {
    10_000
}
fn default_k() -> usize {
    10
}
fn default_max_inflight() -> usize {
    num_cpus::get().max(1)
}
fn default_deadline_ms() -> u64 {
    5_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            compute: ComputeSettings::default(),
            clustering: ClusteringSettings::default(),
            index: IndexSettings::default(),
            search: SearchSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            preferred_backend: default_backend(),
            memory_limit_mb: default_memory_limit_mb(),
            max_buffer_mb: default_max_buffer_mb(),
            threads: 0,
            threads_per_group: default_threads_per_group(),
            matrix_threshold: default_matrix_threshold(),
            parallel_topk_threshold: default_parallel_topk_threshold(),
            fallback_on_error: true,
        }
    }
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_embeddings: default_min_embeddings(),
            num_clusters: 0,
            max_clusters: default_max_clusters(),
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            interval_secs: default_interval_secs(),
            fan_out: default_fan_out(),
            seed: None,
        }
    }
}

impl ClusteringSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Cluster count for a corpus of `corpus_size` embeddings.
    pub fn cluster_count(&self, corpus_size: usize) -> usize {
        let k = if self.num_clusters > 0 {
            self.num_clusters
        } else {
            (corpus_size as f64).sqrt().ceil() as usize
        };
        k.clamp(1, self.max_clusters.max(1)).min(corpus_size.max(1))
    }
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            initial_capacity: default_initial_capacity(),
            normalize: true,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_inflight: default_max_inflight(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

impl SearchSettings {
    /// Deadline applied to each async request, if any.
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_ms > 0).then(|| Duration::from_millis(self.deadline_ms))
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Environment provider: `EMBEDSEARCH_A__B` sets `a.b`.
fn env_provider() -> Env {
    Env::prefixed(ENV_PREFIX).map(|key| key.as_str().to_lowercase().replace("__", ".").into())
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(env_provider())
            .extract()
            .map_err(Box::new)
    }

    /// Find the workspace config by looking for the config directory,
    /// searching from the current directory up to the root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        current
            .ancestors()
            .map(|ancestor| ancestor.join(CONFIG_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join("settings.toml"))
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(
        dir: impl AsRef<Path>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = dir.as_ref().join(CONFIG_DIR).join("settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let defaults = Settings::default();
        let template = format!(
            r#"# embedsearch configuration
# Environment overrides: EMBEDSEARCH_<SECTION>__<KEY>, e.g. EMBEDSEARCH_COMPUTE__ENABLED=false

version = {version}

[compute]
# Global acceleration gate; when false every search is brute force on the CPU
enabled = {enabled}
# "host" or "none"
preferred_backend = "host"
memory_limit_mb = {memory_limit_mb}
max_buffer_mb = {max_buffer_mb}
# Compute worker threads (0 = one per logical CPU)
threads = 0
threads_per_group = {threads_per_group}
matrix_threshold = {matrix_threshold}
parallel_topk_threshold = {parallel_topk_threshold}
fallback_on_error = true

[clustering]
enabled = true
# Searches stay brute force below this corpus size
min_embeddings = {min_embeddings}
# 0 = square root of the corpus size, capped at max_clusters
num_clusters = 0
max_clusters = {max_clusters}
max_iterations = {max_iterations}
tolerance = {tolerance}
interval_secs = {interval_secs}
# Nearest clusters searched per query
fan_out = {fan_out}
# seed = 42

[index]
dimensions = {dimensions}
initial_capacity = {initial_capacity}
normalize = true

[search]
default_k = {default_k}
max_inflight = {max_inflight}
# 0 disables the deadline
deadline_ms = {deadline_ms}

[logging]
level = "{level}"
"#,
            version = defaults.version,
            enabled = defaults.compute.enabled,
            memory_limit_mb = defaults.compute.memory_limit_mb,
            max_buffer_mb = defaults.compute.max_buffer_mb,
            threads_per_group = defaults.compute.threads_per_group,
            matrix_threshold = defaults.compute.matrix_threshold,
            parallel_topk_threshold = defaults.compute.parallel_topk_threshold,
            min_embeddings = defaults.clustering.min_embeddings,
            max_clusters = defaults.clustering.max_clusters,
            max_iterations = defaults.clustering.max_iterations,
            tolerance = defaults.clustering.tolerance,
            interval_secs = defaults.clustering.interval_secs,
            fan_out = defaults.clustering.fan_out,
            dimensions = defaults.index.dimensions,
            initial_capacity = defaults.index.initial_capacity,
            default_k = defaults.search.default_k,
            max_inflight = defaults.search.max_inflight,
            deadline_ms = defaults.search.deadline_ms,
            level = defaults.logging.level,
        );

        std::fs::write(&config_path, template)?;
        Ok(config_path)
    }
}
