//! Immutable cluster index snapshots.
//!
//! A [`ClusterIndex`] is built off to the side from a copy of the corpus and
//! never changes after it is published.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::kmeans::KMeansResult;
use crate::compute::kernels::{TopK, cosine_similarity};
use crate::types::{ClusterId, NodeId};

/// One cluster: its centroid and the nodes assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub centroid: Vec<f32>,
    pub members: Vec<NodeId>,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Per-cluster summary returned by the administrative clustering call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: ClusterId,
    pub centroid: Vec<f32>,
    pub size: usize,
}

/// Published result of one clustering pass.
#[derive(Debug, Clone)]
pub struct ClusterIndex {
    clusters: Vec<Cluster>,
    assignments: HashMap<NodeId, ClusterId>,
    iterations: usize,
    converged: bool,
    built_at: DateTime<Utc>,
    build_duration: Duration,
    corpus_size: usize,
    corpus_seq: u64,
}

impl ClusterIndex {
    /// Groups `ids` by the k-means assignment at the same position.
    pub fn build(
        ids: Vec<NodeId>,
        result: KMeansResult,
        corpus_seq: u64,
        build_duration: Duration,
    ) -> Self {
        let mut clusters: Vec<Cluster> = result
            .centroids
            .into_iter()
            .enumerate()
            .map(|(slot, centroid)| Cluster {
                id: ClusterId::from_index(slot),
                centroid,
                members: Vec::new(),
            })
            .collect();

        let corpus_size = ids.len();
        let mut assignments = HashMap::with_capacity(corpus_size);
        for (id, cluster_id) in ids.into_iter().zip(result.assignments) {
            if let Some(cluster) = clusters.get_mut(cluster_id.index()) {
                cluster.members.push(id.clone());
                assignments.insert(id, cluster_id);
            }
        }

        Self {
            clusters,
            assignments,
            iterations: result.iterations,
            converged: result.converged,
            built_at: Utc::now(),
            build_duration,
            corpus_size,
            corpus_seq,
        }
    }

    /// The `fan_out` clusters whose centroids are most similar to the query,
    /// best first.
    pub fn nearest_clusters(&self, query: &[f32], fan_out: usize) -> Vec<&Cluster> {
        let mut best = TopK::new(fan_out.min(self.clusters.len()));
        for (slot, cluster) in self.clusters.iter().enumerate() {
            best.offer(cosine_similarity(query, &cluster.centroid), slot as u32);
        }
        let selection = best.into_selection();
        selection.indices[..selection.valid]
            .iter()
            .filter_map(|&slot| self.clusters.get(slot as usize))
            .collect()
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(id.index())
    }

    /// Cluster a node was assigned to in this pass.
    pub fn cluster_of(&self, id: &NodeId) -> Option<ClusterId> {
        self.assignments.get(id).copied()
    }

    pub fn summaries(&self) -> Vec<ClusterSummary> {
        self.clusters
            .iter()
            .map(|cluster| ClusterSummary {
                cluster_id: cluster.id,
                centroid: cluster.centroid.clone(),
                size: cluster.size(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn build_duration(&self) -> Duration {
        self.build_duration
    }

    /// Embeddings the pass clustered.
    pub fn corpus_size(&self) -> usize {
        self.corpus_size
    }

    /// Corpus mutation sequence number the pass was built from.
    pub fn corpus_seq(&self) -> u64 {
        self.corpus_seq
    }
}
