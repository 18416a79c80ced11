//! K-means clustering over a flat embedding corpus.
//!
//! Uses cosine similarity as the distance metric and K-means++ for centroid
//! initialization. Centroids are kept at unit length.
//!
//! # Algorithm Details
//! - Distance metric: Cosine similarity (not Euclidean)
//! - Initialization: K-means++ with an optionally seeded generator
//! - Stops when assignments stop changing, when mean centroid movement falls
//!   below the tolerance, or at the iteration cap
//!
//! # Performance Characteristics
//! - O(n * k * d * iterations) time complexity
//! - O(k * d) space for centroids
//! - Assignment step runs on the rayon pool

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

use crate::compute::kernels::{cosine_similarity, normalize_in_place};
use crate::types::ClusterId;

/// Epsilon for floating-point comparisons.
const EPSILON: f32 = 1e-10;

/// Tuning for one k-means run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansParams {
    pub k: usize,
    pub max_iterations: usize,
    pub tolerance: f32,
    /// Fixed seed for reproducible initialization
    pub seed: Option<u64>,
}

/// Result of K-means clustering operation.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Cluster centroids, each of the input dimension and unit length.
    pub centroids: Vec<Vec<f32>>,

    /// Cluster assignment for each input vector.
    pub assignments: Vec<ClusterId>,

    /// Number of iterations until convergence.
    pub iterations: usize,

    /// False when the iteration cap was hit first.
    pub converged: bool,
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusteringError {
    #[error(
        "Empty vector set provided for clustering\nSuggestion: Insert embeddings before clustering"
    )]
    EmptyVectorSet,

    #[error("Invalid cluster count: {0}\nSuggestion: Use k between 1 and the number of vectors")]
    InvalidClusterCount(usize),

    #[error(
        "Dimension mismatch in vectors\nSuggestion: Ensure all vectors come from the same embedding model"
    )]
    DimensionMismatch,

    #[error(
        "Failed to initialize centroids: no vector could seed a cluster\nSuggestion: Check that the corpus contains non-zero vectors"
    )]
    InitializationFailed,

    #[error(
        "Corpus of {size} embeddings is below the clustering threshold of {min}\nSuggestion: Lower clustering.min_embeddings or insert more embeddings"
    )]
    CorpusTooSmall { size: usize, min: usize },

    #[error("Clustering pass was superseded: the corpus was cleared while it ran")]
    Superseded,
}

/// Performs K-means clustering on `n` vectors of `dims` elements stored
/// row-major in `vectors`.
///
/// # Algorithm
/// 1. Initialize centroids using K-means++ method
/// 2. Iterate until convergence or max iterations:
///    - Assign each vector to nearest centroid (by cosine similarity)
///    - Update centroids as mean of assigned vectors
///    - Check convergence based on centroid movement
#[must_use = "clustering results should be used or the computation is wasted"]
pub fn kmeans_clustering(
    vectors: &[f32],
    dims: usize,
    params: &KMeansParams,
) -> Result<KMeansResult, ClusteringError> {
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }
    if dims == 0 || vectors.len() % dims != 0 {
        return Err(ClusteringError::DimensionMismatch);
    }

    let n = vectors.len() / dims;
    if params.k == 0 || params.k > n {
        return Err(ClusteringError::InvalidClusterCount(params.k));
    }

    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::seed_from_u64(rand::random()),
    };

    let mut centroids = initialize_centroids_kmeans_plus_plus(vectors, dims, params.k, &mut rng)?;
    // Fewer distinct directions than requested clusters
    let k = centroids.len();
    if k < params.k {
        tracing::debug!(
            requested = params.k,
            seeded = k,
            "corpus has fewer distinct directions than clusters; lowering k"
        );
    }
    let mut assignments: Vec<ClusterId> = Vec::new();
    let mut iterations = 0;
    let mut converged = false;

    while iterations < params.max_iterations.max(1) {
        iterations += 1;

        // Assignment step: assign each vector to nearest centroid
        let centroid_refs: Vec<&[f32]> = centroids.iter().map(Vec::as_slice).collect();
        let new_assignments: Vec<ClusterId> = vectors
            .par_chunks(dims)
            .map(|vector| assign_to_nearest_centroid(vector, &centroid_refs))
            .collect();

        // No assignment changes
        if new_assignments == assignments {
            converged = true;
            break;
        }
        assignments = new_assignments;

        let new_centroids = update_centroids(vectors, dims, &assignments, k, &mut rng);
        let centroid_movement = calculate_centroid_movement(&centroids, &new_centroids);
        centroids = new_centroids;

        if centroid_movement < params.tolerance {
            converged = true;
            break;
        }
    }

    if !converged {
        tracing::warn!(
            iterations,
            k,
            "k-means did not fully converge; using the last assignment"
        );
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
        converged,
    })
}

/// Assigns a vector to the nearest centroid based on cosine similarity.
pub fn assign_to_nearest_centroid(vector: &[f32], centroids: &[&[f32]]) -> ClusterId {
    let mut best_similarity = f32::NEG_INFINITY;
    let mut best_cluster = 0;

    for (i, centroid) in centroids.iter().enumerate() {
        let similarity = cosine_similarity(vector, centroid);
        if similarity > best_similarity {
            best_similarity = similarity;
            best_cluster = i;
        }
    }

    ClusterId::from_index(best_cluster)
}

/// Updates centroids as the normalized mean of their assigned vectors.
fn update_centroids(
    vectors: &[f32],
    dims: usize,
    assignments: &[ClusterId],
    k: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    let mut new_centroids = vec![vec![0.0; dims]; k];
    let mut cluster_sizes = vec![0usize; k];

    for (vector, cluster_id) in vectors.chunks_exact(dims).zip(assignments) {
        let slot = cluster_id.index();
        for (sum, &value) in new_centroids[slot].iter_mut().zip(vector) {
            *sum += value;
        }
        cluster_sizes[slot] += 1;
    }

    let n = vectors.len() / dims;
    for (centroid, &size) in new_centroids.iter_mut().zip(&cluster_sizes) {
        if size == 0 {
            // Empty cluster: reseed from a random vector
            let pick = rng.random_range(0..n);
            centroid.copy_from_slice(&vectors[pick * dims..(pick + 1) * dims]);
        } else {
            for value in centroid.iter_mut() {
                *value /= size as f32;
            }
        }
        normalize_in_place(centroid);
    }

    new_centroids
}

/// Initializes centroids using the K-means++ algorithm.
///
/// K-means++ selects initial centroids that are far apart, leading to
/// better convergence properties than random initialization. Seeding stops
/// early once every vector coincides with a centroid, so fewer than `k`
/// centroids may be returned.
fn initialize_centroids_kmeans_plus_plus(
    vectors: &[f32],
    dims: usize,
    k: usize,
    rng: &mut StdRng,
) -> Result<Vec<Vec<f32>>, ClusteringError> {
    let n = vectors.len() / dims;
    let row = |i: usize| &vectors[i * dims..(i + 1) * dims];
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);

    centroids.push(normalize_vector_copy(row(rng.random_range(0..n))));

    // Squared cosine distance of each vector to its nearest centroid so far
    let mut distances: Vec<f32> = (0..n)
        .into_par_iter()
        .map(|i| {
            let d = 1.0 - cosine_similarity(row(i), &centroids[0]);
            d * d
        })
        .collect();

    while centroids.len() < k {
        let total_distance: f32 = distances.iter().sum();
        if total_distance < EPSILON {
            // All points coincide with existing centroids
            break;
        }

        // Choose next centroid with probability proportional to squared distance
        let target = rng.random::<f32>() * total_distance;
        let mut cumulative = 0.0;
        let mut chosen = n - 1;
        for (i, &distance) in distances.iter().enumerate() {
            cumulative += distance;
            if cumulative >= target && distance > 0.0 {
                chosen = i;
                break;
            }
        }

        let centroid = normalize_vector_copy(row(chosen));
        distances
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, nearest)| {
                let d = 1.0 - cosine_similarity(row(i), &centroid);
                *nearest = nearest.min(d * d);
            });
        centroids.push(centroid);
    }

    if centroids.iter().all(|c| c.iter().all(|v| *v == 0.0)) {
        return Err(ClusteringError::InitializationFailed);
    }

    Ok(centroids)
}

/// Mean cosine distance travelled by the centroids between iterations.
fn calculate_centroid_movement(old: &[Vec<f32>], new: &[Vec<f32>]) -> f32 {
    old.iter()
        .zip(new)
        .map(|(old_c, new_c)| 1.0 - cosine_similarity(old_c, new_c))
        .sum::<f32>()
        / old.len() as f32
}

fn normalize_vector_copy(vector: &[f32]) -> Vec<f32> {
    let mut normalized = vector.to_vec();
    normalize_in_place(&mut normalized);
    normalized
}
