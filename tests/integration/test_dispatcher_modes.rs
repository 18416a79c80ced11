//! Brute-force vs clustered routing at realistic corpus sizes.

use std::sync::Arc;

use embedsearch::cluster::{ClusteringError, ExecutionBackend};
use embedsearch::compute::{Device, DeviceOptions};
use embedsearch::{
    AdminError, ClusteringParams, Dispatcher, FallbackReason, NodeId, SearchMode, Settings,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIMS: usize = 16;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.index.dimensions = DIMS;
    settings.clustering.num_clusters = 24;
    settings.clustering.max_iterations = 15;
    settings.clustering.fan_out = 3;
    settings.clustering.seed = Some(7);
    settings
}

fn random_corpus(dispatcher: &Dispatcher, n: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let ids: Vec<NodeId> = (0..n).map(|i| NodeId::new(format!("node-{i}"))).collect();
    let vectors: Vec<Vec<f32>> = (0..n)
        .map(|_| (0..DIMS).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect())
        .collect();
    dispatcher.insert_batch(&ids, &vectors).unwrap();
}

fn dispatcher(settings: Settings) -> Dispatcher {
    let device = Arc::new(Device::new(DeviceOptions::from(&settings.compute)).unwrap());
    Dispatcher::new(settings, device).unwrap()
}

#[test]
fn test_999_embeddings_never_clustered() {
    let dispatcher = dispatcher(settings());
    random_corpus(&dispatcher, 999, 1);

    assert!(!dispatcher.tick());
    let err = dispatcher.run_clustering(ClusteringParams {
        k: 8,
        max_iterations: 10,
        tolerance: 1e-4,
    });
    assert!(matches!(
        err,
        Err(AdminError::Clustering(ClusteringError::CorpusTooSmall {
            size: 999,
            min: 1000
        }))
    ));

    let mut rng = StdRng::seed_from_u64(2);
    for _ in 0..20 {
        let query: Vec<f32> = (0..DIMS).map(|_| rng.random::<f32>() - 0.5).collect();
        let outcome = dispatcher.search(&query, 10).unwrap();
        assert_eq!(outcome.diagnostics.mode, SearchMode::BruteForce);
        assert_eq!(
            outcome.diagnostics.fallback_reason,
            Some(FallbackReason::TooFewEmbeddings)
        );
        assert_eq!(outcome.diagnostics.candidates, 999);
        assert_eq!(outcome.results.len(), 10);
    }
    assert_eq!(dispatcher.status().mode, SearchMode::BruteForce);
}

#[test]
fn test_5000_embeddings_clustered_after_pass() {
    let dispatcher = dispatcher(settings());
    random_corpus(&dispatcher, 5_000, 3);

    let query = vec![0.25; DIMS];
    let before = dispatcher.search(&query, 10).unwrap();
    assert_eq!(
        before.diagnostics.fallback_reason,
        Some(FallbackReason::NotYetClustered)
    );

    assert!(dispatcher.tick());
    let status = dispatcher.status();
    assert_eq!(status.mode, SearchMode::Clustered);
    assert_eq!(status.clusters, 24);
    assert!(status.last_clustering_duration.is_some());

    let outcome = dispatcher.search(&query, 10).unwrap();
    assert_eq!(outcome.diagnostics.mode, SearchMode::Clustered);
    assert_eq!(outcome.diagnostics.clusters_searched, 3);
    assert!(outcome.diagnostics.candidates < 5_000);
    assert_eq!(outcome.diagnostics.backend, ExecutionBackend::Device);
    assert_eq!(outcome.results.len(), 10);
    for pair in outcome.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    // Clustered hits are a subset of the corpus and agree with brute force
    // on the scores they report.
    let brute = {
        let mut s = settings();
        s.clustering.enabled = false;
        let brute = self::dispatcher(s);
        random_corpus(&brute, 5_000, 3);
        brute.search(&query, 5_000).unwrap()
    };
    for hit in &outcome.results {
        let reference = brute.results.iter().find(|r| r.id == hit.id).unwrap();
        assert!((reference.score - hit.score).abs() < 1e-4);
    }
}

#[test]
fn test_zero_k_returns_empty() {
    let dispatcher = dispatcher(settings());
    random_corpus(&dispatcher, 50, 4);
    let outcome = dispatcher.search(&vec![1.0; DIMS], 0).unwrap();
    assert!(outcome.results.is_empty());
}

#[test]
fn test_empty_corpus_search() {
    let dispatcher = dispatcher(settings());
    let outcome = dispatcher.search(&vec![1.0; DIMS], 5).unwrap();
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.diagnostics.candidates, 0);
}

#[test]
fn test_clustering_disabled_reason() {
    let mut settings = settings();
    settings.clustering.enabled = false;
    let dispatcher = dispatcher(settings);
    random_corpus(&dispatcher, 1_200, 5);

    assert!(!dispatcher.tick());
    let outcome = dispatcher.search(&vec![0.5; DIMS], 3).unwrap();
    assert_eq!(
        outcome.diagnostics.fallback_reason,
        Some(FallbackReason::AccelerationDisabled)
    );
}
