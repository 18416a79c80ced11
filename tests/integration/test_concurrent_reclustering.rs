//! Searches racing against background clustering passes and writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use embedsearch::compute::{Device, DeviceOptions};
use embedsearch::{ClusterScheduler, Dispatcher, NodeId, SearchMode, Settings};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

const DIMS: usize = 8;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.index.dimensions = DIMS;
    settings.clustering.min_embeddings = 200;
    settings.clustering.num_clusters = 8;
    settings.clustering.max_iterations = 10;
    settings.clustering.fan_out = 2;
    settings
}

fn random_vector(rng: &mut StdRng) -> Vec<f32> {
    (0..DIMS).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()
}

fn populated(n: usize) -> Arc<Dispatcher> {
    let settings = settings();
    let device = Arc::new(Device::new(DeviceOptions::from(&settings.compute)).unwrap());
    let dispatcher = Dispatcher::new(settings, device).unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    for i in 0..n {
        dispatcher
            .insert(NodeId::new(format!("seed-{i}")), &random_vector(&mut rng))
            .unwrap();
    }
    Arc::new(dispatcher)
}

#[test]
fn test_searches_never_fail_during_reclustering() {
    let dispatcher = populated(600);
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|reader| {
            let dispatcher = Arc::clone(&dispatcher);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(reader);
                let mut searches = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let outcome = dispatcher.search(&random_vector(&mut rng), 5).unwrap();
                    assert_eq!(outcome.results.len(), 5);
                    for hit in &outcome.results {
                        assert!(hit.score.is_finite());
                    }
                    searches += 1;
                }
                searches
            })
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(1);
    for round in 0..6 {
        for i in 0..25 {
            dispatcher
                .insert(NodeId::new(format!("w{round}-{i}")), &random_vector(&mut rng))
                .unwrap();
        }
        dispatcher.tick();
    }
    stop.store(true, Ordering::Relaxed);

    let total: usize = readers.into_iter().map(|r| r.join().unwrap()).sum();
    assert!(total > 0);
    assert_eq!(dispatcher.len(), 750);
    assert_eq!(dispatcher.status().mode, SearchMode::Clustered);
    assert_eq!(dispatcher.stats().clustering_failures, 0);
}

#[test]
fn test_insert_after_pass_found_by_clustered_search() {
    let dispatcher = populated(400);
    assert!(dispatcher.tick());

    let fresh = NodeId::new("fresh");
    let direction: Vec<f32> = (0..DIMS).map(|d| if d == 3 { 1.0 } else { 0.0 }).collect();
    dispatcher.insert(fresh.clone(), &direction).unwrap();

    let outcome = dispatcher.search(&direction, 1).unwrap();
    assert_eq!(outcome.diagnostics.mode, SearchMode::Clustered);
    assert_eq!(outcome.results[0].id, fresh);
    assert!((outcome.results[0].score - 1.0).abs() < 1e-3);
}

#[test]
fn test_removed_ids_absent_until_next_pass() {
    let dispatcher = populated(400);
    assert!(dispatcher.tick());

    for i in 0..400 {
        if i % 2 == 0 {
            assert!(dispatcher.remove(&NodeId::new(format!("seed-{i}"))));
        }
    }
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..20 {
        let outcome = dispatcher.search(&random_vector(&mut rng), 10).unwrap();
        for hit in &outcome.results {
            let n: usize = hit.id.as_str()["seed-".len()..].parse().unwrap();
            assert_eq!(n % 2, 1, "removed id {} returned", hit.id);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scheduler_reclusters_while_serving() {
    let dispatcher = populated(300);
    let ct = CancellationToken::new();
    let handle =
        ClusterScheduler::new(Arc::clone(&dispatcher), Duration::from_millis(5)).spawn(ct.clone());

    let mut rng = StdRng::seed_from_u64(8);
    let mut clustered = 0;
    for i in 0..200 {
        if i % 20 == 0 {
            dispatcher
                .insert(NodeId::new(format!("late-{i}")), &random_vector(&mut rng))
                .unwrap();
        }
        let query = random_vector(&mut rng);
        let d = Arc::clone(&dispatcher);
        let outcome = tokio::task::spawn_blocking(move || d.search(&query, 3))
            .await
            .unwrap()
            .unwrap();
        if outcome.diagnostics.mode == SearchMode::Clustered {
            clustered += 1;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    ct.cancel();
    handle.await.unwrap();
    assert!(clustered > 0);
    assert!(dispatcher.stats().clustering_runs >= 1);
}
