//! Device selection and the CPU path when no device is usable.

use std::sync::Arc;

use embedsearch::compute::{self, Accelerator, UnavailableDevice, cpu_search};
use embedsearch::config::ComputeSettings;
use embedsearch::{
    Backend, ComputeError, Dispatcher, FallbackReason, NodeId, SearchError, Settings,
    StorageMode,
};

#[test]
fn test_probe_respects_gate_and_backend() {
    let disabled = ComputeSettings {
        enabled: false,
        ..Default::default()
    };
    let device = compute::probe(&disabled).unwrap();
    assert!(!device.is_available());
    assert!(matches!(
        device.new_buffer(&[1.0], StorageMode::Shared),
        Err(ComputeError::Disabled)
    ));

    let none = ComputeSettings {
        preferred_backend: Backend::None,
        ..Default::default()
    };
    let device = compute::probe(&none).unwrap();
    assert_eq!(device.backend(), Backend::None);
    assert!(matches!(
        device.search(&[1.0], &[1.0], 1, 1, 1, true),
        Err(ComputeError::Unavailable { .. })
    ));

    let host = compute::probe(&ComputeSettings::default()).unwrap();
    assert!(host.is_available());
    assert_eq!(host.backend(), Backend::Host);
}

#[test]
fn test_unavailable_device_fails_every_kernel() {
    let device = UnavailableDevice::new("no compute device on this host");
    let mut backing = [1.0_f32; 4];
    assert!(device.new_buffer_no_copy(&mut backing, StorageMode::Shared).is_err());
    assert!(device.new_empty_buffer(16, StorageMode::Shared).is_err());
    assert!(device.new_buffer_u32(&[1], StorageMode::Shared).is_err());
    assert_eq!(device.memory_info().total, 0);
    assert!(!device.info().supports_matrix);

    let err = device.search(&[1.0, 0.0], &[1.0, 0.0], 1, 2, 1, true).unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(err.status_code(), "COMPUTE_UNAVAILABLE");
}

#[test]
fn test_cpu_path_matches_worked_cosine_example() {
    let embeddings = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.707, 0.707, 0.0, 0.0,
    ];
    let query = [1.0, 0.0, 0.0, 0.0];
    let results = cpu_search(&embeddings, &query, 3, 4, 3, false).unwrap();
    let score_of = |index: u32| results.iter().find(|r| r.index == index).unwrap().score;
    assert!((score_of(0) - 1.0).abs() < 0.05);
    assert!(score_of(1).abs() < 0.05);
    assert!((score_of(2) - 0.707).abs() < 0.05);
    assert_eq!(results[0].index, 0);
    assert_eq!(results[1].index, 2);
}

#[test]
fn test_dispatcher_without_device_serves_from_cpu() {
    let mut settings = Settings::default();
    settings.index.dimensions = 3;
    settings.compute.preferred_backend = Backend::None;
    let dispatcher = Dispatcher::from_settings(settings).unwrap();
    assert_eq!(dispatcher.accelerator().backend(), Backend::None);

    dispatcher.insert(NodeId::new("a"), &[1.0, 0.0, 0.0]).unwrap();
    dispatcher.insert(NodeId::new("b"), &[0.0, 1.0, 0.0]).unwrap();
    let outcome = dispatcher.search(&[0.9, 0.1, 0.0], 2).unwrap();
    assert_eq!(outcome.results[0].id.as_str(), "a");
    assert_eq!(
        outcome.diagnostics.fallback_reason,
        Some(FallbackReason::TooFewEmbeddings)
    );
    assert_eq!(dispatcher.stats().cpu_searches, 1);
}

#[test]
fn test_allocation_failure_fails_closed() {
    let mut settings = Settings::default();
    settings.index.dimensions = 4;
    settings.compute.max_buffer_mb = 0;
    let device = compute::probe(&settings.compute).unwrap();
    let dispatcher = Dispatcher::new(settings, Arc::clone(&device)).unwrap();
    dispatcher.insert(NodeId::new("a"), &[1.0, 0.0, 0.0, 0.0]).unwrap();

    let err = dispatcher.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap_err();
    assert!(matches!(
        err,
        SearchError::Compute(ComputeError::AllocationFailed { .. })
    ));
    assert_eq!(device.memory_info().allocated, 0);
}
