//! Buffer lifetime, storage modes and host/device synchronization.

use embedsearch::compute::{Accelerator, Device, DeviceOptions, StorageMode};
use embedsearch::ComputeError;

fn device() -> Device {
    Device::new(DeviceOptions::default()).unwrap()
}

#[test]
fn test_copy_buffer_write_then_read() {
    let device = device();
    let mut buffer = device.new_empty_buffer(6 * 4, StorageMode::Shared).unwrap();
    let data = [0.5_f32, -1.25, 3.0, f32::MAX, 0.0, -0.0];
    buffer.write_f32(&data, 0).unwrap();

    let read = buffer.read_f32(6).unwrap();
    let written_bits: Vec<u32> = data.iter().map(|v| v.to_bits()).collect();
    let read_bits: Vec<u32> = read.iter().map(|v| v.to_bits()).collect();
    assert_eq!(read_bits, written_bits);
}

#[test]
fn test_no_copy_buffer_aliases_caller_memory() {
    let device = device();
    let mut backing = vec![1.0_f32, 2.0, 3.0, 4.0];
    {
        let mut buffer = device
            .new_buffer_no_copy(&mut backing, StorageMode::Shared)
            .unwrap();
        assert!(buffer.is_no_copy());
        buffer.write_f32(&[9.0, 8.0], 1).unwrap();
        assert_eq!(buffer.read_f32(4).unwrap(), vec![1.0, 9.0, 8.0, 4.0]);
    }
    assert_eq!(backing, vec![1.0, 9.0, 8.0, 4.0]);
    assert_eq!(device.memory_info().allocated, 0);
}

#[test]
fn test_no_copy_requires_shared_mode() {
    let device = device();
    let mut backing = vec![1.0_f32; 4];
    assert!(matches!(
        device.new_buffer_no_copy(&mut backing, StorageMode::Managed),
        Err(ComputeError::NoCopyRequiresShared)
    ));
}

#[test]
fn test_managed_edit_needs_did_modify() {
    let device = device();
    let mut embeddings = device
        .new_buffer(&[1.0, 0.0, 0.0, 1.0], StorageMode::Managed)
        .unwrap();
    let query = device.new_buffer(&[1.0, 0.0], StorageMode::Shared).unwrap();
    let mut scores = device.new_empty_buffer(8, StorageMode::Shared).unwrap();

    // Point the second embedding at the query, host side only
    embeddings.contents_mut().unwrap()[2..4].copy_from_slice(&[1.0, 0.0]);
    device
        .compute_cosine_similarity(&embeddings, &query, &mut scores, 2, 2, true)
        .unwrap();
    let stale = scores.read_f32(2).unwrap();
    assert!(stale[1].abs() < 1e-6);

    embeddings.did_modify(8..16).unwrap();
    device
        .compute_cosine_similarity(&embeddings, &query, &mut scores, 2, 2, true)
        .unwrap();
    let fresh = scores.read_f32(2).unwrap();
    assert!((fresh[1] - 1.0).abs() < 1e-6);
}

#[test]
fn test_private_buffer_rejects_host_access() {
    let device = device();
    let mut buffer = device.new_buffer(&[1.0, 2.0], StorageMode::Private).unwrap();
    assert!(matches!(buffer.read_f32(1), Err(ComputeError::HostAccessDenied)));
    assert!(matches!(
        buffer.write_f32(&[0.0], 0),
        Err(ComputeError::HostAccessDenied)
    ));
}

#[test]
fn test_bounds_and_empty_buffers() {
    let device = device();
    assert!(matches!(
        device.new_buffer(&[], StorageMode::Shared),
        Err(ComputeError::EmptyBuffer)
    ));

    let mut buffer = device.new_buffer(&[0.0; 3], StorageMode::Shared).unwrap();
    assert!(matches!(
        buffer.write_f32(&[1.0, 1.0], 2),
        Err(ComputeError::WriteOutOfBounds {
            offset: 2,
            len: 2,
            capacity: 3
        })
    ));
    assert!(matches!(
        buffer.read_f32(4),
        Err(ComputeError::ReadOutOfBounds {
            count: 4,
            capacity: 3
        })
    ));
}

#[test]
fn test_release_invalidates_and_frees() {
    let device = device();
    let mut a = device.new_buffer(&[1.0; 16], StorageMode::Shared).unwrap();
    let b = device.new_buffer(&[2.0; 16], StorageMode::Managed).unwrap();
    assert_eq!(device.memory_info().allocated, 128);
    assert_eq!(device.memory_info().live_buffers, 2);

    a.release();
    a.release();
    assert!(matches!(a.read_f32(1), Err(ComputeError::InvalidBuffer)));
    assert_eq!(device.memory_info().allocated, 64);

    device.release();
    assert!(!b.is_valid());
    assert!(matches!(b.read_f32(1), Err(ComputeError::InvalidBuffer)));
    assert_eq!(device.memory_info().allocated, 0);
    assert!(!device.is_available());
}
