//! Dense matrix products over row-major slices.
//!
//! Thin wrappers that view device memory as `ndarray` matrices and hand the
//! work to its BLAS-style kernels.

use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, ShapeError};

/// `C = alpha * A * B + beta * C` with `A (m x k)`, `B (k x n)`, `C (m x n)`.
///
/// Slices may be longer than the matrices they hold; only the leading
/// elements are used.
#[allow(clippy::too_many_arguments)]
pub(crate) fn gemm(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    beta: f32,
) -> Result<(), ShapeError> {
    let a = ArrayView2::from_shape((m, k), &a[..m * k])?;
    let b = ArrayView2::from_shape((k, n), &b[..k * n])?;
    let mut c = ArrayViewMut2::from_shape((m, n), &mut c[..m * n])?;
    general_mat_mul(alpha, &a, &b, beta, &mut c);
    Ok(())
}

/// `y = alpha * A * x + beta * y` with `A (m x n)`.
pub(crate) fn gemv(
    a: &[f32],
    x: &[f32],
    y: &mut [f32],
    m: usize,
    n: usize,
    alpha: f32,
    beta: f32,
) -> Result<(), ShapeError> {
    let a = ArrayView2::from_shape((m, n), &a[..m * n])?;
    let x = ArrayView1::from(&x[..n]);
    let mut y = ArrayViewMut1::from(&mut y[..m]);
    general_mat_vec_mul(alpha, &a, &x, beta, &mut y);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::device::{Device, DeviceOptions};
    use crate::compute::kernels::similarity;
    use crate::compute::{Accelerator, StorageMode};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_gemm_known_values() {
        // [1 2; 3 4] * [5 6; 7 8] = [19 22; 43 50]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [1.0; 4];
        gemm(&a, &b, &mut c, 2, 2, 2, 1.0, 0.0).unwrap();
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);

        // beta accumulates into the existing output
        gemm(&a, &b, &mut c, 2, 2, 2, 2.0, 1.0).unwrap();
        assert_eq!(c, [57.0, 66.0, 129.0, 150.0]);
    }

    #[test]
    fn test_gemm_rectangular() {
        // (2 x 3) * (3 x 1)
        let a = [1.0, 0.0, 2.0, 0.0, 1.0, 1.0];
        let b = [1.0, 2.0, 3.0];
        let mut c = [0.0; 2];
        gemm(&a, &b, &mut c, 2, 1, 3, 1.0, 0.0).unwrap();
        assert_eq!(c, [7.0, 5.0]);
    }

    #[test]
    fn test_gemv_known_values() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = [1.0, 1.0];
        let mut y = [10.0, 10.0, 10.0];
        gemv(&a, &x, &mut y, 3, 2, 1.0, 0.5).unwrap();
        assert_eq!(y, [8.0, 12.0, 16.0]);
    }

    #[test]
    fn test_matrix_path_agrees_with_kernel() {
        let (n, dims) = (1000, 128);
        let mut rng = StdRng::seed_from_u64(7);
        let mut embeddings: Vec<f32> = (0..n * dims).map(|_| rng.random_range(-1.0..1.0)).collect();
        let mut query: Vec<f32> = (0..dims).map(|_| rng.random_range(-1.0..1.0)).collect();
        for row in embeddings.chunks_mut(dims) {
            crate::compute::kernels::normalize_in_place(row);
        }
        crate::compute::kernels::normalize_in_place(&mut query);

        let device = Device::new(DeviceOptions::default()).unwrap();
        let emb = device.new_buffer(&embeddings, StorageMode::Shared).unwrap();
        let q = device.new_buffer(&query, StorageMode::Shared).unwrap();
        let mut kernel_scores = device.new_empty_buffer(n * 4, StorageMode::Shared).unwrap();
        let mut matrix_scores = device.new_empty_buffer(n * 4, StorageMode::Shared).unwrap();

        device
            .compute_cosine_similarity(&emb, &q, &mut kernel_scores, n, dims, true)
            .unwrap();
        device
            .batch_cosine_similarity(&emb, &q, &mut matrix_scores, n, dims)
            .unwrap();

        let kernel_scores = kernel_scores.read_f32(n).unwrap();
        let matrix_scores = matrix_scores.read_f32(n).unwrap();
        for i in 0..n {
            assert!(
                (kernel_scores[i] - matrix_scores[i]).abs() < 0.1,
                "row {i}: kernel={} matrix={}",
                kernel_scores[i],
                matrix_scores[i]
            );
            let row = &embeddings[i * dims..(i + 1) * dims];
            assert!((similarity(row, &query, false) - matrix_scores[i]).abs() < 1e-3);
        }
        assert_eq!(device.stats().matrix_dispatches, 1);
    }
}
