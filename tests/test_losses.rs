//! Tests for loss modules and their Hessian factorizations
//!
//! This file tests:
//! - Loss values and gradients against finite differences
//! - Exact square-root factors reconstructing the per-sample Hessian
//! - Monte-Carlo factors converging to the exact Hessian
//! - Reduction handling and undefined Hessians

mod common;

use approx::assert_abs_diff_eq;
use common::{assert_matrix_close, tensor};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_extended_backprop::loss::{CrossEntropyLoss, LossDerivatives, MseLoss};
use rust_extended_backprop::utils::tensor::Tensor;
use rust_extended_backprop::{BackpropError, Reduction, SignedFactor, Target};

fn logits() -> Tensor {
    tensor(&[2, 3], vec![0.2, -0.4, 1.1, 0.5, 0.5, -1.0])
}

/// Per-sample cross-entropy Hessian `diag(p) - p pᵀ`.
fn softmax_hessian(row: &[f64]) -> Array2<f64> {
    let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = row.iter().map(|x| (x - max).exp()).collect();
    let total: f64 = exp.iter().sum();
    let p: Vec<f64> = exp.iter().map(|e| e / total).collect();
    Array2::from_shape_fn((p.len(), p.len()), |(i, j)| {
        if i == j {
            p[i] - p[i] * p[j]
        } else {
            -p[i] * p[j]
        }
    })
}

// ============================================================================
// Value and Gradient Tests
// ============================================================================

mod gradient_tests {
    use super::*;

    fn check_gradient(loss: &dyn LossDerivatives, x: &Tensor, target: &Target) {
        let grad = loss.gradient(x, target).unwrap();
        let eps = 1e-6;
        for (idx, g) in grad.indexed_iter() {
            let mut plus = x.clone();
            plus[idx.clone()] += eps;
            let mut minus = x.clone();
            minus[idx.clone()] -= eps;
            let numeric =
                (loss.value(&plus, target).unwrap() - loss.value(&minus, target).unwrap())
                    / (2.0 * eps);
            assert_abs_diff_eq!(*g, numeric, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_mse_mean_value() {
        let loss = MseLoss::new(Reduction::Mean);
        let x = tensor(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let t = Target::Regression(tensor(&[2, 2], vec![0.0, 2.0, 1.0, 4.0]));
        // (1 + 0 + 4 + 0) / 4
        assert_abs_diff_eq!(loss.value(&x, &t).unwrap(), 1.25, epsilon = 1e-12);
    }

    #[test]
    fn test_mse_gradients_match_finite_differences() {
        let x = tensor(&[2, 2], vec![0.3, -0.7, 1.2, 0.1]);
        let t = Target::Regression(tensor(&[2, 2], vec![0.0, 0.5, 1.0, -1.0]));
        for reduction in [Reduction::Mean, Reduction::Sum] {
            check_gradient(&MseLoss::new(reduction), &x, &t);
        }
    }

    #[test]
    fn test_cross_entropy_gradients_match_finite_differences() {
        let t = Target::Classes(vec![2, 0]);
        for reduction in [Reduction::Mean, Reduction::Sum] {
            check_gradient(&CrossEntropyLoss::new(reduction), &logits(), &t);
        }
    }

    #[test]
    fn test_reduction_none_value_sums_per_sample_losses() {
        let x = tensor(&[2, 1], vec![1.0, 2.0]);
        let t = Target::Regression(tensor(&[2, 1], vec![0.0, 0.0]));
        let loss = MseLoss::new(Reduction::None);
        assert_abs_diff_eq!(loss.value(&x, &t).unwrap(), 5.0, epsilon = 1e-12);
    }
}

// ============================================================================
// Exact Square-Root Factor Tests
// ============================================================================

mod sqrt_factor_tests {
    use super::*;

    #[test]
    fn test_mse_sqrt_factor_shape_and_value() {
        let loss = MseLoss::new(Reduction::Sum);
        let x = tensor(&[3, 2], vec![0.0; 6]);
        let t = Target::Regression(tensor(&[3, 2], vec![1.0; 6]));
        let factor = loss.sqrt_hessian(&x, &t).unwrap();
        assert_eq!(factor.shape(), &[2, 3, 2]);
        assert_abs_diff_eq!(factor[[1, 2, 1]], 2f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(factor[[1, 2, 0]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mse_mean_factor_reconstructs_scaled_identity() {
        let loss = MseLoss::new(Reduction::Mean);
        let x = tensor(&[2, 3], vec![0.5; 6]);
        let t = Target::Regression(tensor(&[2, 3], vec![0.0; 6]));
        let per_sample = SignedFactor::positive(loss.sqrt_hessian(&x, &t).unwrap())
            .reconstruct_per_sample()
            .unwrap();
        let expected = Array2::eye(3) * (2.0 / 6.0);
        for h in &per_sample {
            assert_matrix_close(h, &expected, 1e-12);
        }
    }

    #[test]
    fn test_cross_entropy_factor_reconstructs_softmax_hessian() {
        let x = logits();
        let t = Target::Classes(vec![1, 2]);
        for (reduction, scale) in [(Reduction::Sum, 1.0), (Reduction::Mean, 0.5)] {
            let loss = CrossEntropyLoss::new(reduction);
            let per_sample = SignedFactor::positive(loss.sqrt_hessian(&x, &t).unwrap())
                .reconstruct_per_sample()
                .unwrap();
            for (sample, h) in per_sample.iter().enumerate() {
                let row: Vec<f64> = x
                    .index_axis(ndarray::Axis(0), sample)
                    .iter()
                    .copied()
                    .collect();
                assert_matrix_close(h, &(softmax_hessian(&row) * scale), 1e-12);
            }
        }
    }

    #[test]
    fn test_sum_hessian_matches_factor() {
        let x = logits();
        let t = Target::Classes(vec![0, 0]);
        let loss = CrossEntropyLoss::new(Reduction::Mean);
        let from_factor = SignedFactor::positive(loss.sqrt_hessian(&x, &t).unwrap())
            .reconstruct_sum()
            .unwrap();
        assert_matrix_close(&loss.sum_hessian(&x, &t).unwrap(), &from_factor, 1e-12);
    }
}

// ============================================================================
// Monte-Carlo Factor Tests
// ============================================================================

mod sampling_tests {
    use super::*;

    #[test]
    fn test_cross_entropy_sampled_factor_converges() {
        let x = logits();
        let t = Target::Classes(vec![1, 2]);
        let loss = CrossEntropyLoss::new(Reduction::Sum);
        let mut rng = StdRng::seed_from_u64(42);
        let sampled = loss.sqrt_hessian_sampled(&x, &t, 100_000, &mut rng).unwrap();
        assert_eq!(sampled.shape(), &[100_000, 2, 3]);

        let approx = SignedFactor::positive(sampled).reconstruct_sum().unwrap();
        assert_matrix_close(&approx, &loss.sum_hessian(&x, &t).unwrap(), 2e-2);
    }

    #[test]
    fn test_mse_sampled_factor_converges() {
        let x = tensor(&[2, 2], vec![0.1, 0.2, 0.3, 0.4]);
        let t = Target::Regression(tensor(&[2, 2], vec![0.0; 4]));
        let loss = MseLoss::new(Reduction::Sum);
        let mut rng = StdRng::seed_from_u64(3);
        let sampled = loss.sqrt_hessian_sampled(&x, &t, 400_000, &mut rng).unwrap();

        let approx = SignedFactor::positive(sampled).reconstruct_sum().unwrap();
        assert_matrix_close(&approx, &loss.sum_hessian(&x, &t).unwrap(), 2e-2);
    }

    #[test]
    fn test_cross_entropy_samples_are_one_hot_residuals() {
        let x = logits();
        let t = Target::Classes(vec![0, 0]);
        let loss = CrossEntropyLoss::new(Reduction::Sum);
        let sampled = loss
            .sqrt_hessian_sampled(&x, &t, 50, &mut StdRng::seed_from_u64(4))
            .unwrap();

        // every draw is p - e_y scaled by 1/√M: one negative entry, zero row sum
        for m in 0..50 {
            for n in 0..2 {
                let row: Vec<f64> = (0..3).map(|c| sampled[[m, n, c]]).collect();
                assert_abs_diff_eq!(row.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
                assert_eq!(row.iter().filter(|&&v| v < 0.0).count(), 1);
            }
        }
    }

    #[test]
    fn test_different_seeds_draw_different_factors() {
        let x = tensor(&[1, 2], vec![0.0, 0.0]);
        let t = Target::Regression(tensor(&[1, 2], vec![1.0, 1.0]));
        let loss = MseLoss::new(Reduction::Mean);
        let a = loss
            .sqrt_hessian_sampled(&x, &t, 4, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let b = loss
            .sqrt_hessian_sampled(&x, &t, 4, &mut StdRng::seed_from_u64(2))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let x = logits();
        let t = Target::Classes(vec![1, 2]);
        let loss = CrossEntropyLoss::new(Reduction::Mean);
        let a = loss
            .sqrt_hessian_sampled(&x, &t, 4, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let b = loss
            .sqrt_hessian_sampled(&x, &t, 4, &mut StdRng::seed_from_u64(9))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_samples_is_rejected() {
        let loss = MseLoss::new(Reduction::Sum);
        let x = tensor(&[1, 1], vec![0.0]);
        let t = Target::Regression(tensor(&[1, 1], vec![0.0]));
        let result = loss.sqrt_hessian_sampled(&x, &t, 0, &mut StdRng::seed_from_u64(1));
        assert!(matches!(result, Err(BackpropError::Config(_))));
    }
}

// ============================================================================
// Undefined Hessian Tests
// ============================================================================

mod undefined_hessian_tests {
    use super::*;

    #[test]
    fn test_reduction_none_has_no_hessian() {
        let x = logits();
        let t = Target::Classes(vec![0, 1]);
        let loss = CrossEntropyLoss::new(Reduction::None);
        assert!(matches!(
            loss.sqrt_hessian(&x, &t),
            Err(BackpropError::HessianUndefined(_))
        ));
        assert!(matches!(
            loss.sum_hessian(&x, &t),
            Err(BackpropError::HessianUndefined(_))
        ));
    }

    #[test]
    fn test_non_finite_input_has_no_hessian() {
        let x = tensor(&[1, 2], vec![f64::NAN, 0.0]);
        let t = Target::Regression(tensor(&[1, 2], vec![0.0, 0.0]));
        let loss = MseLoss::new(Reduction::Mean);
        assert!(matches!(
            loss.sqrt_hessian(&x, &t),
            Err(BackpropError::HessianUndefined(_))
        ));
    }

    #[test]
    fn test_wrong_target_kind_is_a_shape_error() {
        let loss = MseLoss::new(Reduction::Sum);
        let x = tensor(&[1, 2], vec![0.0, 0.0]);
        assert!(matches!(
            loss.value(&x, &Target::Classes(vec![0])),
            Err(BackpropError::ShapeError(_))
        ));
    }
}
