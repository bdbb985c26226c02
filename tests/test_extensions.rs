//! Tests for the extended backward pass
//!
//! This file tests the engine end to end:
//! - Per-example gradients and their second moment
//! - Diagonal Hessians against brute-force finite-difference Hessians
//! - Hessian blocks under square-root and batch-averaged propagation
//! - Curvature-vector products for weights and biases
//! - Loss Hessian strategies (exact, sampled, averaged)
//! - Error paths and missing artifacts

mod common;

use approx::assert_abs_diff_eq;
use common::{assert_matrix_close, fd_hessian, random_tensor, tensor};
use ndarray::{Array1, Array2, Axis};
use rust_extended_backprop::config::ExtensionSettings;
use rust_extended_backprop::layers::{
    ActivationLayer, Conv2DLayer, DenseLayer, FlattenLayer, Layer, Parallel,
};
use rust_extended_backprop::utils::rng::SimpleRng;
use rust_extended_backprop::utils::tensor::Tensor;
use rust_extended_backprop::{
    Artifacts, BackpropError, Curvature, ExtendedBackprop, Extension, Loss, ParamId, Reduction,
    Sequential, Strategies, Target,
};

const HESSIAN_TOL: f64 = 1e-6;

/// Linear → Sigmoid → Linear.
fn sigmoid_mlp(rng: &mut SimpleRng, loss: Loss) -> Sequential {
    Sequential::new(
        vec![
            DenseLayer::new(3, 4, true, rng).into(),
            ActivationLayer::sigmoid().into(),
            DenseLayer::new(4, 2, true, rng).into(),
        ],
        loss,
    )
}

/// Conv2d → Tanh → Flatten → Linear.
fn small_cnn(rng: &mut SimpleRng, loss: Loss) -> Sequential {
    Sequential::new(
        vec![
            Conv2DLayer::new(1, 2, 2, 0, 1, true, rng).unwrap().into(),
            ActivationLayer::tanh().into(),
            FlattenLayer::new().into(),
            DenseLayer::new(8, 2, true, rng).into(),
        ],
        loss,
    )
}

fn regression_target(n: usize, rng: &mut SimpleRng) -> Target {
    Target::Regression(random_tensor(&[n, 2], rng))
}

fn run(
    model: &mut Sequential,
    x: &Tensor,
    target: &Target,
    extensions: &[Extension],
    strategies: Strategies,
) -> Artifacts {
    model.forward_loss(x, target.clone()).unwrap();
    let mut engine = ExtendedBackprop::new(ExtensionSettings {
        extensions: extensions.to_vec(),
        strategies,
        seed: 42,
    });
    engine.backward(model).unwrap()
}

fn diagonal_of(h: &Array2<f64>) -> Vec<f64> {
    h.diag().to_vec()
}

fn flat(t: &Tensor) -> Vec<f64> {
    t.iter().copied().collect()
}

fn assert_vec_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_abs_diff_eq!(*a, *e, epsilon = tol);
    }
}

// ============================================================================
// First-Order Extension Tests
// ============================================================================

mod first_order_tests {
    use super::*;

    #[test]
    fn test_batch_grad_sums_to_gradient() {
        let mut rng = SimpleRng::new(1);
        let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Mean));
        let x = random_tensor(&[3, 3], &mut rng);
        let target = regression_target(3, &mut rng);
        let artifacts = run(
            &mut model,
            &x,
            &target,
            &[Extension::BatchGrad],
            Strategies::default(),
        );

        for id in model.param_ids() {
            let batch = artifacts.grad_batch(id).unwrap();
            assert_eq!(batch.shape()[0], 3);
            let summed = batch.sum_axis(Axis(0));
            assert_vec_close(&flat(&summed), &flat(model.grad(id).unwrap()), 1e-12);
        }
    }

    #[test]
    fn test_batch_grad_matches_single_example_gradients() {
        let mut rng = SimpleRng::new(2);
        let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Sum));
        let x = random_tensor(&[2, 3], &mut rng);
        let t = random_tensor(&[2, 2], &mut rng);
        let artifacts = run(
            &mut model,
            &x,
            &Target::Regression(t.clone()),
            &[Extension::BatchGrad],
            Strategies::default(),
        );

        for sample in 0..2 {
            let xs = x.index_axis(Axis(0), sample).to_owned().insert_axis(Axis(0));
            let ts = t.index_axis(Axis(0), sample).to_owned().insert_axis(Axis(0));
            let mut single = model.clone();
            single.forward_loss(&xs, Target::Regression(ts)).unwrap();
            single.backward().unwrap();
            for id in model.param_ids() {
                let per_example = artifacts
                    .grad_batch(id)
                    .unwrap()
                    .index_axis(Axis(0), sample)
                    .to_owned();
                assert_vec_close(&flat(&per_example), &flat(single.grad(id).unwrap()), 1e-12);
            }
        }
    }

    #[test]
    fn test_sum_grad_squared_is_second_moment() {
        let mut rng = SimpleRng::new(3);
        let mut model = sigmoid_mlp(&mut rng, Loss::cross_entropy(Reduction::Mean));
        let x = random_tensor(&[4, 3], &mut rng);
        let target = Target::Classes(vec![0, 1, 1, 0]);
        let artifacts = run(
            &mut model,
            &x,
            &target,
            &[Extension::BatchGrad, Extension::SumGradSquared],
            Strategies::default(),
        );

        for id in model.param_ids() {
            let batch = artifacts.grad_batch(id).unwrap();
            let expected = batch.mapv(|g| g * g).sum_axis(Axis(0));
            let second_moment = artifacts.sum_grad_squared(id).unwrap();
            assert_vec_close(&flat(second_moment), &flat(&expected), 1e-14);

            // not the square of the summed gradient in general
            let mean_sq = model.grad(id).unwrap().mapv(|g| g * g);
            assert!(second_moment.iter().zip(mean_sq.iter()).any(|(a, b)| (a - b).abs() > 1e-12));
        }
    }

    #[test]
    fn test_first_order_works_with_reduction_none() {
        let mut rng = SimpleRng::new(4);
        let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::None));
        let x = random_tensor(&[2, 3], &mut rng);
        let target = regression_target(2, &mut rng);
        let artifacts = run(
            &mut model,
            &x,
            &target,
            &[Extension::SumGradSquared],
            Strategies::default(),
        );
        assert!(artifacts.sum_grad_squared(ParamId::weight(0)).is_ok());
        assert!(matches!(
            artifacts.grad_batch(ParamId::weight(0)),
            Err(BackpropError::MissingArtifact { .. })
        ));
    }
}

// ============================================================================
// Diagonal Hessian Tests
// ============================================================================

mod diag_h_tests {
    use super::*;

    fn check_diag_h(mut model: Sequential, x: Tensor, target: Target) {
        let artifacts = run(&mut model, &x, &target, &[Extension::DiagH], Strategies::default());
        for id in model.param_ids() {
            let reference = fd_hessian(&model, &x, &target, id);
            let diag = artifacts.diag_h(id).unwrap();
            assert_eq!(diag.shape(), model.param(id).unwrap().shape());
            assert_vec_close(&flat(diag), &diagonal_of(&reference), HESSIAN_TOL);
        }
    }

    #[test]
    fn test_diag_h_sigmoid_mlp_mse() {
        let mut rng = SimpleRng::new(5);
        let model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Mean));
        let x = random_tensor(&[3, 3], &mut rng);
        let target = regression_target(3, &mut rng);
        check_diag_h(model, x, target);
    }

    #[test]
    fn test_diag_h_sigmoid_mlp_cross_entropy() {
        let mut rng = SimpleRng::new(6);
        let model = sigmoid_mlp(&mut rng, Loss::cross_entropy(Reduction::Sum));
        let x = random_tensor(&[3, 3], &mut rng);
        check_diag_h(model, x, Target::Classes(vec![1, 0, 1]));
    }

    #[test]
    fn test_diag_h_cnn() {
        let mut rng = SimpleRng::new(7);
        let model = small_cnn(&mut rng, Loss::cross_entropy(Reduction::Mean));
        let x = random_tensor(&[2, 1, 3, 3], &mut rng);
        check_diag_h(model, x, Target::Classes(vec![0, 1]));
    }

    #[test]
    fn test_diag_h_parallel_siblings() {
        let mut rng = SimpleRng::new(8);
        let parallel = Parallel::new(vec![
            DenseLayer::new(3, 2, true, &mut rng),
            DenseLayer::new(3, 2, true, &mut rng),
        ])
        .unwrap();
        let model = Sequential::new(
            vec![
                parallel.into(),
                ActivationLayer::sigmoid().into(),
                DenseLayer::new(4, 2, true, &mut rng).into(),
            ],
            Loss::mse(Reduction::Sum),
        );
        assert_eq!(model.param_ids().len(), 6);
        let x = random_tensor(&[2, 3], &mut rng);
        let target = regression_target(2, &mut rng);
        check_diag_h(model, x, target);
    }

    #[test]
    fn test_diag_h_at_relu_kink_is_unchanged() {
        // the pre-activation of the first unit is exactly zero
        let first = DenseLayer::from_parameters(
            ndarray::array![[0.0, 0.0], [1.0, -1.0]],
            Some(ndarray::array![0.0, 0.5]),
        )
        .unwrap();
        let second = DenseLayer::from_parameters(ndarray::array![[1.0, 2.0]], None).unwrap();
        let mut model = Sequential::new(
            vec![first.into(), ActivationLayer::relu().into(), second.into()],
            Loss::mse(Reduction::Sum),
        );
        let x = tensor(&[1, 2], vec![1.0, 0.25]);
        let target = Target::Regression(tensor(&[1, 1], vec![0.0]));
        let artifacts = run(&mut model, &x, &target, &[Extension::DiagH], Strategies::default());
        // unit 0 is treated as inactive: its weights see no curvature
        let diag = artifacts.diag_h(ParamId::weight(0)).unwrap();
        assert_abs_diff_eq!(diag[[0, 0]], 0.0, epsilon = 1e-12);
        // unit 1: 2 · 2² · x²
        assert_abs_diff_eq!(diag[[1, 0]], 8.0, epsilon = 1e-12);
    }
}

// ============================================================================
// Hessian Block Tests
// ============================================================================

mod hbp_tests {
    use super::*;

    fn check_blocks(mut model: Sequential, x: Tensor, target: Target, strategies: Strategies) {
        let artifacts = run(&mut model, &x, &target, &[Extension::Hbp], strategies);
        for id in model.param_ids() {
            let reference = fd_hessian(&model, &x, &target, id);
            assert_matrix_close(&artifacts.hessian(id).unwrap(), &reference, HESSIAN_TOL);
        }
    }

    #[test]
    fn test_sqrt_blocks_are_exact() {
        let mut rng = SimpleRng::new(9);
        let model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Mean));
        let x = random_tensor(&[3, 3], &mut rng);
        let target = regression_target(3, &mut rng);
        check_blocks(model, x, target, Strategies::default());
    }

    #[test]
    fn test_sqrt_blocks_cnn() {
        let mut rng = SimpleRng::new(10);
        let model = small_cnn(&mut rng, Loss::mse(Reduction::Sum));
        let x = random_tensor(&[2, 1, 3, 3], &mut rng);
        let target = regression_target(2, &mut rng);
        check_blocks(model, x, target, Strategies::default());
    }

    #[test]
    fn test_sqrt_blocks_are_factored() {
        let mut rng = SimpleRng::new(11);
        let mut model = sigmoid_mlp(&mut rng, Loss::cross_entropy(Reduction::Mean));
        let x = random_tensor(&[2, 3], &mut rng);
        let artifacts = run(
            &mut model,
            &x,
            &Target::Classes(vec![0, 1]),
            &[Extension::Hbp],
            Strategies::default(),
        );
        match artifacts.curvature(ParamId::weight(0)).unwrap() {
            // the sigmoid residual contributes signed blocks next to the loss factor
            Curvature::Sqrt(factor) => assert!(factor.blocks().len() >= 2),
            other => panic!("expected a factored block, got {:?}", other),
        }
        match artifacts.curvature(ParamId::weight(2)).unwrap() {
            Curvature::Sqrt(factor) => assert_eq!(factor.blocks().len(), 1),
            other => panic!("expected a factored block, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_average_exact_for_single_example() {
        for ea in ["E[J^T E(H) J]", "E(J^T) E(H) E(J)"] {
            let mut rng = SimpleRng::new(12);
            let model = sigmoid_mlp(&mut rng, Loss::cross_entropy(Reduction::Mean));
            let x = random_tensor(&[1, 3], &mut rng);
            let strategies = Strategies::from_labels("exact", "average", ea).unwrap();
            check_blocks(model, x, Target::Classes(vec![1]), strategies);
        }
    }

    #[test]
    fn test_batch_average_exact_for_linear_mse() {
        let mut rng = SimpleRng::new(13);
        let model = Sequential::new(
            vec![
                DenseLayer::new(3, 4, true, &mut rng).into(),
                DenseLayer::new(4, 2, true, &mut rng).into(),
            ],
            Loss::mse(Reduction::Mean),
        );
        let x = random_tensor(&[4, 3], &mut rng);
        let target = regression_target(4, &mut rng);
        let strategies = Strategies::from_labels("exact", "average", "E[J^T E(H) J]").unwrap();
        check_blocks(model, x, target, strategies);
    }

    #[test]
    fn test_chen_averages_parameter_jacobians() {
        let mut rng = SimpleRng::new(14);
        let mut model = Sequential::new(
            vec![DenseLayer::new(2, 1, false, &mut rng).into()],
            Loss::mse(Reduction::Sum),
        );
        let x = tensor(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]);
        let target = Target::Regression(tensor(&[2, 1], vec![0.0, 0.0]));
        let strategies = Strategies::from_labels("exact", "average", "E(J^T) E(H) E(J)").unwrap();
        let artifacts = run(&mut model, &x, &target, &[Extension::Hbp], strategies);
        // N · J̄ᵀ Ĥ J̄ with J̄ = [0.5, 0.5] and Ĥ = 2
        let expected = Array2::from_elem((2, 2), 1.0);
        assert_matrix_close(&artifacts.hessian(ParamId::weight(0)).unwrap(), &expected, 1e-12);
    }
}

// ============================================================================
// Curvature-Vector Product Tests
// ============================================================================

mod hvp_tests {
    use super::*;

    #[test]
    fn test_hvp_matches_dense_block_for_weight_and_bias() {
        for backprop in ["sqrt", "average"] {
            let mut rng = SimpleRng::new(15);
            let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Sum));
            let x = random_tensor(&[1, 3], &mut rng);
            let target = regression_target(1, &mut rng);
            let strategies = Strategies::from_labels("exact", backprop, "E[J^T E(H) J]").unwrap();
            let artifacts = run(&mut model, &x, &target, &[Extension::Hbp], strategies);

            for id in [ParamId::weight(0), ParamId::bias(0), ParamId::weight(2), ParamId::bias(2)] {
                let shape = model.param(id).unwrap().shape().to_vec();
                let v = random_tensor(&shape, &mut rng);
                let hv = artifacts.hvp(id, &v).unwrap();
                assert_eq!(hv.shape(), shape.as_slice());

                let v_flat: Array1<f64> = v.iter().copied().collect();
                let expected = fd_hessian(&model, &x, &target, id).dot(&v_flat);
                assert_vec_close(&flat(&hv), &expected.to_vec(), 1e-5);
            }
        }
    }

    #[test]
    fn test_hvp_rejects_wrong_shape() {
        let mut rng = SimpleRng::new(16);
        let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Sum));
        let x = random_tensor(&[2, 3], &mut rng);
        let target = regression_target(2, &mut rng);
        let artifacts = run(&mut model, &x, &target, &[Extension::Hbp], Strategies::default());
        let wrong = random_tensor(&[3], &mut rng);
        assert!(matches!(
            artifacts.hvp(ParamId::bias(0), &wrong),
            Err(BackpropError::ShapeError(_))
        ));
    }
}

// ============================================================================
// Loss Hessian Strategy Tests
// ============================================================================

mod loss_strategy_tests {
    use super::*;

    #[test]
    fn test_average_strategy_is_exact_for_mse() {
        let mut rng = SimpleRng::new(17);
        let base = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Mean));
        let x = random_tensor(&[3, 3], &mut rng);
        let target = regression_target(3, &mut rng);

        let mut exact = base.clone();
        let exact_artifacts =
            run(&mut exact, &x, &target, &[Extension::DiagH], Strategies::default());
        let mut averaged = base;
        let strategies = Strategies::from_labels("average", "sqrt", "E[J^T E(H) J]").unwrap();
        let averaged_artifacts = run(&mut averaged, &x, &target, &[Extension::DiagH], strategies);

        // last layer: the per-example MSE Hessian is the same for every example
        let id = ParamId::weight(2);
        assert_vec_close(
            &flat(averaged_artifacts.diag_h(id).unwrap()),
            &flat(exact_artifacts.diag_h(id).unwrap()),
            1e-12,
        );
    }

    #[test]
    fn test_sampled_diag_h_converges() {
        let mut rng = SimpleRng::new(18);
        let base = Sequential::new(
            vec![DenseLayer::new(2, 3, true, &mut rng).into()],
            Loss::cross_entropy(Reduction::Sum),
        );
        let x = random_tensor(&[2, 2], &mut rng);
        let target = Target::Classes(vec![0, 2]);

        let mut exact = base.clone();
        let reference = run(&mut exact, &x, &target, &[Extension::DiagH], Strategies::default());
        let mut sampled = base;
        let strategies = Strategies::from_labels("sampling", "sqrt", "E[J^T E(H) J]")
            .unwrap()
            .with_mc_samples(100_000);
        let approx = run(&mut sampled, &x, &target, &[Extension::DiagH], strategies);

        for id in [ParamId::weight(0), ParamId::bias(0)] {
            assert_vec_close(
                &flat(approx.diag_h(id).unwrap()),
                &flat(reference.diag_h(id).unwrap()),
                1e-2,
            );
        }
    }

    #[test]
    fn test_sampling_is_reproducible_per_seed() {
        let mut rng = SimpleRng::new(19);
        let base = sigmoid_mlp(&mut rng, Loss::cross_entropy(Reduction::Mean));
        let x = random_tensor(&[2, 3], &mut rng);
        let target = Target::Classes(vec![1, 0]);
        let strategies = Strategies::from_labels("sampling", "sqrt", "E[J^T E(H) J]")
            .unwrap()
            .with_mc_samples(3);

        let mut a = base.clone();
        let mut b = base;
        let first = run(&mut a, &x, &target, &[Extension::DiagH], strategies);
        let second = run(&mut b, &x, &target, &[Extension::DiagH], strategies);
        assert_eq!(
            first.diag_h(ParamId::weight(0)).unwrap(),
            second.diag_h(ParamId::weight(0)).unwrap()
        );
    }
}

// ============================================================================
// Error Tests
// ============================================================================

mod error_tests {
    use super::*;

    #[test]
    fn test_second_order_requires_a_hessian() {
        let mut rng = SimpleRng::new(20);
        let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::None));
        let x = random_tensor(&[2, 3], &mut rng);
        model.forward_loss(&x, regression_target(2, &mut rng)).unwrap();
        let mut engine = ExtendedBackprop::with_extensions(&[Extension::DiagH]);
        assert!(matches!(
            engine.backward(&mut model),
            Err(BackpropError::HessianUndefined(_))
        ));
        // the ordinary gradients are still attached
        assert!(model.grad(ParamId::weight(0)).is_some());
    }

    #[test]
    fn test_undefined_hessian_fails_the_whole_pass() {
        let mut rng = SimpleRng::new(25);
        let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::None));
        let x = random_tensor(&[2, 3], &mut rng);
        model.forward_loss(&x, regression_target(2, &mut rng)).unwrap();

        let mut mixed =
            ExtendedBackprop::with_extensions(&[Extension::BatchGrad, Extension::DiagH]);
        assert!(matches!(
            mixed.backward(&mut model),
            Err(BackpropError::HessianUndefined(_))
        ));

        // first-order extensions alone never touch the loss Hessian
        let mut first_order = ExtendedBackprop::with_extensions(&[Extension::BatchGrad]);
        let artifacts = first_order.backward(&mut model).unwrap();
        assert_eq!(artifacts.grad_batch(ParamId::weight(0)).unwrap().shape()[0], 2);
    }

    #[test]
    fn test_backward_without_forward_fails() {
        let mut rng = SimpleRng::new(21);
        let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Mean));
        let mut engine = ExtendedBackprop::with_extensions(&[Extension::BatchGrad]);
        assert!(engine.backward(&mut model).is_err());
    }

    #[test]
    fn test_no_extensions_produces_no_artifacts() {
        let mut rng = SimpleRng::new(22);
        let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Mean));
        let x = random_tensor(&[2, 3], &mut rng);
        let target = regression_target(2, &mut rng);
        let artifacts = run(&mut model, &x, &target, &[], Strategies::default());
        assert!(artifacts.is_empty());
        assert!(model.grad(ParamId::bias(2)).is_some());
    }

    #[test]
    fn test_unrequested_artifact_is_missing() {
        let mut rng = SimpleRng::new(23);
        let mut model = sigmoid_mlp(&mut rng, Loss::mse(Reduction::Mean));
        let x = random_tensor(&[2, 3], &mut rng);
        let target = regression_target(2, &mut rng);
        let mut artifacts =
            run(&mut model, &x, &target, &[Extension::DiagH], Strategies::default());
        match artifacts.curvature(ParamId::weight(0)) {
            Err(BackpropError::MissingArtifact { param, artifact }) => {
                assert_eq!(param, "0.weight");
                assert_eq!(artifact, "curvature");
            }
            other => panic!("expected MissingArtifact, got {:?}", other),
        }
        artifacts.clear_diag_h();
        assert!(artifacts.diag_h(ParamId::weight(0)).is_err());
    }

    #[test]
    fn test_hook_rejects_mismatched_gradient() {
        let mut rng = SimpleRng::new(24);
        let mut layer: Layer = DenseLayer::new(2, 2, true, &mut rng).into();
        layer.forward(&random_tensor(&[3, 2], &mut rng)).unwrap();
        let mut ctx = rust_extended_backprop::context::ExtensionContext::new(
            &[Extension::BatchGrad],
            Strategies::default(),
        );
        let wrong = random_tensor(&[2, 2], &mut rng);
        assert!(matches!(
            rust_extended_backprop::engine::backward_hook(0, &layer, &wrong, &mut ctx),
            Err(BackpropError::ShapeError(_))
        ));
    }
}
