// Shared helpers for the integration tests: seeded tensors and brute-force
// finite-difference references.
#![allow(dead_code)]

use ndarray::{Array2, IxDyn};
use rust_extended_backprop::layers::Layer;
use rust_extended_backprop::utils::rng::SimpleRng;
use rust_extended_backprop::utils::tensor::Tensor;
use rust_extended_backprop::{Loss, ParamId, Sequential, Target};

pub const FD_EPS: f64 = 1e-5;

pub fn tensor(shape: &[usize], values: Vec<f64>) -> Tensor {
    Tensor::from_shape_vec(IxDyn(shape), values).expect("shape and data must agree")
}

pub fn random_tensor(shape: &[usize], rng: &mut SimpleRng) -> Tensor {
    Tensor::from_shape_fn(IxDyn(shape), |_| rng.gen_range_f64(-1.0, 1.0))
}

pub fn model(layers: Vec<Layer>, loss: Loss) -> Sequential {
    Sequential::new(layers, loss)
}

/// Ordinary gradient of the loss with respect to `id`, flattened.
pub fn loss_gradient(model: &mut Sequential, x: &Tensor, target: &Target, id: ParamId) -> Vec<f64> {
    model.forward_loss(x, target.clone()).unwrap();
    model.backward().unwrap();
    model.grad(id).unwrap().iter().copied().collect()
}

/// Hessian block of the loss with respect to `id` by central differences of the
/// ordinary gradient.
pub fn fd_hessian(model: &Sequential, x: &Tensor, target: &Target, id: ParamId) -> Array2<f64> {
    let theta = model.param(id).unwrap();
    let p = theta.len();
    let mut hessian = Array2::zeros((p, p));
    for j in 0..p {
        let mut plus = theta.clone();
        *plus.iter_mut().nth(j).unwrap() += FD_EPS;
        let mut minus = theta.clone();
        *minus.iter_mut().nth(j).unwrap() -= FD_EPS;

        let mut m = model.clone();
        m.set_param(id, &plus).unwrap();
        let g_plus = loss_gradient(&mut m, x, target, id);
        m.set_param(id, &minus).unwrap();
        let g_minus = loss_gradient(&mut m, x, target, id);

        for i in 0..p {
            hessian[[i, j]] = (g_plus[i] - g_minus[i]) / (2.0 * FD_EPS);
        }
    }
    // symmetrize the difference quotient
    (&hessian + &hessian.t()) * 0.5
}

pub fn assert_matrix_close(actual: &Array2<f64>, expected: &Array2<f64>, tol: f64) {
    assert_eq!(actual.dim(), expected.dim());
    for ((idx, a), e) in actual.indexed_iter().zip(expected.iter()) {
        assert!(
            (a - e).abs() <= tol,
            "entry {:?}: got {}, expected {} (tol {})",
            idx,
            a,
            e,
            tol
        );
    }
}

pub fn assert_tensor_close(actual: &Tensor, expected: &Tensor, tol: f64) {
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() <= tol, "got {}, expected {} (tol {})", a, e, tol);
    }
}
