//! Elementwise activation layers
//!
//! ReLU, Sigmoid and Tanh act independently on every feature, so their Jacobian is the
//! diagonal `f'(x)` and their Hessian with respect to the input is the diagonal
//! `f''(x)`. Products with stacked matrices reduce to broadcast multiplication.

use crate::error::{BackpropError, Result};
use crate::layers::r#trait::Derivatives;
use crate::utils::activations::{
    relu, relu_derivative, sigmoid, sigmoid_derivative, sigmoid_second_derivative,
    tanh_derivative, tanh_second_derivative,
};
use crate::utils::tensor::{check_stacked, mul_broadcast, Tensor};
use serde::{Deserialize, Serialize};

/// Supported elementwise nonlinearities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
}

/// Stateless elementwise activation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationLayer {
    kind: ActivationKind,
}

impl ActivationLayer {
    pub fn new(kind: ActivationKind) -> Self {
        Self { kind }
    }

    pub fn relu() -> Self {
        Self::new(ActivationKind::Relu)
    }

    pub fn sigmoid() -> Self {
        Self::new(ActivationKind::Sigmoid)
    }

    pub fn tanh() -> Self {
        Self::new(ActivationKind::Tanh)
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() < 2 {
            return Err(BackpropError::shape(format!(
                "activation expects batched input [N, ...], got {:?}",
                input.shape()
            )));
        }
        Ok(match self.kind {
            ActivationKind::Relu => input.mapv(relu),
            ActivationKind::Sigmoid => input.mapv(sigmoid),
            ActivationKind::Tanh => input.mapv(f64::tanh),
        })
    }

    /// First derivative `f'(x)`, shape `[N, *in]`.
    pub fn derivative(&self, input: &Tensor, output: &Tensor) -> Tensor {
        match self.kind {
            ActivationKind::Relu => input.mapv(relu_derivative),
            ActivationKind::Sigmoid => output.mapv(sigmoid_derivative),
            ActivationKind::Tanh => output.mapv(tanh_derivative),
        }
    }

    fn diagonal_prod(
        &self,
        input: &Tensor,
        output: &Tensor,
        mat: &Tensor,
        what: &str,
    ) -> Result<Tensor> {
        check_stacked(mat, input.shape(), what)?;
        mul_broadcast(mat, &self.derivative(input, output))
    }
}

impl Derivatives for ActivationLayer {
    fn jac_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        self.diagonal_prod(input, output, mat, "activation jac_mat_prod")
    }

    fn jac_t_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        self.diagonal_prod(input, output, mat, "activation jac_t_mat_prod")
    }

    fn hessian_is_zero(&self) -> bool {
        matches!(self.kind, ActivationKind::Relu)
    }

    /// ReLU is only piecewise linear; its second derivative is undefined at `x == 0`.
    fn hessian_is_zero_at(&self, input: &Tensor) -> bool {
        match self.kind {
            ActivationKind::Relu => !input.iter().any(|&x| x == 0.0),
            _ => false,
        }
    }

    fn hessian_diagonal(&self, input: &Tensor, output: &Tensor) -> Result<Tensor> {
        Ok(match self.kind {
            ActivationKind::Relu => Tensor::zeros(input.raw_dim()),
            ActivationKind::Sigmoid => output.mapv(sigmoid_second_derivative),
            ActivationKind::Tanh => output.mapv(tanh_second_derivative),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_relu_hessian_predicate_at_kink() {
        let layer = ActivationLayer::relu();
        let smooth = Tensor::from_shape_vec(IxDyn(&[1, 3]), vec![-1.0, 0.5, 2.0]).unwrap();
        let kink = Tensor::from_shape_vec(IxDyn(&[1, 3]), vec![-1.0, 0.0, 2.0]).unwrap();

        assert!(layer.hessian_is_zero());
        assert!(layer.hessian_is_zero_at(&smooth));
        assert!(!layer.hessian_is_zero_at(&kink));
    }

    #[test]
    fn test_sigmoid_jacobian_is_diagonal() {
        let layer = ActivationLayer::sigmoid();
        let x = Tensor::from_shape_vec(IxDyn(&[2, 2]), vec![0.0, 1.0, -1.0, 2.0]).unwrap();
        let y = layer.forward(&x).unwrap();
        let mat = Tensor::ones(IxDyn(&[1, 2, 2]));
        let jmat = layer.jac_mat_prod(&x, &y, &mat).unwrap();

        assert!((jmat[[0, 0, 0]] - 0.25).abs() < 1e-12);
        assert!(!layer.hessian_is_zero());
    }
}
