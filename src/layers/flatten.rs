//! Flatten layer: `[N, *features]` → `[N, prod(features)]`

use crate::error::{BackpropError, Result};
use crate::layers::r#trait::Derivatives;
use crate::utils::tensor::{check_stacked, numel, reshape, with_leading, Tensor};

/// Reshape every sample to a vector; the Jacobian is a (reshaped) identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlattenLayer;

impl FlattenLayer {
    pub fn new() -> Self {
        Self
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() < 2 {
            return Err(BackpropError::shape(format!(
                "flatten expects input [N, ...], got {:?}",
                input.shape()
            )));
        }
        let n = input.shape()[0];
        reshape(input, &[n, numel(&input.shape()[1..])])
    }
}

impl Derivatives for FlattenLayer {
    fn jac_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        let v = check_stacked(mat, input.shape(), "flatten jac_mat_prod")?;
        reshape(mat, &with_leading(&[v], output.shape()))
    }

    fn jac_t_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        let v = check_stacked(mat, output.shape(), "flatten jac_t_mat_prod")?;
        reshape(mat, &with_leading(&[v], input.shape()))
    }

    fn hessian_is_zero(&self) -> bool {
        true
    }
}
