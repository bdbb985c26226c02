//! Per-example gradients and their second moment
//!
//! Both come from one transposed parameter-Jacobian product with the output gradient,
//! evaluated without summing over the batch.

use crate::error::Result;
use crate::extensions::LayerStep;
use crate::utils::tensor::Tensor;
use ndarray::Axis;

/// Per-example gradients `[N, *shape]`.
pub fn batch_grad(step: &LayerStep<'_, '_>) -> Result<Tensor> {
    let mat = step.grad_output.clone().insert_axis(Axis(0));
    let grads = step.block.provider.param_jac_t_mat_prod(
        step.kind,
        step.input,
        step.output,
        &mat,
        false,
    )?;
    Ok(grads.index_axis_move(Axis(0), 0))
}

/// `Σₙ gₙ²` elementwise, from per-example gradients `[N, *shape]`.
pub fn sum_grad_squared(grad_batch: &Tensor) -> Tensor {
    grad_batch.mapv(|g| g * g).sum_axis(Axis(0))
}
