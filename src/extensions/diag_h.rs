//! Diagonal of the parameter Hessian from signed square-root factors
//!
//! For a factor `s` with sign `σ` at the layer output, the parameter contribution is
//! `σ Σ_{v,n} (J_θᵀ s[v, n])²`, summed over all in-flight factors.

use crate::error::{BackpropError, Result};
use crate::extensions::LayerStep;
use crate::utils::tensor::Tensor;
use ndarray::{Axis, IxDyn};

pub fn diag_h(step: &LayerStep<'_, '_>) -> Result<Tensor> {
    let shape = step
        .block
        .provider
        .param_shape(step.kind)
        .ok_or_else(|| BackpropError::shape(format!("layer has no {}", step.kind)))?;
    let mut diagonal = Tensor::zeros(IxDyn(&shape));
    for factor in step.sqrt_factors {
        let projected = step.block.provider.param_jac_t_mat_prod(
            step.kind,
            step.input,
            step.output,
            &factor.factor,
            false,
        )?;
        let squares = projected.mapv(|x| x * x).sum_axis(Axis(0)).sum_axis(Axis(0));
        diagonal.scaled_add(factor.sign.value(), &squares);
    }
    Ok(diagonal)
}
