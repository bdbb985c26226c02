//! Hessian blocks per parameter
//!
//! Under square-root propagation the block is kept factored: every in-flight factor is
//! projected onto the parameter, giving rows `J_θᵀ s` with the factor's sign. Under
//! batch averaging the block is an implicit sandwich of the parameter Jacobians around
//! the propagated matrix.

use crate::curvature::{Curvature, HvpOperator, SqrtFactor};
use crate::error::{BackpropError, Result};
use crate::extensions::LayerStep;
use crate::strategies::BackpropStrategy;
use crate::utils::tensor::{as_matrix, numel};
use ndarray::Array2;

pub fn hbp(step: &LayerStep<'_, '_>) -> Result<Curvature> {
    match step.strategies.backprop {
        BackpropStrategy::Sqrt => sqrt_block(step),
        BackpropStrategy::BatchAverage => operator_block(step),
    }
}

fn param_dim(step: &LayerStep<'_, '_>) -> Result<usize> {
    step.block
        .provider
        .param_shape(step.kind)
        .map(|shape| numel(&shape))
        .ok_or_else(|| BackpropError::shape(format!("layer has no {}", step.kind)))
}

fn sqrt_block(step: &LayerStep<'_, '_>) -> Result<Curvature> {
    let mut factor = SqrtFactor::new(param_dim(step)?);
    for signed in step.sqrt_factors {
        let projected = step.block.provider.param_jac_t_mat_prod(
            step.kind,
            step.input,
            step.output,
            &signed.factor,
            false,
        )?;
        let rows = signed.num_vectors() * signed.batch_size();
        factor.push(as_matrix(&projected, rows)?, signed.sign)?;
    }
    Ok(Curvature::Sqrt(factor))
}

/// `Σₙ Jₙᵀ Ĥ Jₙ`, or `N · J̄ᵀ Ĥ J̄` when parameter Jacobians are averaged first.
fn operator_block(step: &LayerStep<'_, '_>) -> Result<Curvature> {
    let inner = step
        .batch_hessian
        .ok_or_else(|| BackpropError::shape("no batch-averaged curvature in flight"))?;
    let jacobians = step
        .block
        .provider
        .param_jacobians(step.kind, step.input, step.output)?;
    let n = jacobians.len();
    if step.strategies.expectation.should_average_param_jac() && n > 0 {
        let (rows, cols) = jacobians[0].dim();
        let mean = jacobians
            .iter()
            .fold(Array2::zeros((rows, cols)), |acc, j| acc + j)
            / n as f64;
        Ok(Curvature::Operator(HvpOperator::new(
            vec![mean],
            inner.clone(),
            n as f64,
        )?))
    } else {
        Ok(Curvature::Operator(HvpOperator::new(
            jacobians,
            inner.clone(),
            1.0,
        )?))
    }
}
