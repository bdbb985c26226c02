//! Extended backpropagation engine
//!
//! Runs the host backward pass, seeds a fresh [`ExtensionContext`] with the loss
//! curvature and then walks the layers in reverse order. At every layer the active
//! extensions read the curvature at the layer output, after which the curvature is
//! moved one layer upstream.

use crate::artifacts::Artifacts;
use crate::config::ExtensionSettings;
use crate::context::ExtensionContext;
use crate::curvature::SignedFactor;
use crate::error::{BackpropError, Result};
use crate::extensions::{diag_h, first_order, hbp, Extension, LayerStep};
use crate::layers::Layer;
use crate::model::Sequential;
use crate::strategies::Strategies;
use crate::utils::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

/// Engine holding the extension set, the strategies and the Monte-Carlo RNG.
#[derive(Debug, Clone)]
pub struct ExtendedBackprop {
    extensions: Vec<Extension>,
    strategies: Strategies,
    rng: StdRng,
}

impl ExtendedBackprop {
    pub fn new(settings: ExtensionSettings) -> Self {
        Self {
            extensions: settings.extensions,
            strategies: settings.strategies,
            rng: StdRng::seed_from_u64(settings.seed),
        }
    }

    /// Engine with default strategies.
    pub fn with_extensions(extensions: &[Extension]) -> Self {
        Self::new(ExtensionSettings {
            extensions: extensions.to_vec(),
            ..ExtensionSettings::default()
        })
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    /// Ordinary backward plus one extended pass over `model`.
    ///
    /// Requires a prior [`Sequential::forward_loss`]. The pass is all or nothing: if any
    /// extension fails, including a loss Hessian that is undefined under
    /// [`crate::loss::Reduction::None`], no artifacts are returned, not even first-order
    /// ones. The ordinary gradients stay on the model either way.
    pub fn backward(&mut self, model: &mut Sequential) -> Result<Artifacts> {
        let grad_outputs = model.backward()?;
        let mut ctx = ExtensionContext::new(&self.extensions, self.strategies);
        info!(
            extensions = ?ctx.extensions(),
            loss_hessian = %self.strategies.loss_hessian,
            backprop = %self.strategies.backprop,
            "starting extended backward pass"
        );

        if ctx.needs_curvature() {
            let output = model
                .output()
                .ok_or_else(|| BackpropError::shape("model has no cached output"))?;
            let target = model
                .target()
                .ok_or_else(|| BackpropError::shape("model has no target"))?;
            ctx.init_loss_curvature(model.loss().derivatives(), output, target, &mut self.rng)?;
        }

        for (index, layer) in model.layers().iter().enumerate().rev() {
            backward_hook(index, layer, &grad_outputs[index], &mut ctx)?;
        }
        let artifacts = ctx.into_artifacts();
        info!(params = artifacts.param_ids().len(), "extended backward pass done");
        Ok(artifacts)
    }
}

/// Backward hook of layer `index`: run the active extensions on every parameter, then
/// move the in-flight curvature to the layer input.
pub fn backward_hook(
    index: usize,
    layer: &Layer,
    grad_output: &Tensor,
    ctx: &mut ExtensionContext,
) -> Result<()> {
    let (input, output) = layer.cached()?;
    if grad_output.shape() != output.shape() {
        return Err(BackpropError::shape(format!(
            "layer {} ({}): output gradient {:?} does not match output {:?}",
            index,
            layer.name(),
            grad_output.shape(),
            output.shape()
        )));
    }
    debug!(layer = index, kind = layer.name(), "backward hook");

    let strategies = *ctx.strategies();
    let blocks = if ctx.extensions().is_empty() {
        Vec::new()
    } else {
        layer.parameter_blocks()
    };
    for block in blocks {
        let block_output = block.slice_batched(output);
        let block_grad = block.slice_batched(grad_output);
        let factors: Vec<_> = ctx
            .curvature()
            .sqrt_factors
            .iter()
            .map(|f| SignedFactor::new(block.slice_stacked(&f.factor), f.sign))
            .collect();
        let batch_hessian = ctx
            .curvature()
            .batch_hessian
            .as_ref()
            .map(|m| block.slice_matrix(m));

        for kind in block.kinds() {
            let step = LayerStep {
                block: &block,
                kind,
                input,
                output: &block_output,
                grad_output: &block_grad,
                sqrt_factors: &factors,
                batch_hessian: batch_hessian.as_ref(),
                strategies: &strategies,
            };
            let id = block.id(index, kind);
            let shape = block.provider.param_shape(kind).unwrap_or_default();

            let mut grad_batch = None;
            if ctx.is_active(Extension::BatchGrad) || ctx.is_active(Extension::SumGradSquared) {
                grad_batch = Some(first_order::batch_grad(&step)?);
            }
            let diag = if ctx.is_active(Extension::DiagH) {
                Some(diag_h::diag_h(&step)?)
            } else {
                None
            };
            let curvature = if ctx.is_active(Extension::Hbp) {
                Some(hbp::hbp(&step)?)
            } else {
                None
            };

            let store_grad_batch = ctx.is_active(Extension::BatchGrad);
            let store_second_moment = ctx.is_active(Extension::SumGradSquared);
            let entry = ctx.artifacts_mut().register(id, shape);
            if let Some(g) = grad_batch {
                if store_second_moment {
                    entry.sum_grad_squared = Some(first_order::sum_grad_squared(&g));
                }
                if store_grad_batch {
                    entry.grad_batch = Some(g);
                }
            }
            entry.diag_h = diag;
            entry.curvature = curvature;
            debug!(param = %id, "extensions evaluated");
        }
    }

    if index > 0 {
        ctx.backpropagate(layer.derivatives(), input, output, grad_output)?;
    }
    Ok(())
}
