//! Per-traversal state of an extended backward pass
//!
//! The context knows which extensions are active and under which strategies, carries
//! the curvature in flight between consecutive layers, and accumulates the results.
//! One context is created per pass and dropped afterwards.

use crate::artifacts::Artifacts;
use crate::curvature::SignedFactor;
use crate::error::{BackpropError, Result};
use crate::extensions::Extension;
use crate::layers::Derivatives;
use crate::loss::{LossDerivatives, Target};
use crate::strategies::{LossHessianStrategy, Strategies};
use crate::utils::tensor::{numel, reshape, with_leading, Tensor};
use ndarray::{Array2, Axis, IxDyn};
use rand::rngs::StdRng;
use tracing::{debug, warn};

/// Curvature at the output of the layer about to be visited.
#[derive(Debug, Clone, Default)]
pub struct CurvatureState {
    /// Signed square-root factors `[V, N, *out]`.
    pub sqrt_factors: Vec<SignedFactor>,
    /// Batch-averaged matrix over the flattened per-sample output, `[D, D]`.
    pub batch_hessian: Option<Array2<f64>>,
}

#[derive(Debug, Clone)]
pub struct ExtensionContext {
    extensions: Vec<Extension>,
    strategies: Strategies,
    curvature: CurvatureState,
    artifacts: Artifacts,
}

impl ExtensionContext {
    pub fn new(extensions: &[Extension], strategies: Strategies) -> Self {
        let mut active = extensions.to_vec();
        active.sort();
        active.dedup();
        Self {
            extensions: active,
            strategies,
            curvature: CurvatureState::default(),
            artifacts: Artifacts::new(),
        }
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn is_active(&self, extension: Extension) -> bool {
        self.extensions.contains(&extension)
    }

    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    pub fn needs_sqrt_factors(&self) -> bool {
        self.extensions
            .iter()
            .any(|e| e.needs_sqrt_factors(&self.strategies))
    }

    pub fn needs_batch_hessian(&self) -> bool {
        self.extensions
            .iter()
            .any(|e| e.needs_batch_hessian(&self.strategies))
    }

    pub fn needs_curvature(&self) -> bool {
        self.needs_sqrt_factors() || self.needs_batch_hessian()
    }

    pub fn curvature(&self) -> &CurvatureState {
        &self.curvature
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    pub fn artifacts_mut(&mut self) -> &mut Artifacts {
        &mut self.artifacts
    }

    pub fn into_artifacts(self) -> Artifacts {
        self.artifacts
    }

    /// Seed the in-flight curvature with the loss Hessian at the network output.
    pub fn init_loss_curvature(
        &mut self,
        loss: &dyn LossDerivatives,
        input: &Tensor,
        target: &Target,
        rng: &mut StdRng,
    ) -> Result<()> {
        let n = input.shape().first().copied().unwrap_or(0);
        let strategy = self.strategies.loss_hessian;
        let mc_samples = self.strategies.mc_samples;

        if self.needs_sqrt_factors() {
            let factor = match strategy {
                LossHessianStrategy::Exact => loss.sqrt_hessian(input, target)?,
                LossHessianStrategy::Sampling => {
                    loss.sqrt_hessian_sampled(input, target, mc_samples, rng)?
                }
                LossHessianStrategy::Average => {
                    shared_average_factor(&loss.sqrt_hessian(input, target)?)?
                }
            };
            debug!(
                strategy = %strategy,
                vectors = factor.shape()[0],
                "initialized loss square-root factor"
            );
            self.curvature.sqrt_factors = vec![SignedFactor::positive(factor)];
        }

        if self.needs_batch_hessian() {
            let matrix = match strategy {
                LossHessianStrategy::Exact | LossHessianStrategy::Average => {
                    loss.sum_hessian(input, target)? / n as f64
                }
                LossHessianStrategy::Sampling => {
                    let sampled = SignedFactor::positive(
                        loss.sqrt_hessian_sampled(input, target, mc_samples, rng)?,
                    );
                    sampled.reconstruct_sum()? / n as f64
                }
            };
            debug!(
                strategy = %strategy,
                dim = matrix.nrows(),
                "initialized batch-averaged loss Hessian"
            );
            self.curvature.batch_hessian = Some(matrix);
        }
        Ok(())
    }

    /// Move the in-flight curvature from a layer's output to its input.
    ///
    /// Adds the residual `diag(f''(x) ⊙ g)` for layers whose Hessian is not zero.
    pub fn backpropagate(
        &mut self,
        layer: &dyn Derivatives,
        input: &Tensor,
        output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<()> {
        if !self.needs_curvature() {
            return Ok(());
        }
        if layer.hessian_is_zero() && !layer.hessian_is_zero_at(input) {
            warn!(
                "layer declares a zero Hessian but its input hits a non-differentiable point; \
                 the residual term is treated as zero"
            );
        }
        let residual = if layer.hessian_is_zero() {
            None
        } else {
            Some(&layer.hessian_diagonal(input, output)? * grad_output)
        };

        if self.needs_sqrt_factors() {
            let mut propagated = self
                .curvature
                .sqrt_factors
                .iter()
                .map(|f| {
                    Ok(SignedFactor::new(
                        layer.jac_t_mat_prod(input, output, &f.factor)?,
                        f.sign,
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            if let Some(r) = &residual {
                propagated.extend(residual_factors(r)?);
            }
            self.curvature.sqrt_factors = propagated;
        }

        if let Some(matrix) = self.curvature.batch_hessian.take() {
            let mut next = layer.ea_jac_t_mat_jac_prod(
                input,
                output,
                &matrix,
                self.strategies.expectation,
            )?;
            if let Some(r) = &residual {
                let n = r.shape()[0];
                let per_sample = reshape(r, &[n, numel(&r.shape()[1..])])?;
                let mean = per_sample
                    .mean_axis(Axis(0))
                    .ok_or_else(|| BackpropError::shape("empty batch"))?;
                for (i, value) in mean.iter().enumerate() {
                    next[[i, i]] += value;
                }
            }
            self.curvature.batch_hessian = Some(next);
        }
        Ok(())
    }
}

/// Replace per-sample factors by one shared factor whose outer product is the
/// batch-averaged loss Hessian: every sample carries all `V · N` columns scaled by
/// `1/√N`.
fn shared_average_factor(exact: &Tensor) -> Result<Tensor> {
    let (v, n) = (exact.shape()[0], exact.shape()[1]);
    let features = &exact.shape()[2..];
    let d = numel(features);
    let columns = reshape(exact, &[v * n, d])?;
    let scale = 1.0 / (n as f64).sqrt();
    let mut shared = Tensor::zeros(IxDyn(&[v * n, n, d]));
    for col in 0..v * n {
        for sample in 0..n {
            for k in 0..d {
                shared[[col, sample, k]] = scale * columns[[col, k]];
            }
        }
    }
    reshape(&shared, &with_leading(&[v * n, n], features))
}

/// Split a residual `r` `[N, *in]` into positive and negative diagonal factors.
///
/// `diag(r) = diag(r⁺) - diag(r⁻)`, each written as `Σ_d √r± e_d e_dᵀ`. Parts that
/// vanish everywhere are dropped.
fn residual_factors(residual: &Tensor) -> Result<Vec<SignedFactor>> {
    let n = residual.shape()[0];
    let features = &residual.shape()[1..];
    let d = numel(features);
    let flat = reshape(residual, &[n, d])?;
    let mut factors = Vec::new();
    for negative in [false, true] {
        let part = flat.mapv(|x| if negative { (-x).max(0.0) } else { x.max(0.0) });
        if part.iter().all(|&x| x == 0.0) {
            continue;
        }
        let mut factor = Tensor::zeros(IxDyn(&[d, n, d]));
        for k in 0..d {
            for sample in 0..n {
                factor[[k, sample, k]] = part[[sample, k]].sqrt();
            }
        }
        let factor = reshape(&factor, &with_leading(&[d, n], features))?;
        factors.push(if negative {
            SignedFactor::negative(factor)
        } else {
            SignedFactor::positive(factor)
        });
    }
    Ok(factors)
}
