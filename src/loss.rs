//! Loss functions and their curvature
//!
//! Both losses act on a batch of logits/predictions `[N, D]`. Besides value and
//! gradient they provide the per-sample loss Hessian in three forms: summed over the
//! batch as a dense `[D, D]` matrix, as an exact symmetric factor `S` with
//! `Hₙ = Sₙ Sₙᵀ`, and as a Monte-Carlo factor whose outer product equals `Hₙ` in
//! expectation. Factors use the stacked layout `[V, N, D]`.

use crate::error::{BackpropError, Result};
use crate::utils::activations::softmax;
use crate::utils::tensor::Tensor;
use ndarray::{Array2, Axis, Ix2, IxDyn};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How per-sample losses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
    /// Per-sample losses; no scalar, so no Hessian.
    None,
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Mean => write!(f, "mean"),
            Reduction::Sum => write!(f, "sum"),
            Reduction::None => write!(f, "none"),
        }
    }
}

/// Regression targets `[N, D]` or class indices `[N]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Regression(Tensor),
    Classes(Vec<usize>),
}

/// Curvature contract of a loss module evaluated at `(input, target)`.
pub trait LossDerivatives {
    fn reduction(&self) -> Reduction;

    /// Scalar loss. With [`Reduction::None`] the per-sample losses are summed, which is
    /// what a backward pass with unit output gradients differentiates.
    fn value(&self, input: &Tensor, target: &Target) -> Result<f64>;

    /// Gradient of the scalar loss with respect to the input, `[N, D]`.
    fn gradient(&self, input: &Tensor, target: &Target) -> Result<Tensor>;

    /// `Σₙ ∂²ℓ/∂xₙ²`, `[D, D]`.
    fn sum_hessian(&self, input: &Tensor, target: &Target) -> Result<Array2<f64>>;

    /// Exact factor `[D, N, D]` with `Σ_v S[v, n] S[v, n]ᵀ = Hₙ`.
    fn sqrt_hessian(&self, input: &Tensor, target: &Target) -> Result<Tensor>;

    /// Monte-Carlo factor `[M, N, D]` with `E[Σ_m S[m, n] S[m, n]ᵀ] = Hₙ`.
    fn sqrt_hessian_sampled(
        &self,
        input: &Tensor,
        target: &Target,
        mc_samples: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor>;
}

/// Check the input is a finite `[N, D]` batch and a Hessian exists for `reduction`.
fn hessian_input(input: &Tensor, reduction: Reduction, loss: &str) -> Result<Array2<f64>> {
    if reduction == Reduction::None {
        return Err(BackpropError::HessianUndefined(format!(
            "{} with reduction 'none' is not a scalar",
            loss
        )));
    }
    let x = batch_input(input, loss)?;
    if x.iter().any(|v| !v.is_finite()) {
        return Err(BackpropError::HessianUndefined(format!(
            "{} input contains non-finite values",
            loss
        )));
    }
    Ok(x)
}

fn batch_input(input: &Tensor, loss: &str) -> Result<Array2<f64>> {
    input
        .clone()
        .into_dimensionality::<Ix2>()
        .map_err(|_| {
            BackpropError::shape(format!(
                "{} expects input [N, D], got {:?}",
                loss,
                input.shape()
            ))
        })
}

fn check_mc_samples(mc_samples: usize) -> Result<()> {
    if mc_samples == 0 {
        return Err(BackpropError::config("mc_samples must be at least 1"));
    }
    Ok(())
}

/// Squared error `Σ (x - t)²`, optionally averaged over all `N · D` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MseLoss {
    pub reduction: Reduction,
}

impl MseLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    fn scale(&self, n: usize, d: usize) -> f64 {
        match self.reduction {
            Reduction::Mean => 1.0 / (n * d) as f64,
            _ => 1.0,
        }
    }

    fn residual(&self, input: &Tensor, target: &Target) -> Result<Array2<f64>> {
        let x = batch_input(input, "mse")?;
        let t = match target {
            Target::Regression(t) if t.shape() == input.shape() => t
                .clone()
                .into_dimensionality::<Ix2>()
                .map_err(|e| BackpropError::shape(e.to_string()))?,
            Target::Regression(t) => {
                return Err(BackpropError::shape(format!(
                    "mse target {:?} does not match input {:?}",
                    t.shape(),
                    input.shape()
                )))
            }
            Target::Classes(_) => {
                return Err(BackpropError::shape("mse expects a regression target"))
            }
        };
        Ok(x - t)
    }
}

impl LossDerivatives for MseLoss {
    fn reduction(&self) -> Reduction {
        self.reduction
    }

    fn value(&self, input: &Tensor, target: &Target) -> Result<f64> {
        let r = self.residual(input, target)?;
        let (n, d) = r.dim();
        Ok(self.scale(n, d) * r.mapv(|v| v * v).sum())
    }

    fn gradient(&self, input: &Tensor, target: &Target) -> Result<Tensor> {
        let r = self.residual(input, target)?;
        let (n, d) = r.dim();
        Ok((r * (2.0 * self.scale(n, d))).into_dyn())
    }

    fn sum_hessian(&self, input: &Tensor, _target: &Target) -> Result<Array2<f64>> {
        let (n, d) = hessian_input(input, self.reduction, "mse")?.dim();
        Ok(Array2::eye(d) * (2.0 * self.scale(n, d) * n as f64))
    }

    fn sqrt_hessian(&self, input: &Tensor, _target: &Target) -> Result<Tensor> {
        let (n, d) = hessian_input(input, self.reduction, "mse")?.dim();
        let value = (2.0 * self.scale(n, d)).sqrt();
        let mut factor = Tensor::zeros(IxDyn(&[d, n, d]));
        for v in 0..d {
            for sample in 0..n {
                factor[[v, sample, v]] = value;
            }
        }
        Ok(factor)
    }

    fn sqrt_hessian_sampled(
        &self,
        input: &Tensor,
        _target: &Target,
        mc_samples: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        check_mc_samples(mc_samples)?;
        let (n, d) = hessian_input(input, self.reduction, "mse")?.dim();
        let value = (2.0 * self.scale(n, d) / mc_samples as f64).sqrt();
        Ok(Tensor::from_shape_fn(IxDyn(&[mc_samples, n, d]), |_| {
            let eps: f64 = rng.sample(StandardNormal);
            value * eps
        }))
    }
}

/// Softmax cross-entropy on logits with integer class targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrossEntropyLoss {
    pub reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    fn scale(&self, n: usize) -> f64 {
        match self.reduction {
            Reduction::Mean => 1.0 / n as f64,
            _ => 1.0,
        }
    }

    fn probabilities(x: &Array2<f64>) -> Array2<f64> {
        let mut p = Array2::zeros(x.dim());
        for (sample, row) in x.axis_iter(Axis(0)).enumerate() {
            let logits: Vec<f64> = row.iter().copied().collect();
            for (c, value) in softmax(&logits).into_iter().enumerate() {
                p[[sample, c]] = value;
            }
        }
        p
    }

    fn classes<'t>(&self, n: usize, d: usize, target: &'t Target) -> Result<&'t [usize]> {
        match target {
            Target::Classes(classes) if classes.len() != n => Err(BackpropError::shape(format!(
                "cross-entropy got {} targets for {} samples",
                classes.len(),
                n
            ))),
            Target::Classes(classes) => match classes.iter().find(|&&c| c >= d) {
                Some(c) => Err(BackpropError::shape(format!(
                    "class index {} out of range for {} classes",
                    c, d
                ))),
                None => Ok(classes),
            },
            Target::Regression(_) => Err(BackpropError::shape(
                "cross-entropy expects class index targets",
            )),
        }
    }
}

impl LossDerivatives for CrossEntropyLoss {
    fn reduction(&self) -> Reduction {
        self.reduction
    }

    fn value(&self, input: &Tensor, target: &Target) -> Result<f64> {
        let x = batch_input(input, "cross-entropy")?;
        let (n, d) = x.dim();
        let classes = self.classes(n, d, target)?;
        let p = Self::probabilities(&x);
        let total: f64 = classes
            .iter()
            .enumerate()
            .map(|(sample, &c)| -p[[sample, c]].ln())
            .sum();
        Ok(self.scale(n) * total)
    }

    fn gradient(&self, input: &Tensor, target: &Target) -> Result<Tensor> {
        let x = batch_input(input, "cross-entropy")?;
        let (n, d) = x.dim();
        let classes = self.classes(n, d, target)?;
        let mut grad = Self::probabilities(&x);
        for (sample, &c) in classes.iter().enumerate() {
            grad[[sample, c]] -= 1.0;
        }
        Ok((grad * self.scale(n)).into_dyn())
    }

    fn sum_hessian(&self, input: &Tensor, _target: &Target) -> Result<Array2<f64>> {
        let x = hessian_input(input, self.reduction, "cross-entropy")?;
        let (n, d) = x.dim();
        let p = Self::probabilities(&x);
        let mut hessian = Array2::zeros((d, d));
        for row in p.axis_iter(Axis(0)) {
            for c in 0..d {
                hessian[[c, c]] += row[c];
                for k in 0..d {
                    hessian[[c, k]] -= row[c] * row[k];
                }
            }
        }
        Ok(hessian * self.scale(n))
    }

    /// Column `v` of `Sₙ` is `√scale (e_v - pₙ) √pₙ[v]`.
    fn sqrt_hessian(&self, input: &Tensor, _target: &Target) -> Result<Tensor> {
        let x = hessian_input(input, self.reduction, "cross-entropy")?;
        let (n, d) = x.dim();
        let p = Self::probabilities(&x);
        let root = self.scale(n).sqrt();
        Ok(Tensor::from_shape_fn(IxDyn(&[d, n, d]), |idx| {
            let (v, sample, c) = (idx[0], idx[1], idx[2]);
            let delta = if c == v { 1.0 } else { 0.0 };
            root * (delta - p[[sample, c]]) * p[[sample, v]].sqrt()
        }))
    }

    /// Each sample draws `y ~ Cat(pₙ)` and contributes `√scale (pₙ - e_y) / √M`.
    fn sqrt_hessian_sampled(
        &self,
        input: &Tensor,
        _target: &Target,
        mc_samples: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        check_mc_samples(mc_samples)?;
        let x = hessian_input(input, self.reduction, "cross-entropy")?;
        let (n, d) = x.dim();
        let p = Self::probabilities(&x);
        let root = (self.scale(n) / mc_samples as f64).sqrt();
        let classes = p
            .rows()
            .into_iter()
            .map(|row| {
                WeightedIndex::new(row.iter().copied()).map_err(|e| {
                    BackpropError::HessianUndefined(format!("class probabilities: {}", e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut factor = Tensor::zeros(IxDyn(&[mc_samples, n, d]));
        for m in 0..mc_samples {
            for (sample, distribution) in classes.iter().enumerate() {
                let y = distribution.sample(rng);
                for c in 0..d {
                    let onehot = if c == y { 1.0 } else { 0.0 };
                    factor[[m, sample, c]] = root * (p[[sample, c]] - onehot);
                }
            }
        }
        Ok(factor)
    }
}

/// The loss module closing a [`crate::model::Sequential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loss {
    Mse(MseLoss),
    CrossEntropy(CrossEntropyLoss),
}

impl Loss {
    pub fn mse(reduction: Reduction) -> Self {
        Loss::Mse(MseLoss::new(reduction))
    }

    pub fn cross_entropy(reduction: Reduction) -> Self {
        Loss::CrossEntropy(CrossEntropyLoss::new(reduction))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Loss::Mse(_) => "mse",
            Loss::CrossEntropy(_) => "cross_entropy",
        }
    }

    pub fn derivatives(&self) -> &dyn LossDerivatives {
        match self {
            Loss::Mse(l) => l,
            Loss::CrossEntropy(l) => l,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits() -> Tensor {
        Tensor::from_shape_vec(IxDyn(&[2, 3]), vec![0.5, -1.0, 2.0, 0.0, 0.3, -0.2]).unwrap()
    }

    #[test]
    fn test_none_reduction_has_no_hessian() {
        let loss = CrossEntropyLoss::new(Reduction::None);
        let target = Target::Classes(vec![0, 2]);
        assert!(matches!(
            loss.sum_hessian(&logits(), &target),
            Err(BackpropError::HessianUndefined(_))
        ));
        assert!(matches!(
            loss.sqrt_hessian(&logits(), &target),
            Err(BackpropError::HessianUndefined(_))
        ));
    }

    #[test]
    fn test_non_finite_input_has_no_hessian() {
        let loss = MseLoss::new(Reduction::Sum);
        let mut input = logits();
        input[[1, 1]] = f64::NAN;
        let target = Target::Regression(Tensor::zeros(IxDyn(&[2, 3])));
        assert!(matches!(
            loss.sqrt_hessian(&input, &target),
            Err(BackpropError::HessianUndefined(_))
        ));
    }

    #[test]
    fn test_cross_entropy_gradient_rows_sum_to_zero() {
        let loss = CrossEntropyLoss::new(Reduction::Mean);
        let grad = loss
            .gradient(&logits(), &Target::Classes(vec![2, 0]))
            .unwrap();
        for row in grad.axis_iter(Axis(0)) {
            assert!(row.sum().abs() < 1e-12);
        }
    }
}
