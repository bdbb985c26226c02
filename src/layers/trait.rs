//! Derivative contract for supported layer kinds
//!
//! Every layer `y = f(x; θ)` exposes products of its Jacobians with stacks of vectors,
//! evaluated at the `(x, y)` of the current forward pass.
//!
//! # Shape conventions
//!
//! A "matrix" is a stack of `V` tensors along a new leading axis:
//!
//! - input side: `[V, N, *in]`
//! - output side: `[V, N, *out]`
//! - parameter side: `[V, *param]`
//!
//! Transposed parameter products return `[V, *param]` when `sum_batch` is true and
//! `[V, N, *param]` otherwise.

use crate::error::{BackpropError, Result};
use crate::layers::ParamKind;
use crate::strategies::ExpectationApproximation;
use crate::utils::tensor::{numel, reshape, with_leading, Tensor};
use ndarray::{Array2, Array3, Axis, IxDyn};

/// Input-output derivatives of a layer.
pub trait Derivatives {
    /// `J · V`: `[V, N, *in]` → `[V, N, *out]`.
    fn jac_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor) -> Result<Tensor>;

    /// `Jᵀ · V`: `[V, N, *out]` → `[V, N, *in]`.
    fn jac_t_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor) -> Result<Tensor>;

    /// True iff the Jacobian does not depend on the input, for every input.
    ///
    /// A static declaration per layer kind. Second-order propagation through such a
    /// layer is a pure sandwich `Jᵀ H J` with no residual term.
    fn hessian_is_zero(&self) -> bool;

    /// Input-specific version of [`Derivatives::hessian_is_zero`].
    ///
    /// Used only to warn when the static declaration is questionable for `input`.
    fn hessian_is_zero_at(&self, _input: &Tensor) -> bool {
        self.hessian_is_zero()
    }

    /// Elementwise second derivative `f''(x)`, shape `[N, *in]`.
    ///
    /// Only elementwise layers with non-zero Hessian provide it.
    fn hessian_diagonal(&self, _input: &Tensor, _output: &Tensor) -> Result<Tensor> {
        Err(BackpropError::shape(
            "layer does not provide an elementwise Hessian diagonal",
        ))
    }

    /// Batch-averaged curvature propagation: `M [D_out, D_out]` → `[D_in, D_in]`.
    ///
    /// Computes `1/N Σₙ Jₙᵀ M Jₙ` for [`ExpectationApproximation::BotevMartens`], and
    /// `J̄ᵀ M J̄` with `J̄ = 1/N Σₙ Jₙ` for [`ExpectationApproximation::Chen`].
    /// Built from two transposed-Jacobian products, so every layer kind gets it.
    fn ea_jac_t_mat_jac_prod(
        &self,
        input: &Tensor,
        output: &Tensor,
        mat: &Array2<f64>,
        approximation: ExpectationApproximation,
    ) -> Result<Array2<f64>> {
        let n = input.shape()[0];
        let in_shape = &input.shape()[1..];
        let out_shape = &output.shape()[1..];
        let (d_in, d_out) = (numel(in_shape), numel(out_shape));
        if mat.dim() != (d_out, d_out) {
            return Err(BackpropError::shape(format!(
                "expected a [{}, {}] curvature matrix, got {:?}",
                d_out,
                d_out,
                mat.dim()
            )));
        }
        let average = approximation.should_average_param_jac();

        // stage one: columns of Jₙᵀ M
        let mut first = Array3::<f64>::zeros((d_out, n, d_out));
        for v in 0..d_out {
            for sample in 0..n {
                first
                    .index_axis_mut(Axis(0), v)
                    .index_axis_mut(Axis(0), sample)
                    .assign(&mat.column(v));
            }
        }
        let first = reshape(&first.into_dyn(), &with_leading(&[d_out, n], out_shape))?;
        let r1 = reshape(
            &self.jac_t_mat_prod(input, output, &first)?,
            &[d_out, n, d_in],
        )?;

        // stage two: Jₙᵀ (Jₙᵀ M)ᵀ, or the batch-averaged counterpart
        let mut second = Array3::<f64>::zeros((d_in, n, d_out));
        for sample in 0..n {
            for u in 0..d_in {
                for v in 0..d_out {
                    second[[u, sample, v]] = if average {
                        (0..n).map(|m| r1[[v, m, u]]).sum::<f64>() / n as f64
                    } else {
                        r1[[v, sample, u]]
                    };
                }
            }
        }
        let second = reshape(&second.into_dyn(), &with_leading(&[d_in, n], out_shape))?;
        let r2 = reshape(
            &self.jac_t_mat_prod(input, output, &second)?,
            &[d_in, n, d_in],
        )?;

        let mut result = Array2::zeros((d_in, d_in));
        for w in 0..d_in {
            for u in 0..d_in {
                result[[w, u]] = (0..n).map(|sample| r2[[u, sample, w]]).sum::<f64>() / n as f64;
            }
        }
        Ok(result)
    }
}

/// Derivatives with respect to a layer's own weight and (optional) bias.
pub trait ParameterDerivatives: Derivatives {
    fn weight_shape(&self) -> Vec<usize>;

    /// `None` when the layer has no bias.
    fn bias_shape(&self) -> Option<Vec<usize>>;

    /// `J_W · V`: `[V, *weight]` → `[V, N, *out]`.
    fn weight_jac_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor)
        -> Result<Tensor>;

    /// `J_Wᵀ · V`: `[V, N, *out]` → `[V, (N,) *weight]`.
    fn weight_jac_t_mat_prod(
        &self,
        input: &Tensor,
        output: &Tensor,
        mat: &Tensor,
        sum_batch: bool,
    ) -> Result<Tensor>;

    /// `J_b · V`: `[V, *bias]` → `[V, N, *out]`.
    fn bias_jac_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor) -> Result<Tensor>;

    /// `J_bᵀ · V`: `[V, N, *out]` → `[V, (N,) *bias]`.
    fn bias_jac_t_mat_prod(
        &self,
        input: &Tensor,
        output: &Tensor,
        mat: &Tensor,
        sum_batch: bool,
    ) -> Result<Tensor>;

    /// Shape of the parameter `kind`, if the layer owns it.
    fn param_shape(&self, kind: ParamKind) -> Option<Vec<usize>> {
        match kind {
            ParamKind::Weight => Some(self.weight_shape()),
            ParamKind::Bias => self.bias_shape(),
        }
    }

    /// Dispatch to the transposed weight or bias product.
    fn param_jac_t_mat_prod(
        &self,
        kind: ParamKind,
        input: &Tensor,
        output: &Tensor,
        mat: &Tensor,
        sum_batch: bool,
    ) -> Result<Tensor> {
        match kind {
            ParamKind::Weight => self.weight_jac_t_mat_prod(input, output, mat, sum_batch),
            ParamKind::Bias => self.bias_jac_t_mat_prod(input, output, mat, sum_batch),
        }
    }

    /// Dispatch to the weight or bias product.
    fn param_jac_mat_prod(
        &self,
        kind: ParamKind,
        input: &Tensor,
        output: &Tensor,
        mat: &Tensor,
    ) -> Result<Tensor> {
        match kind {
            ParamKind::Weight => self.weight_jac_mat_prod(input, output, mat),
            ParamKind::Bias => self.bias_jac_mat_prod(input, output, mat),
        }
    }

    /// Per-sample parameter Jacobians as matrices `[D_out, P]`, one per example.
    fn param_jacobians(
        &self,
        kind: ParamKind,
        input: &Tensor,
        output: &Tensor,
    ) -> Result<Vec<Array2<f64>>> {
        let n = output.shape()[0];
        let out_shape = &output.shape()[1..];
        let d_out = numel(out_shape);
        let shape = self
            .param_shape(kind)
            .ok_or_else(|| BackpropError::shape(format!("layer has no {}", kind)))?;
        let p = numel(&shape);

        let eye = crate::utils::tensor::identity_stack(d_out, n);
        let eye = reshape(&eye, &with_leading(&[d_out, n], out_shape))?;
        let projected = self.param_jac_t_mat_prod(kind, input, output, &eye, false)?;
        let projected = reshape(&projected, &[d_out, n, p])?
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| BackpropError::shape(e.to_string()))?;
        Ok((0..n)
            .map(|sample| projected.index_axis(Axis(1), sample).to_owned())
            .collect())
    }
}

/// Zero tensor with shape `[lead..., *shape]`.
pub(crate) fn zeros_with(lead: &[usize], shape: &[usize]) -> Tensor {
    Tensor::zeros(IxDyn(&with_leading(lead, shape)))
}
