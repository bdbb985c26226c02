//! Curvature representations
//!
//! Curvature is handled in one of three shapes:
//!
//! - a dense symmetric matrix,
//! - a sign-annotated square-root factor, `H = Σᵢ σᵢ SᵢᵀSᵢ` with `σᵢ ∈ {+1, -1}`,
//! - an implicit operator `H = scale · Σᵢ Jᵢᵀ M Jᵢ` that only exposes products.
//!
//! Negative signs come from the residual terms of nonlinear layers; loss-level
//! factors are always positive.

use crate::error::{BackpropError, Result};
use crate::utils::tensor::{as_matrix, numel, Tensor};
use ndarray::{Array1, Array2, Axis};
use std::ops::Neg;

/// Sign of a curvature factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Positive,
    Negative,
}

impl Sign {
    pub fn value(self) -> f64 {
        match self {
            Sign::Positive => 1.0,
            Sign::Negative => -1.0,
        }
    }
}

impl Neg for Sign {
    type Output = Sign;

    fn neg(self) -> Sign {
        match self {
            Sign::Positive => Sign::Negative,
            Sign::Negative => Sign::Positive,
        }
    }
}

/// An in-flight factor `[V, N, *features]` with its sign.
///
/// Represents the per-sample curvature `Hₙ = σ Σ_v s[v, n] s[v, n]ᵀ`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedFactor {
    pub factor: Tensor,
    pub sign: Sign,
}

impl SignedFactor {
    pub fn new(factor: Tensor, sign: Sign) -> Self {
        Self { factor, sign }
    }

    pub fn positive(factor: Tensor) -> Self {
        Self::new(factor, Sign::Positive)
    }

    pub fn negative(factor: Tensor) -> Self {
        Self::new(factor, Sign::Negative)
    }

    /// Number of stacked vectors `V`.
    pub fn num_vectors(&self) -> usize {
        self.factor.shape()[0]
    }

    pub fn batch_size(&self) -> usize {
        self.factor.shape()[1]
    }

    /// Flattened feature size.
    pub fn feature_dim(&self) -> usize {
        numel(&self.factor.shape()[2..])
    }

    /// `σ Sₙ Sₙᵀ` for every sample, each `[D, D]`.
    pub fn reconstruct_per_sample(&self) -> Result<Vec<Array2<f64>>> {
        let (v, n, d) = (self.num_vectors(), self.batch_size(), self.feature_dim());
        let rows = as_matrix(&self.factor, v * n)?;
        Ok((0..n)
            .map(|sample| {
                let mut block = Array2::zeros((d, d));
                for k in 0..v {
                    let s = rows.row(k * n + sample);
                    for i in 0..d {
                        for j in 0..d {
                            block[[i, j]] += s[i] * s[j];
                        }
                    }
                }
                block * self.sign.value()
            })
            .collect())
    }

    /// `Σₙ σ Sₙ Sₙᵀ`, `[D, D]`.
    pub fn reconstruct_sum(&self) -> Result<Array2<f64>> {
        let d = self.feature_dim();
        Ok(self
            .reconstruct_per_sample()?
            .into_iter()
            .fold(Array2::zeros((d, d)), |acc, h| acc + h))
    }
}

/// One block of rows of a parameter square-root factor.
#[derive(Debug, Clone, PartialEq)]
pub struct SqrtBlock {
    /// `[R, P]`
    pub rows: Array2<f64>,
    pub sign: Sign,
}

/// Parameter curvature `Σ_blocks σ rowsᵀ rows`, `[P, P]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SqrtFactor {
    dim: usize,
    blocks: Vec<SqrtBlock>,
}

impl SqrtFactor {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            blocks: Vec::new(),
        }
    }

    pub fn push(&mut self, rows: Array2<f64>, sign: Sign) -> Result<()> {
        if rows.ncols() != self.dim {
            return Err(BackpropError::shape(format!(
                "factor rows have {} columns, expected {}",
                rows.ncols(),
                self.dim
            )));
        }
        self.blocks.push(SqrtBlock { rows, sign });
        Ok(())
    }

    pub fn blocks(&self) -> &[SqrtBlock] {
        &self.blocks
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn to_dense(&self) -> Array2<f64> {
        self.blocks
            .iter()
            .fold(Array2::zeros((self.dim, self.dim)), |acc, b| {
                acc + b.rows.t().dot(&b.rows) * b.sign.value()
            })
    }

    pub fn matvec(&self, v: &Array1<f64>) -> Array1<f64> {
        self.blocks
            .iter()
            .fold(Array1::zeros(self.dim), |acc, b| {
                acc + b.rows.t().dot(&b.rows.dot(v)) * b.sign.value()
            })
    }

    pub fn diagonal(&self) -> Array1<f64> {
        self.blocks.iter().fold(Array1::zeros(self.dim), |acc, b| {
            acc + b.rows.mapv(|x| x * x).sum_axis(Axis(0)) * b.sign.value()
        })
    }
}

/// Implicit `scale · Σᵢ Jᵢᵀ M Jᵢ` with `Jᵢ: [D_out, P]` and `M: [D_out, D_out]`.
#[derive(Debug, Clone, PartialEq)]
pub struct HvpOperator {
    jacobians: Vec<Array2<f64>>,
    inner: Array2<f64>,
    scale: f64,
}

impl HvpOperator {
    pub fn new(jacobians: Vec<Array2<f64>>, inner: Array2<f64>, scale: f64) -> Result<Self> {
        let d_out = inner.nrows();
        if inner.ncols() != d_out {
            return Err(BackpropError::shape("inner curvature must be square"));
        }
        let p = jacobians.first().map(|j| j.ncols()).unwrap_or(0);
        if jacobians.iter().any(|j| j.dim() != (d_out, p)) {
            return Err(BackpropError::shape(format!(
                "jacobians must all be [{}, {}]",
                d_out, p
            )));
        }
        Ok(Self {
            jacobians,
            inner,
            scale,
        })
    }

    pub fn dim(&self) -> usize {
        self.jacobians.first().map(|j| j.ncols()).unwrap_or(0)
    }

    pub fn matvec(&self, v: &Array1<f64>) -> Array1<f64> {
        self.jacobians.iter().fold(Array1::zeros(self.dim()), |acc, j| {
            acc + j.t().dot(&self.inner.dot(&j.dot(v))) * self.scale
        })
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let p = self.dim();
        self.jacobians
            .iter()
            .fold(Array2::zeros((p, p)), |acc, j| {
                acc + j.t().dot(&self.inner.dot(j)) * self.scale
            })
    }
}

/// Curvature block of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Curvature {
    Dense(Array2<f64>),
    Sqrt(SqrtFactor),
    Operator(HvpOperator),
}

impl Curvature {
    pub fn dim(&self) -> usize {
        match self {
            Curvature::Dense(m) => m.nrows(),
            Curvature::Sqrt(f) => f.dim(),
            Curvature::Operator(op) => op.dim(),
        }
    }

    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            Curvature::Dense(m) => m.clone(),
            Curvature::Sqrt(f) => f.to_dense(),
            Curvature::Operator(op) => op.to_dense(),
        }
    }

    /// `H · v` for a flattened parameter-shaped vector.
    pub fn matvec(&self, v: &Array1<f64>) -> Result<Array1<f64>> {
        if v.len() != self.dim() {
            return Err(BackpropError::shape(format!(
                "vector of length {} for curvature of dimension {}",
                v.len(),
                self.dim()
            )));
        }
        Ok(match self {
            Curvature::Dense(m) => m.dot(v),
            Curvature::Sqrt(f) => f.matvec(v),
            Curvature::Operator(op) => op.matvec(v),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, IxDyn};

    #[test]
    fn test_signed_factor_reconstruction() {
        // V = 2, N = 1, D = 2
        let factor =
            Tensor::from_shape_vec(IxDyn(&[2, 1, 2]), vec![1.0, 2.0, 0.0, 3.0]).unwrap();
        let h = SignedFactor::negative(factor).reconstruct_sum().unwrap();
        assert_eq!(h, array![[-1.0, -2.0], [-2.0, -13.0]]);
    }

    #[test]
    fn test_sqrt_factor_matches_dense() {
        let mut f = SqrtFactor::new(2);
        f.push(array![[1.0, 2.0]], Sign::Positive).unwrap();
        f.push(array![[0.5, 0.0]], Sign::Negative).unwrap();
        let v = array![1.0, -1.0];
        let dense = f.to_dense();
        assert_eq!(dense, array![[0.75, 2.0], [2.0, 4.0]]);
        assert_eq!(f.matvec(&v), dense.dot(&v));
        assert_eq!(f.diagonal(), array![0.75, 4.0]);
        assert!(f.push(array![[1.0, 2.0, 3.0]], Sign::Positive).is_err());
    }

    #[test]
    fn test_operator_matches_dense() {
        let j = array![[1.0, 0.0, 2.0], [0.0, 1.0, -1.0]];
        let m = array![[2.0, 0.5], [0.5, 1.0]];
        let op = HvpOperator::new(vec![j.clone(), j.clone()], m.clone(), 0.5).unwrap();
        let dense = j.t().dot(&m.dot(&j));
        let v = array![0.3, -0.2, 1.0];
        let hv = Curvature::Operator(op).matvec(&v).unwrap();
        for (a, b) in hv.iter().zip(dense.dot(&v).iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
