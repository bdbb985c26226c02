//! Small tensor helpers shared by layers, losses and the engine
//!
//! Tensors are dynamic-rank `f64` arrays. Batched quantities put the batch axis first
//! (`[N, *features]`); stacked matrices of vectors put the vector axis first
//! (`[V, N, *features]`).

use crate::error::{BackpropError, Result};
use ndarray::{Array, Array2, ArrayD, Axis, IxDyn, Slice};
use std::ops::Range;

/// Dynamic-rank `f64` tensor.
pub type Tensor = ArrayD<f64>;

/// Number of elements described by `shape`.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Copy `tensor` into a new shape with the same number of elements (row-major order).
pub fn reshape(tensor: &Tensor, shape: &[usize]) -> Result<Tensor> {
    if numel(shape) != tensor.len() {
        return Err(BackpropError::shape(format!(
            "cannot reshape {:?} into {:?}",
            tensor.shape(),
            shape
        )));
    }
    Array::from_shape_vec(IxDyn(shape), tensor.iter().copied().collect())
        .map_err(|e| BackpropError::shape(e.to_string()))
}

/// View the tensor as a `[rows, numel / rows]` matrix.
pub fn as_matrix(tensor: &Tensor, rows: usize) -> Result<Array2<f64>> {
    if rows == 0 || tensor.len() % rows != 0 {
        return Err(BackpropError::shape(format!(
            "cannot view {:?} as a matrix with {} rows",
            tensor.shape(),
            rows
        )));
    }
    let cols = tensor.len() / rows;
    Array2::from_shape_vec((rows, cols), tensor.iter().copied().collect())
        .map_err(|e| BackpropError::shape(e.to_string()))
}

/// Prepend shape dimensions: `[lead..., *shape]`.
pub fn with_leading(lead: &[usize], shape: &[usize]) -> Vec<usize> {
    lead.iter().chain(shape.iter()).copied().collect()
}

/// Check that `tensor` has exactly `expected` shape.
pub fn check_shape(tensor: &Tensor, expected: &[usize], what: &str) -> Result<()> {
    if tensor.shape() != expected {
        return Err(BackpropError::shape(format!(
            "{}: expected shape {:?}, got {:?}",
            what,
            expected,
            tensor.shape()
        )));
    }
    Ok(())
}

/// Check that `mat` is a stack of tensors with trailing shape `trailing`: `[V, *trailing]`.
/// Returns `V`.
pub fn check_stacked(mat: &Tensor, trailing: &[usize], what: &str) -> Result<usize> {
    if mat.ndim() != trailing.len() + 1 || &mat.shape()[1..] != trailing {
        return Err(BackpropError::shape(format!(
            "{}: expected shape [V, {:?}], got {:?}",
            what,
            trailing,
            mat.shape()
        )));
    }
    Ok(mat.shape()[0])
}

/// Owned slice `range` of `tensor` along `axis`.
pub fn slice_axis(tensor: &Tensor, axis: usize, range: Range<usize>) -> Tensor {
    tensor
        .slice_axis(Axis(axis), Slice::from(range))
        .to_owned()
}

/// Concatenate tensors along `axis`.
pub fn concat(axis: usize, parts: &[Tensor]) -> Result<Tensor> {
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    ndarray::concatenate(Axis(axis), &views).map_err(|e| BackpropError::shape(e.to_string()))
}

/// Broadcast a batched tensor `[N, *f]` against a stacked one `[V, N, *f]` and multiply.
pub fn mul_broadcast(mat: &Tensor, per_sample: &Tensor) -> Result<Tensor> {
    let view = per_sample.broadcast(mat.raw_dim()).ok_or_else(|| {
        BackpropError::shape(format!(
            "cannot broadcast {:?} to {:?}",
            per_sample.shape(),
            mat.shape()
        ))
    })?;
    Ok(mat * &view)
}

/// Repeat `tensor` `[*s]` along a new leading batch axis: `[n, *s]`.
pub fn repeat_leading(tensor: &Tensor, n: usize) -> Result<Tensor> {
    let shape = with_leading(&[n], tensor.shape());
    let view = tensor
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| BackpropError::shape("broadcast failed"))?;
    Ok(view.to_owned())
}

/// Stack `n` identity rows into a `[d, n, d]` tensor: `out[v, n, d] = δ(v, d)`.
pub fn identity_stack(d: usize, n: usize) -> Tensor {
    let mut out = Tensor::zeros(IxDyn(&[d, n, d]));
    for v in 0..d {
        for sample in 0..n {
            out[[v, sample, v]] = 1.0;
        }
    }
    out
}

/// Maximum absolute elementwise difference; infinite on shape mismatch.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
    if a.shape() != b.shape() {
        return f64::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .fold(0.0f64, |acc, (x, y)| acc.max((x - y).abs()))
}
