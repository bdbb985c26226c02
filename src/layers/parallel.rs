//! Parallel composite of sibling layers sharing one input
//!
//! Siblings of identical structure consume the same input; their outputs are
//! concatenated along the feature axis (axis 1). A block-diagonal curvature falls out
//! naturally: each sibling's parameters only see their own slice of the output.
//!
//! The partition into siblings can be restructured without changing the function the
//! composite computes: [`Parallel::merge`] repacks the features into at most `k`
//! near-equal blocks and [`Parallel::split`] cuts them at explicit sizes.

use crate::error::{BackpropError, Result};
use crate::layers::r#trait::{Derivatives, ParameterDerivatives};
use crate::layers::Parameterized;
use crate::utils::tensor::{concat, numel, slice_axis, Tensor};
use std::ops::Range;

/// A layer that can be cut into output-feature blocks and glued back together.
pub trait Splittable: ParameterDerivatives + Parameterized + Clone + Sized {
    /// Size of axis 1 of the output.
    fn out_features(&self) -> usize;

    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Cut into consecutive blocks of the given output-feature counts.
    ///
    /// Callers guarantee the sizes sum to [`Splittable::out_features`].
    fn split_out(&self, sizes: &[usize]) -> Result<Vec<Self>>;

    /// Concatenate blocks along the output-feature axis.
    fn concat_out(parts: &[Self]) -> Result<Self>;
}

/// Siblings consuming the same input, outputs concatenated along axis 1.
#[derive(Debug, Clone)]
pub struct Parallel<L: Splittable> {
    siblings: Vec<L>,
}

impl<L: Splittable> Parallel<L> {
    pub fn new(siblings: Vec<L>) -> Result<Self> {
        if siblings.is_empty() {
            return Err(BackpropError::SizeMismatch(
                "parallel composite needs at least one sibling".to_string(),
            ));
        }
        // structural compatibility is checked by gluing once
        L::concat_out(&siblings)?;
        Ok(Self { siblings })
    }

    /// Wrap a single layer as a one-sibling composite.
    pub fn from_layer(layer: L) -> Self {
        Self {
            siblings: vec![layer],
        }
    }

    pub fn siblings(&self) -> &[L] {
        &self.siblings
    }

    pub fn siblings_mut(&mut self) -> &mut [L] {
        &mut self.siblings
    }

    pub fn total_out_features(&self) -> usize {
        self.siblings.iter().map(Splittable::out_features).sum()
    }

    pub fn out_features_list(&self) -> Vec<usize> {
        self.siblings.iter().map(Splittable::out_features).collect()
    }

    /// Feature range (axis 1 of the output) owned by sibling `index`.
    pub fn sibling_range(&self, index: usize) -> Range<usize> {
        let start: usize = self.siblings[..index].iter().map(Splittable::out_features).sum();
        start..start + self.siblings[index].out_features()
    }

    /// Partition of the total features into at most `target` blocks.
    ///
    /// Blocks have size `⌈total/target⌉` or `⌊total/target⌋`, larger blocks first.
    /// With `target >= total` every feature becomes its own block.
    ///
    /// ```
    /// # use rust_extended_backprop::layers::{DenseLayer, Parallel};
    /// # use rust_extended_backprop::utils::SimpleRng;
    /// # let mut rng = SimpleRng::new(0);
    /// let composite = Parallel::new(vec![
    ///     DenseLayer::new(4, 3, true, &mut rng),
    ///     DenseLayer::new(4, 2, true, &mut rng),
    ///     DenseLayer::new(4, 5, true, &mut rng),
    /// ])
    /// .unwrap();
    /// assert_eq!(composite.compute_out_features_list(4).unwrap(), vec![3, 3, 2, 2]);
    /// ```
    pub fn compute_out_features_list(&self, target: usize) -> Result<Vec<usize>> {
        if target == 0 {
            return Err(BackpropError::SizeMismatch(
                "cannot merge into zero blocks".to_string(),
            ));
        }
        let total = self.total_out_features();
        let blocks = target.min(total);
        let (base, larger) = (total / blocks, total % blocks);
        Ok((0..blocks)
            .map(|i| if i < larger { base + 1 } else { base })
            .collect())
    }

    /// Repack the siblings into at most `target` near-equal blocks.
    pub fn merge(&mut self, target: usize) -> Result<()> {
        let sizes = self.compute_out_features_list(target)?;
        self.split(&sizes)
    }

    /// Repack the siblings exactly at the given block sizes.
    ///
    /// Fails with [`BackpropError::SizeMismatch`] and leaves the composite untouched
    /// unless the sizes are positive and sum to [`Parallel::total_out_features`].
    pub fn split(&mut self, sizes: &[usize]) -> Result<()> {
        let total = self.total_out_features();
        if sizes.is_empty() || sizes.contains(&0) || sizes.iter().sum::<usize>() != total {
            return Err(BackpropError::SizeMismatch(format!(
                "block sizes {:?} do not partition {} output features",
                sizes, total
            )));
        }
        let united = L::concat_out(&self.siblings)?;
        let siblings = united.split_out(sizes)?;
        self.siblings = siblings;
        Ok(())
    }

    /// Collapse all siblings into a single block.
    pub fn unite(&mut self) -> Result<()> {
        let united = L::concat_out(&self.siblings)?;
        self.siblings = vec![united];
        Ok(())
    }

    /// The equivalent single layer.
    pub fn to_layer(&self) -> Result<L> {
        L::concat_out(&self.siblings)
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let outputs = self
            .siblings
            .iter()
            .map(|s| s.forward(input))
            .collect::<Result<Vec<_>>>()?;
        concat(1, &outputs)
    }

    /// Sibling `index`'s part of a batched output-side tensor `[N, *out]`.
    pub fn sibling_output(&self, output: &Tensor, index: usize) -> Tensor {
        slice_axis(output, 1, self.sibling_range(index))
    }

    /// Flattened per-sample range of sibling `index` for an output of shape `[N, *out]`.
    pub fn sibling_flat_range(&self, output_shape: &[usize], index: usize) -> Range<usize> {
        let inner = numel(&output_shape[2..]);
        let range = self.sibling_range(index);
        range.start * inner..range.end * inner
    }
}

impl<L: Splittable> Derivatives for Parallel<L> {
    fn jac_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        let parts = self
            .siblings
            .iter()
            .enumerate()
            .map(|(i, s)| s.jac_mat_prod(input, &self.sibling_output(output, i), mat))
            .collect::<Result<Vec<_>>>()?;
        concat(2, &parts)
    }

    fn jac_t_mat_prod(&self, input: &Tensor, output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        if mat.ndim() != output.ndim() + 1 || mat.shape()[2] != self.total_out_features() {
            return Err(BackpropError::shape(format!(
                "parallel jac_t_mat_prod: expected [V, {:?}], got {:?}",
                output.shape(),
                mat.shape()
            )));
        }
        let mut result: Option<Tensor> = None;
        for (i, sibling) in self.siblings.iter().enumerate() {
            let part = slice_axis(mat, 2, self.sibling_range(i));
            let contribution =
                sibling.jac_t_mat_prod(input, &self.sibling_output(output, i), &part)?;
            result = Some(match result {
                Some(acc) => acc + contribution,
                None => contribution,
            });
        }
        result.ok_or_else(|| BackpropError::shape("parallel composite has no siblings"))
    }

    fn hessian_is_zero(&self) -> bool {
        self.siblings.iter().all(|s| s.hessian_is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::DenseLayer;
    use crate::utils::SimpleRng;

    fn composite(sizes: &[usize]) -> Parallel<DenseLayer> {
        let mut rng = SimpleRng::new(7);
        Parallel::new(
            sizes
                .iter()
                .map(|&out| DenseLayer::new(4, out, true, &mut rng))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_compute_out_features_list_examples() {
        let layer = composite(&[3, 2, 5]);
        assert_eq!(layer.total_out_features(), 10);
        assert_eq!(layer.compute_out_features_list(1).unwrap(), vec![10]);
        assert_eq!(layer.compute_out_features_list(4).unwrap(), vec![3, 3, 2, 2]);
        assert_eq!(
            layer.compute_out_features_list(6).unwrap(),
            vec![2, 2, 2, 2, 1, 1]
        );
        assert_eq!(layer.compute_out_features_list(10).unwrap(), vec![1; 10]);
        assert_eq!(layer.compute_out_features_list(15).unwrap(), vec![1; 10]);
        assert!(matches!(
            layer.compute_out_features_list(0),
            Err(BackpropError::SizeMismatch(_))
        ));
    }

    #[test]
    fn test_split_failure_leaves_composite_unchanged() {
        let mut layer = composite(&[3, 2, 5]);
        assert!(matches!(
            layer.split(&[4, 4]),
            Err(BackpropError::SizeMismatch(_))
        ));
        assert_eq!(layer.out_features_list(), vec![3, 2, 5]);
    }

    #[test]
    fn test_sibling_ranges() {
        let layer = composite(&[3, 2, 5]);
        assert_eq!(layer.sibling_range(0), 0..3);
        assert_eq!(layer.sibling_range(1), 3..5);
        assert_eq!(layer.sibling_range(2), 5..10);
        assert_eq!(layer.sibling_flat_range(&[2, 10, 3, 3], 1), 27..45);
    }
}
