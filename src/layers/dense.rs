//! Dense (fully connected) layer implementation
//!
//! This module provides a DenseLayer (also known as Linear or Fully Connected layer)
//! that performs the transformation: output = input × weightsᵀ + biases, together with
//! its Jacobian products with respect to the input, the weight and the bias.

use crate::error::{BackpropError, Result};
use crate::layers::parallel::Splittable;
use crate::layers::r#trait::{zeros_with, Derivatives, ParameterDerivatives};
use crate::layers::{ParamKind, Parameterized};
use crate::utils::tensor::{as_matrix, check_shape, check_stacked, reshape, Tensor};
use crate::utils::SimpleRng;
use ndarray::{s, Array1, Array2, Axis, Ix1, Ix2};

/// Dense (fully connected) layer with weights and optional biases.
///
/// Performs the affine transformation: y = xWᵀ + b
/// where x is the input (batch_size × in_features),
/// W is the weight matrix (out_features × in_features),
/// and b is the bias vector (out_features).
///
/// # Example
///
/// ```
/// use rust_extended_backprop::layers::DenseLayer;
/// use rust_extended_backprop::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let layer = DenseLayer::new(784, 512, true, &mut rng);
/// assert_eq!(layer.in_features(), 784);
/// assert_eq!(layer.out_features(), 512);
/// ```
#[derive(Debug, Clone)]
pub struct DenseLayer {
    weights: Array2<f64>,
    biases: Option<Array1<f64>>,
}

impl DenseLayer {
    /// Create a new DenseLayer with Xavier initialization.
    ///
    /// Weights are sampled uniformly from [-limit, limit] with
    /// limit = sqrt(6 / (in_features + out_features)). Biases, when present, are
    /// sampled from the same range so that bias curvature is not trivially symmetric.
    ///
    /// # Arguments
    ///
    /// * `in_features` - Number of input features
    /// * `out_features` - Number of output features
    /// * `bias` - Whether the layer owns a bias vector
    /// * `rng` - Random number generator for weight initialization
    pub fn new(in_features: usize, out_features: usize, bias: bool, rng: &mut SimpleRng) -> Self {
        let limit = (6.0f64 / (in_features + out_features) as f64).sqrt();
        let weights = Array2::from_shape_fn((out_features, in_features), |_| {
            rng.gen_range_f64(-limit, limit)
        });
        let biases =
            bias.then(|| Array1::from_shape_fn(out_features, |_| rng.gen_range_f64(-limit, limit)));
        Self { weights, biases }
    }

    /// Build a layer from explicit parameters.
    pub fn from_parameters(weights: Array2<f64>, biases: Option<Array1<f64>>) -> Result<Self> {
        if let Some(b) = &biases {
            if b.len() != weights.nrows() {
                return Err(BackpropError::shape(format!(
                    "bias has {} entries for {} output features",
                    b.len(),
                    weights.nrows()
                )));
            }
        }
        Ok(Self { weights, biases })
    }

    pub fn in_features(&self) -> usize {
        self.weights.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn biases(&self) -> Option<&Array1<f64>> {
        self.biases.as_ref()
    }

    pub fn set_weights(&mut self, weights: Array2<f64>) -> Result<()> {
        if weights.dim() != self.weights.dim() {
            return Err(BackpropError::shape(format!(
                "weight shape {:?} does not match {:?}",
                weights.dim(),
                self.weights.dim()
            )));
        }
        self.weights = weights;
        Ok(())
    }

    pub fn set_biases(&mut self, biases: Array1<f64>) -> Result<()> {
        match &self.biases {
            Some(b) if b.len() == biases.len() => {
                self.biases = Some(biases);
                Ok(())
            }
            Some(b) => Err(BackpropError::shape(format!(
                "bias length {} does not match {}",
                biases.len(),
                b.len()
            ))),
            None => Err(BackpropError::shape("layer has no bias")),
        }
    }

    /// Number of trainable parameters: weights plus biases.
    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.as_ref().map_or(0, |b| b.len())
    }

    /// Forward pass `[N, in]` → `[N, out]`.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let x = self.input_matrix(input)?;
        let mut y = x.dot(&self.weights.t());
        if let Some(b) = &self.biases {
            y += b;
        }
        Ok(y.into_dyn())
    }

    fn input_matrix(&self, input: &Tensor) -> Result<Array2<f64>> {
        if input.ndim() != 2 || input.shape()[1] != self.in_features() {
            return Err(BackpropError::shape(format!(
                "dense layer expects input [N, {}], got {:?}",
                self.in_features(),
                input.shape()
            )));
        }
        input
            .clone()
            .into_dimensionality::<Ix2>()
            .map_err(|e| BackpropError::shape(e.to_string()))
    }

    fn output_block(&self, input: &Tensor, mat: &Tensor, what: &str) -> Result<(usize, usize)> {
        let n = input.shape()[0];
        let v = check_stacked(mat, &[n, self.out_features()], what)?;
        Ok((v, n))
    }
}

impl Derivatives for DenseLayer {
    fn jac_mat_prod(&self, input: &Tensor, _output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        let n = input.shape()[0];
        let v = check_stacked(mat, &[n, self.in_features()], "dense jac_mat_prod")?;
        let flat = as_matrix(mat, v * n)?;
        reshape(&flat.dot(&self.weights.t()).into_dyn(), &[v, n, self.out_features()])
    }

    fn jac_t_mat_prod(&self, input: &Tensor, _output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        let (v, n) = self.output_block(input, mat, "dense jac_t_mat_prod")?;
        let flat = as_matrix(mat, v * n)?;
        reshape(&flat.dot(&self.weights).into_dyn(), &[v, n, self.in_features()])
    }

    fn hessian_is_zero(&self) -> bool {
        true
    }
}

impl ParameterDerivatives for DenseLayer {
    fn weight_shape(&self) -> Vec<usize> {
        vec![self.out_features(), self.in_features()]
    }

    fn bias_shape(&self) -> Option<Vec<usize>> {
        self.biases.as_ref().map(|b| vec![b.len()])
    }

    fn weight_jac_mat_prod(
        &self,
        input: &Tensor,
        _output: &Tensor,
        mat: &Tensor,
    ) -> Result<Tensor> {
        let x = self.input_matrix(input)?;
        let n = x.nrows();
        let v = check_stacked(mat, &self.weight_shape(), "dense weight_jac_mat_prod")?;
        let mut result = zeros_with(&[v, n], &[self.out_features()]);
        for (k, direction) in mat.axis_iter(Axis(0)).enumerate() {
            let direction = direction
                .into_dimensionality::<Ix2>()
                .map_err(|e| BackpropError::shape(e.to_string()))?;
            result
                .index_axis_mut(Axis(0), k)
                .assign(&x.dot(&direction.t()).into_dyn());
        }
        Ok(result)
    }

    fn weight_jac_t_mat_prod(
        &self,
        input: &Tensor,
        _output: &Tensor,
        mat: &Tensor,
        sum_batch: bool,
    ) -> Result<Tensor> {
        let x = self.input_matrix(input)?;
        let (v, n) = self.output_block(input, mat, "dense weight_jac_t_mat_prod")?;
        let (out_f, in_f) = (self.out_features(), self.in_features());
        if sum_batch {
            let mut result = zeros_with(&[v], &[out_f, in_f]);
            for (k, block) in mat.axis_iter(Axis(0)).enumerate() {
                let block = block
                    .into_dimensionality::<Ix2>()
                    .map_err(|e| BackpropError::shape(e.to_string()))?;
                result
                    .index_axis_mut(Axis(0), k)
                    .assign(&block.t().dot(&x).into_dyn());
            }
            Ok(result)
        } else {
            let mut result = zeros_with(&[v, n], &[out_f, in_f]);
            for k in 0..v {
                for sample in 0..n {
                    for o in 0..out_f {
                        let g = mat[[k, sample, o]];
                        for i in 0..in_f {
                            result[[k, sample, o, i]] = g * x[[sample, i]];
                        }
                    }
                }
            }
            Ok(result)
        }
    }

    fn bias_jac_mat_prod(&self, input: &Tensor, _output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        let shape = self
            .bias_shape()
            .ok_or_else(|| BackpropError::shape("dense layer has no bias"))?;
        let n = input.shape()[0];
        let v = check_stacked(mat, &shape, "dense bias_jac_mat_prod")?;
        let mut result = zeros_with(&[v, n], &shape);
        for k in 0..v {
            for sample in 0..n {
                result
                    .index_axis_mut(Axis(0), k)
                    .index_axis_mut(Axis(0), sample)
                    .assign(&mat.index_axis(Axis(0), k));
            }
        }
        Ok(result)
    }

    fn bias_jac_t_mat_prod(
        &self,
        input: &Tensor,
        output: &Tensor,
        mat: &Tensor,
        sum_batch: bool,
    ) -> Result<Tensor> {
        if self.biases.is_none() {
            return Err(BackpropError::shape("dense layer has no bias"));
        }
        check_shape(output, &[input.shape()[0], self.out_features()], "dense output")?;
        self.output_block(input, mat, "dense bias_jac_t_mat_prod")?;
        if sum_batch {
            Ok(mat.sum_axis(Axis(1)))
        } else {
            Ok(mat.clone())
        }
    }
}

impl Parameterized for DenseLayer {
    fn param(&self, kind: ParamKind) -> Option<Tensor> {
        match kind {
            ParamKind::Weight => Some(self.weights.clone().into_dyn()),
            ParamKind::Bias => self.biases.as_ref().map(|b| b.clone().into_dyn()),
        }
    }

    fn set_param(&mut self, kind: ParamKind, value: &Tensor) -> Result<()> {
        match kind {
            ParamKind::Weight => self.set_weights(
                value
                    .clone()
                    .into_dimensionality::<Ix2>()
                    .map_err(|e| BackpropError::shape(e.to_string()))?,
            ),
            ParamKind::Bias => self.set_biases(
                value
                    .clone()
                    .into_dimensionality::<Ix1>()
                    .map_err(|e| BackpropError::shape(e.to_string()))?,
            ),
        }
    }
}

impl Splittable for DenseLayer {
    fn out_features(&self) -> usize {
        DenseLayer::out_features(self)
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        DenseLayer::forward(self, input)
    }

    fn split_out(&self, sizes: &[usize]) -> Result<Vec<Self>> {
        let mut start = 0;
        let mut parts = Vec::with_capacity(sizes.len());
        for &size in sizes {
            parts.push(Self {
                weights: self.weights.slice(s![start..start + size, ..]).to_owned(),
                biases: self
                    .biases
                    .as_ref()
                    .map(|b| b.slice(s![start..start + size]).to_owned()),
            });
            start += size;
        }
        Ok(parts)
    }

    fn concat_out(parts: &[Self]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| BackpropError::SizeMismatch("no blocks to concatenate".to_string()))?;
        if parts.iter().any(|p| {
            p.in_features() != first.in_features() || p.biases.is_some() != first.biases.is_some()
        }) {
            return Err(BackpropError::SizeMismatch(
                "dense blocks differ in input features or bias".to_string(),
            ));
        }
        let weights: Vec<_> = parts.iter().map(|p| p.weights.view()).collect();
        let weights = ndarray::concatenate(Axis(0), &weights)
            .map_err(|e| BackpropError::shape(e.to_string()))?;
        let biases = match first.biases {
            Some(_) => {
                let views: Vec<_> = parts
                    .iter()
                    .filter_map(|p| p.biases.as_ref())
                    .map(|b| b.view())
                    .collect();
                Some(
                    ndarray::concatenate(Axis(0), &views)
                        .map_err(|e| BackpropError::shape(e.to_string()))?,
                )
            }
            None => None,
        };
        Ok(Self { weights, biases })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_layer_creation() {
        let mut rng = SimpleRng::new(42);
        let layer = DenseLayer::new(10, 5, true, &mut rng);

        assert_eq!(layer.in_features(), 10);
        assert_eq!(layer.out_features(), 5);
        assert_eq!(layer.weights().len(), 50); // 5 × 10
        assert_eq!(layer.parameter_count(), 55);
    }

    #[test]
    fn test_xavier_initialization() {
        let mut rng = SimpleRng::new(42);
        let layer = DenseLayer::new(100, 50, false, &mut rng);
        let limit = (6.0f64 / 150.0).sqrt();

        for &weight in layer.weights() {
            assert!(
                weight >= -limit && weight <= limit,
                "Weight {} outside Xavier range [{}, {}]",
                weight,
                -limit,
                limit
            );
        }
        assert!(layer.biases().is_none());
    }

    #[test]
    fn test_deterministic_initialization() {
        let layer1 = DenseLayer::new(10, 5, true, &mut SimpleRng::new(42));
        let layer2 = DenseLayer::new(10, 5, true, &mut SimpleRng::new(42));

        assert_eq!(layer1.weights(), layer2.weights());
        assert_eq!(layer1.biases(), layer2.biases());
    }

    #[test]
    fn test_forward_rejects_wrong_rank() {
        let layer = DenseLayer::new(3, 2, true, &mut SimpleRng::new(1));
        let input = Tensor::zeros(ndarray::IxDyn(&[2, 3, 1]));
        assert!(matches!(
            layer.forward(&input),
            Err(BackpropError::ShapeError(_))
        ));
    }
}
