//! 2D Convolutional layer implementation
//!
//! This module provides a Conv2DLayer that performs 2D convolution through patch
//! extraction: each sample is unfolded into a `[C_in * kh * kw, L]` matrix and the
//! kernel, viewed as a `[C_out, C_in * kh * kw]` matrix, multiplies it. All Jacobian
//! products reuse the same decomposition.

use crate::error::{BackpropError, Result};
use crate::layers::parallel::Splittable;
use crate::layers::r#trait::{Derivatives, ParameterDerivatives};
use crate::layers::{ParamKind, Parameterized};
use crate::utils::tensor::{check_stacked, numel, reshape, with_leading, Tensor};
use crate::utils::unfold::{fold, unfold, ConvGeometry};
use crate::utils::SimpleRng;
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, Ix3, Ix4, IxDyn};

/// 2D Convolutional layer with learnable filters.
///
/// Performs 2D convolution: slides filters over input to produce feature maps.
/// Supports zero-padding, stride and dilation. Inputs are `[N, C_in, H, W]`, outputs
/// `[N, C_out, out_h, out_w]`; the spatial size is read from the input on every call.
///
/// # Fields
///
/// * `in_channels` - Number of input channels (e.g., 1 for grayscale, 3 for RGB)
/// * `kernel` - Kernel height and width
/// * `stride`, `padding`, `dilation` - Per-axis convolution hyperparameters
/// * `weights` - Filters flattened to `[out_channels, in_channels * kh * kw]`
/// * `biases` - Optional bias for each output channel
/// * `save_memory` - Compute weight Jacobian-transpose products without the unfolded input
///
/// # Example
///
/// ```
/// use rust_extended_backprop::layers::Conv2DLayer;
/// use rust_extended_backprop::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// // 1 input channel (grayscale), 8 output channels, 3x3 kernel, padding=1, stride=1
/// let layer = Conv2DLayer::new(1, 8, 3, 1, 1, true, &mut rng).unwrap();
/// assert_eq!(layer.out_channels(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct Conv2DLayer {
    in_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
    weights: Array2<f64>,
    biases: Option<Array1<f64>>,
    save_memory: bool,
}

impl Conv2DLayer {
    /// Create a new Conv2DLayer with Xavier initialization.
    ///
    /// Weights are sampled uniformly from [-limit, limit] where
    /// limit = sqrt(6 / (fan_in + fan_out)), fan_in = in_channels × kernel_size² and
    /// fan_out = out_channels × kernel_size². Biases, when present, use the same range.
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output feature maps (filters)
    /// * `kernel_size` - Size of square kernel (e.g., 3 for 3×3)
    /// * `padding` - Zero-padding to apply on every side
    /// * `stride` - Stride for convolution
    /// * `bias` - Whether the layer owns a bias per output channel
    /// * `rng` - Random number generator for weight initialization
    ///
    /// Fails with [`BackpropError::ShapeError`] if a channel count, the kernel size or
    /// the stride is zero.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        stride: usize,
        bias: bool,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 {
            return Err(BackpropError::shape("conv2d channel counts must be positive"));
        }
        if kernel_size == 0 {
            return Err(BackpropError::shape("conv2d kernel size must be positive"));
        }
        if stride == 0 {
            return Err(BackpropError::shape("conv2d stride must be positive"));
        }
        let fan_in = (in_channels * kernel_size * kernel_size) as f64;
        let fan_out = (out_channels * kernel_size * kernel_size) as f64;
        let limit = (6.0f64 / (fan_in + fan_out)).sqrt();

        let patch = in_channels * kernel_size * kernel_size;
        let weights =
            Array2::from_shape_fn((out_channels, patch), |_| rng.gen_range_f64(-limit, limit));
        let biases =
            bias.then(|| Array1::from_shape_fn(out_channels, |_| rng.gen_range_f64(-limit, limit)));

        Ok(Self {
            in_channels,
            kernel: (kernel_size, kernel_size),
            stride: (stride, stride),
            padding: (padding, padding),
            dilation: (1, 1),
            weights,
            biases,
            save_memory: false,
        })
    }

    /// Build a layer from a `[C_out, C_in, kh, kw]` kernel and optional biases.
    pub fn from_parameters(
        weights: &Tensor,
        biases: Option<Array1<f64>>,
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
    ) -> Result<Self> {
        if weights.ndim() != 4 {
            return Err(BackpropError::shape(format!(
                "conv2d kernel must be [C_out, C_in, kh, kw], got {:?}",
                weights.shape()
            )));
        }
        let (c_out, c_in, kh, kw) = (
            weights.shape()[0],
            weights.shape()[1],
            weights.shape()[2],
            weights.shape()[3],
        );
        if let Some(b) = &biases {
            if b.len() != c_out {
                return Err(BackpropError::shape(format!(
                    "bias has {} entries for {} output channels",
                    b.len(),
                    c_out
                )));
            }
        }
        if kh == 0 || kw == 0 {
            return Err(BackpropError::shape("conv2d kernel size must be positive"));
        }
        if stride.0 == 0 || stride.1 == 0 || dilation.0 == 0 || dilation.1 == 0 {
            return Err(BackpropError::shape("stride and dilation must be positive"));
        }
        Ok(Self {
            in_channels: c_in,
            kernel: (kh, kw),
            stride,
            padding,
            dilation,
            weights: reshape(weights, &[c_out, c_in * kh * kw])?
                .into_dimensionality()
                .map_err(|e| BackpropError::shape(e.to_string()))?,
            biases,
            save_memory: false,
        })
    }

    /// Set the dilation on both spatial axes.
    pub fn with_dilation(mut self, dilation: usize) -> Result<Self> {
        if dilation == 0 {
            return Err(BackpropError::shape("conv2d dilation must be positive"));
        }
        self.dilation = (dilation, dilation);
        Ok(self)
    }

    /// Select how weight Jacobian-transpose products are evaluated.
    ///
    /// With `save_memory` the products are accumulated directly in kernel shape,
    /// otherwise the unfolded input is materialized once per sample.
    pub fn set_save_memory(&mut self, save_memory: bool) {
        self.save_memory = save_memory;
    }

    pub fn save_memory(&self) -> bool {
        self.save_memory
    }

    /// Get the number of input channels.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Get the number of output channels (filters).
    pub fn out_channels(&self) -> usize {
        self.weights.nrows()
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        self.kernel
    }

    pub fn padding(&self) -> (usize, usize) {
        self.padding
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    pub fn dilation(&self) -> (usize, usize) {
        self.dilation
    }

    pub fn biases(&self) -> Option<&Array1<f64>> {
        self.biases.as_ref()
    }

    /// Get the total number of trainable parameters.
    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.as_ref().map_or(0, |b| b.len())
    }

    /// Spatial output size for an `height × width` input.
    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        let geom = self.geometry_for(height, width);
        (geom.out_height(), geom.out_width())
    }

    /// Forward pass `[N, C_in, H, W]` → `[N, C_out, out_h, out_w]`.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let geom = self.geometry(input)?;
        let x = self.samples(input, input.shape()[0], &geom)?;
        let n = x.shape()[0];
        let (c_out, l) = (self.out_channels(), geom.num_patches());

        let mut out = Array3::<f64>::zeros((n, c_out, l));
        for sample in 0..n {
            let cols = unfold(&x.index_axis(Axis(0), sample), &geom);
            let mut y = self.weights.dot(&cols);
            if let Some(b) = &self.biases {
                y += &b.view().insert_axis(Axis(1));
            }
            out.index_axis_mut(Axis(0), sample).assign(&y);
        }
        reshape(&out.into_dyn(), &[n, c_out, geom.out_height(), geom.out_width()])
    }

    fn geometry_for(&self, height: usize, width: usize) -> ConvGeometry {
        ConvGeometry {
            in_channels: self.in_channels,
            height,
            width,
            kernel: self.kernel,
            stride: self.stride,
            padding: self.padding,
            dilation: self.dilation,
        }
    }

    fn geometry(&self, input: &Tensor) -> Result<ConvGeometry> {
        if input.ndim() != 4 || input.shape()[1] != self.in_channels {
            return Err(BackpropError::shape(format!(
                "conv2d expects input [N, {}, H, W], got {:?}",
                self.in_channels,
                input.shape()
            )));
        }
        let geom = self.geometry_for(input.shape()[2], input.shape()[3]);
        if geom.num_patches() == 0 {
            return Err(BackpropError::shape(format!(
                "conv2d kernel {:?} does not fit input {:?}",
                self.kernel,
                input.shape()
            )));
        }
        Ok(geom)
    }

    fn output_shape(&self, n: usize, geom: &ConvGeometry) -> Vec<usize> {
        vec![n, self.out_channels(), geom.out_height(), geom.out_width()]
    }

    /// Reshape any tensor holding `count` input-shaped samples into `[count, C, H, W]`.
    fn samples(&self, t: &Tensor, count: usize, geom: &ConvGeometry) -> Result<Array4<f64>> {
        reshape(t, &[count, geom.in_channels, geom.height, geom.width])?
            .into_dimensionality::<Ix4>()
            .map_err(|e| BackpropError::shape(e.to_string()))
    }

    /// Reshape any tensor holding `count` output-shaped samples into `[count, C_out, L]`.
    fn output_samples(&self, t: &Tensor, count: usize, geom: &ConvGeometry) -> Result<Array3<f64>> {
        reshape(t, &[count, self.out_channels(), geom.num_patches()])?
            .into_dimensionality::<Ix3>()
            .map_err(|e| BackpropError::shape(e.to_string()))
    }

    fn check_output_mat(
        &self,
        input: &Tensor,
        mat: &Tensor,
        what: &str,
    ) -> Result<(usize, ConvGeometry)> {
        let geom = self.geometry(input)?;
        let out_shape = self.output_shape(input.shape()[0], &geom);
        let v = check_stacked(mat, &out_shape, what)?;
        Ok((v, geom))
    }

    /// `g · unfold(x)ᵀ` without materializing `unfold(x)`.
    fn weight_grad_direct(
        &self,
        x: &ArrayView3<'_, f64>,
        g: &ArrayView2<'_, f64>,
        geom: &ConvGeometry,
    ) -> Array2<f64> {
        let (kh, kw) = self.kernel;
        let (oh, ow) = (geom.out_height(), geom.out_width());
        let mut grad = Array2::zeros(self.weights.dim());
        for o in 0..self.out_channels() {
            for c in 0..self.in_channels {
                for ki in 0..kh {
                    for kj in 0..kw {
                        let mut acc = 0.0;
                        for i in 0..oh {
                            let Some(h) = geom.source(0, i, ki) else { continue };
                            for j in 0..ow {
                                if let Some(w) = geom.source(1, j, kj) {
                                    acc += g[[o, i * ow + j]] * x[[c, h, w]];
                                }
                            }
                        }
                        grad[[o, (c * kh + ki) * kw + kj]] = acc;
                    }
                }
            }
        }
        grad
    }
}

impl Derivatives for Conv2DLayer {
    fn jac_mat_prod(&self, input: &Tensor, _output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        let geom = self.geometry(input)?;
        let n = input.shape()[0];
        let v = check_stacked(mat, input.shape(), "conv2d jac_mat_prod")?;
        let x = self.samples(mat, v * n, &geom)?;

        let mut out = Array3::<f64>::zeros((v * n, self.out_channels(), geom.num_patches()));
        for k in 0..v * n {
            let cols = unfold(&x.index_axis(Axis(0), k), &geom);
            out.index_axis_mut(Axis(0), k).assign(&self.weights.dot(&cols));
        }
        reshape(&out.into_dyn(), &with_leading(&[v], &self.output_shape(n, &geom)))
    }

    fn jac_t_mat_prod(&self, input: &Tensor, _output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        let (v, geom) = self.check_output_mat(input, mat, "conv2d jac_t_mat_prod")?;
        let n = input.shape()[0];
        let g = self.output_samples(mat, v * n, &geom)?;

        let mut out = Array4::<f64>::zeros((v * n, geom.in_channels, geom.height, geom.width));
        for k in 0..v * n {
            let cols = self.weights.t().dot(&g.index_axis(Axis(0), k));
            out.index_axis_mut(Axis(0), k).assign(&fold(&cols.view(), &geom));
        }
        reshape(&out.into_dyn(), &with_leading(&[v], input.shape()))
    }

    fn hessian_is_zero(&self) -> bool {
        true
    }
}

impl ParameterDerivatives for Conv2DLayer {
    fn weight_shape(&self) -> Vec<usize> {
        vec![
            self.out_channels(),
            self.in_channels,
            self.kernel.0,
            self.kernel.1,
        ]
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
        let geom = self.geometry(input)?;
        let n = input.shape()[0];
        let v = check_stacked(mat, &self.weight_shape(), "conv2d weight_jac_mat_prod")?;
        let directions = reshape(mat, &[v, self.out_channels(), geom.patch_size()])?
            .into_dimensionality::<Ix3>()
            .map_err(|e| BackpropError::shape(e.to_string()))?;
        let x = self.samples(input, n, &geom)?;
        let cols: Vec<Array2<f64>> = (0..n)
            .map(|sample| unfold(&x.index_axis(Axis(0), sample), &geom))
            .collect();

        let mut out = Array4::<f64>::zeros((v, n, self.out_channels(), geom.num_patches()));
        for k in 0..v {
            let direction = directions.index_axis(Axis(0), k);
            for (sample, c) in cols.iter().enumerate() {
                out.slice_mut(s![k, sample, .., ..]).assign(&direction.dot(c));
            }
        }
        reshape(&out.into_dyn(), &with_leading(&[v], &self.output_shape(n, &geom)))
    }

    fn weight_jac_t_mat_prod(
        &self,
        input: &Tensor,
        _output: &Tensor,
        mat: &Tensor,
        sum_batch: bool,
    ) -> Result<Tensor> {
        let (v, geom) = self.check_output_mat(input, mat, "conv2d weight_jac_t_mat_prod")?;
        let n = input.shape()[0];
        let g = self.output_samples(mat, v * n, &geom)?;
        let x = self.samples(input, n, &geom)?;
        let cols: Vec<Array2<f64>> = if self.save_memory {
            Vec::new()
        } else {
            (0..n)
                .map(|sample| unfold(&x.index_axis(Axis(0), sample), &geom))
                .collect()
        };

        let (c_out, p) = self.weights.dim();
        let mut out = Array4::<f64>::zeros((v, n, c_out, p));
        for k in 0..v {
            for sample in 0..n {
                let grad_out = g.index_axis(Axis(0), k * n + sample);
                let block = if self.save_memory {
                    self.weight_grad_direct(&x.index_axis(Axis(0), sample), &grad_out, &geom)
                } else {
                    grad_out.dot(&cols[sample].t())
                };
                out.slice_mut(s![k, sample, .., ..]).assign(&block);
            }
        }

        if sum_batch {
            reshape(&out.sum_axis(Axis(1)).into_dyn(), &with_leading(&[v], &self.weight_shape()))
        } else {
            reshape(&out.into_dyn(), &with_leading(&[v, n], &self.weight_shape()))
        }
    }

    fn bias_jac_mat_prod(&self, input: &Tensor, _output: &Tensor, mat: &Tensor) -> Result<Tensor> {
        let shape = self
            .bias_shape()
            .ok_or_else(|| BackpropError::shape("conv2d layer has no bias"))?;
        let geom = self.geometry(input)?;
        let v = check_stacked(mat, &shape, "conv2d bias_jac_mat_prod")?;
        let target = with_leading(&[v], &self.output_shape(input.shape()[0], &geom));
        let expanded = reshape(mat, &[v, 1, self.out_channels(), 1, 1])?;
        let view = expanded
            .broadcast(IxDyn(&target))
            .ok_or_else(|| BackpropError::shape("bias broadcast failed"))?;
        Ok(view.to_owned())
    }

    fn bias_jac_t_mat_prod(
        &self,
        input: &Tensor,
        _output: &Tensor,
        mat: &Tensor,
        sum_batch: bool,
    ) -> Result<Tensor> {
        if self.biases.is_none() {
            return Err(BackpropError::shape("conv2d layer has no bias"));
        }
        self.check_output_mat(input, mat, "conv2d bias_jac_t_mat_prod")?;
        // [V, N, C_out, oh, ow] -> [V, N, C_out]
        let per_sample = mat.sum_axis(Axis(4)).sum_axis(Axis(3));
        if sum_batch {
            Ok(per_sample.sum_axis(Axis(1)))
        } else {
            Ok(per_sample)
        }
    }
}

impl Parameterized for Conv2DLayer {
    fn param(&self, kind: ParamKind) -> Option<Tensor> {
        match kind {
            ParamKind::Weight => {
                reshape(&self.weights.clone().into_dyn(), &self.weight_shape()).ok()
            }
            ParamKind::Bias => self.biases.as_ref().map(|b| b.clone().into_dyn()),
        }
    }

    fn set_param(&mut self, kind: ParamKind, value: &Tensor) -> Result<()> {
        let expected = self
            .param_shape(kind)
            .ok_or_else(|| BackpropError::shape(format!("conv2d layer has no {}", kind)))?;
        if value.shape() != expected.as_slice() {
            return Err(BackpropError::shape(format!(
                "conv2d {}: expected shape {:?}, got {:?}",
                kind,
                expected,
                value.shape()
            )));
        }
        match kind {
            ParamKind::Weight => {
                self.weights = reshape(value, &[self.out_channels(), numel(&expected[1..])])?
                    .into_dimensionality()
                    .map_err(|e| BackpropError::shape(e.to_string()))?;
            }
            ParamKind::Bias => self.biases = Some(value.iter().copied().collect()),
        }
        Ok(())
    }
}

impl Splittable for Conv2DLayer {
    fn out_features(&self) -> usize {
        self.out_channels()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Conv2DLayer::forward(self, input)
    }

    fn split_out(&self, sizes: &[usize]) -> Result<Vec<Self>> {
        let mut start = 0;
        let mut parts = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let mut part = self.clone();
            part.weights = self.weights.slice(s![start..start + size, ..]).to_owned();
            part.biases = self
                .biases
                .as_ref()
                .map(|b| b.slice(s![start..start + size]).to_owned());
            parts.push(part);
            start += size;
        }
        Ok(parts)
    }

    fn concat_out(parts: &[Self]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| BackpropError::SizeMismatch("no blocks to concatenate".to_string()))?;
        for part in parts {
            if part.in_channels != first.in_channels
                || part.kernel != first.kernel
                || part.stride != first.stride
                || part.padding != first.padding
                || part.dilation != first.dilation
                || part.biases.is_some() != first.biases.is_some()
            {
                return Err(BackpropError::SizeMismatch(
                    "conv2d blocks differ in structure".to_string(),
                ));
            }
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
        Ok(Self {
            weights,
            biases,
            ..first.clone()
        })
    }
}
