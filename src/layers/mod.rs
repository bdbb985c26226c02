//! Layer abstractions for extended backpropagation
//!
//! This module provides the closed set of supported layer kinds, the forward hook that
//! caches every layer's input and output, and the parameter identities used to key the
//! artifacts produced by an extended backward pass.

mod r#trait;
pub mod activation;
pub mod conv2d;
pub mod dense;
pub mod flatten;
pub mod parallel;

pub use activation::{ActivationKind, ActivationLayer};
pub use conv2d::Conv2DLayer;
pub use dense::DenseLayer;
pub use flatten::FlattenLayer;
pub use parallel::{Parallel, Splittable};
pub use r#trait::{Derivatives, ParameterDerivatives};

use crate::error::{BackpropError, Result};
use crate::utils::tensor::{numel, slice_axis, Tensor};
use ndarray::{s, Array2};
use std::fmt;
use std::ops::Range;

/// Which parameter of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKind {
    Weight,
    Bias,
}

impl ParamKind {
    pub const ALL: [ParamKind; 2] = [ParamKind::Weight, ParamKind::Bias];
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Weight => write!(f, "weight"),
            ParamKind::Bias => write!(f, "bias"),
        }
    }
}

/// Identity of a parameter inside a [`crate::model::Sequential`].
///
/// `sibling` is set for parameters owned by one branch of a parallel composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId {
    pub layer: usize,
    pub sibling: Option<usize>,
    pub kind: ParamKind,
}

impl ParamId {
    pub fn new(layer: usize, kind: ParamKind) -> Self {
        Self {
            layer,
            sibling: None,
            kind,
        }
    }

    pub fn sibling(layer: usize, sibling: usize, kind: ParamKind) -> Self {
        Self {
            layer,
            sibling: Some(sibling),
            kind,
        }
    }

    pub fn weight(layer: usize) -> Self {
        Self::new(layer, ParamKind::Weight)
    }

    pub fn bias(layer: usize) -> Self {
        Self::new(layer, ParamKind::Bias)
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sibling {
            Some(sibling) => write!(f, "{}.{}.{}", self.layer, sibling, self.kind),
            None => write!(f, "{}.{}", self.layer, self.kind),
        }
    }
}

/// Read and overwrite parameter values.
pub trait Parameterized {
    /// Current value of the parameter, `None` if the layer does not own it.
    fn param(&self, kind: ParamKind) -> Option<Tensor>;

    fn set_param(&mut self, kind: ParamKind, value: &Tensor) -> Result<()>;
}

/// Closed set of supported layer kinds.
#[derive(Debug, Clone)]
pub enum LayerKind {
    Dense(DenseLayer),
    Conv2d(Conv2DLayer),
    Activation(ActivationLayer),
    Flatten(FlattenLayer),
    ParallelDense(Parallel<DenseLayer>),
    ParallelConv2d(Parallel<Conv2DLayer>),
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Dense(_) => "linear",
            LayerKind::Conv2d(_) => "conv2d",
            LayerKind::Activation(a) => match a.kind() {
                ActivationKind::Relu => "relu",
                ActivationKind::Sigmoid => "sigmoid",
                ActivationKind::Tanh => "tanh",
            },
            LayerKind::Flatten(_) => "flatten",
            LayerKind::ParallelDense(_) => "parallel_linear",
            LayerKind::ParallelConv2d(_) => "parallel_conv2d",
        }
    }
}

/// One parameter-owning block of a layer and the slice of the layer output it drives.
pub struct ParamBlock<'a> {
    pub sibling: Option<usize>,
    pub provider: &'a dyn ParameterDerivatives,
    /// Range on axis 1 of the layer output, `None` for the whole output.
    pub features: Option<Range<usize>>,
    /// Range of the flattened per-sample output, `None` for the whole output.
    pub flat: Option<Range<usize>>,
}

impl<'a> ParamBlock<'a> {
    fn whole(provider: &'a dyn ParameterDerivatives) -> Self {
        Self {
            sibling: None,
            provider,
            features: None,
            flat: None,
        }
    }

    /// Parameter kinds this block owns.
    pub fn kinds(&self) -> Vec<ParamKind> {
        ParamKind::ALL
            .into_iter()
            .filter(|&kind| self.provider.param_shape(kind).is_some())
            .collect()
    }

    pub fn id(&self, layer: usize, kind: ParamKind) -> ParamId {
        ParamId {
            layer,
            sibling: self.sibling,
            kind,
        }
    }

    /// Slice a batched output-side tensor `[N, *out]`.
    pub fn slice_batched(&self, t: &Tensor) -> Tensor {
        match &self.features {
            Some(range) => slice_axis(t, 1, range.clone()),
            None => t.clone(),
        }
    }

    /// Slice a stacked output-side tensor `[V, N, *out]`.
    pub fn slice_stacked(&self, t: &Tensor) -> Tensor {
        match &self.features {
            Some(range) => slice_axis(t, 2, range.clone()),
            None => t.clone(),
        }
    }

    /// Diagonal block of a flattened output-side matrix `[D_out, D_out]`.
    pub fn slice_matrix(&self, m: &Array2<f64>) -> Array2<f64> {
        match &self.flat {
            Some(range) => m.slice(s![range.clone(), range.clone()]).to_owned(),
            None => m.clone(),
        }
    }
}

/// A layer together with its forward cache.
///
/// The cache is overwritten on every forward call and read by the backward hooks.
#[derive(Debug, Clone)]
pub struct Layer {
    kind: LayerKind,
    input: Option<Tensor>,
    output: Option<Tensor>,
}

impl Layer {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            input: None,
            output: None,
        }
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut LayerKind {
        &mut self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Forward hook: evaluate the layer and cache its input and output.
    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.check_rank(input)?;
        let output = match &self.kind {
            LayerKind::Dense(l) => l.forward(input)?,
            LayerKind::Conv2d(l) => l.forward(input)?,
            LayerKind::Activation(l) => l.forward(input)?,
            LayerKind::Flatten(l) => l.forward(input)?,
            LayerKind::ParallelDense(l) => l.forward(input)?,
            LayerKind::ParallelConv2d(l) => l.forward(input)?,
        };
        self.input = Some(input.clone());
        self.output = Some(output.clone());
        Ok(output)
    }

    fn check_rank(&self, input: &Tensor) -> Result<()> {
        let ok = match &self.kind {
            LayerKind::Dense(_) | LayerKind::ParallelDense(_) => input.ndim() == 2,
            LayerKind::Conv2d(_) | LayerKind::ParallelConv2d(_) => input.ndim() == 4,
            LayerKind::Activation(_) | LayerKind::Flatten(_) => input.ndim() >= 2,
        };
        if ok {
            Ok(())
        } else {
            Err(BackpropError::shape(format!(
                "{} layer received input of rank {} (shape {:?})",
                self.name(),
                input.ndim(),
                input.shape()
            )))
        }
    }

    /// Cached `(input, output)` of the last forward call.
    pub fn cached(&self) -> Result<(&Tensor, &Tensor)> {
        match (&self.input, &self.output) {
            (Some(input), Some(output)) => Ok((input, output)),
            _ => Err(BackpropError::shape(format!(
                "{} layer has no cached forward pass",
                self.name()
            ))),
        }
    }

    pub fn clear_cache(&mut self) {
        self.input = None;
        self.output = None;
    }

    pub fn derivatives(&self) -> &dyn Derivatives {
        match &self.kind {
            LayerKind::Dense(l) => l,
            LayerKind::Conv2d(l) => l,
            LayerKind::Activation(l) => l,
            LayerKind::Flatten(l) => l,
            LayerKind::ParallelDense(l) => l,
            LayerKind::ParallelConv2d(l) => l,
        }
    }

    /// Parameter-owning blocks; empty for parameter-free layers.
    pub fn parameter_blocks(&self) -> Vec<ParamBlock<'_>> {
        match &self.kind {
            LayerKind::Dense(l) => vec![ParamBlock::whole(l)],
            LayerKind::Conv2d(l) => vec![ParamBlock::whole(l)],
            LayerKind::Activation(_) | LayerKind::Flatten(_) => Vec::new(),
            LayerKind::ParallelDense(p) => self.sibling_blocks(p),
            LayerKind::ParallelConv2d(p) => self.sibling_blocks(p),
        }
    }

    fn sibling_blocks<'a, L: Splittable + 'a>(
        &self,
        parallel: &'a Parallel<L>,
    ) -> Vec<ParamBlock<'a>> {
        let out_shape = self.output.as_ref().map(|o| o.shape().to_vec());
        parallel
            .siblings()
            .iter()
            .enumerate()
            .map(|(i, sibling)| ParamBlock {
                sibling: Some(i),
                provider: sibling as &dyn ParameterDerivatives,
                features: Some(parallel.sibling_range(i)),
                flat: out_shape
                    .as_ref()
                    .map(|shape| parallel.sibling_flat_range(shape, i)),
            })
            .collect()
    }

    /// Identities of every parameter, given this layer's position `index`.
    pub fn param_ids(&self, index: usize) -> Vec<ParamId> {
        self.parameter_blocks()
            .iter()
            .flat_map(|block| {
                block
                    .kinds()
                    .into_iter()
                    .map(move |kind| block.id(index, kind))
            })
            .collect()
    }

    /// Number of elements of parameter `(sibling, kind)`, if present.
    pub fn param_numel(&self, sibling: Option<usize>, kind: ParamKind) -> Option<usize> {
        self.parameter_blocks()
            .iter()
            .find(|b| b.sibling == sibling)
            .and_then(|b| b.provider.param_shape(kind))
            .map(|shape| numel(&shape))
    }

    pub fn param(&self, sibling: Option<usize>, kind: ParamKind) -> Option<Tensor> {
        match (&self.kind, sibling) {
            (LayerKind::Dense(l), None) => l.param(kind),
            (LayerKind::Conv2d(l), None) => l.param(kind),
            (LayerKind::ParallelDense(p), Some(i)) => p.siblings().get(i)?.param(kind),
            (LayerKind::ParallelConv2d(p), Some(i)) => p.siblings().get(i)?.param(kind),
            _ => None,
        }
    }

    pub fn set_param(
        &mut self,
        sibling: Option<usize>,
        kind: ParamKind,
        value: &Tensor,
    ) -> Result<()> {
        let name = self.name();
        let missing = || BackpropError::shape(format!("{} layer has no such {}", name, kind));
        match (&mut self.kind, sibling) {
            (LayerKind::Dense(l), None) => l.set_param(kind, value),
            (LayerKind::Conv2d(l), None) => l.set_param(kind, value),
            (LayerKind::ParallelDense(p), Some(i)) => p
                .siblings_mut()
                .get_mut(i)
                .ok_or_else(missing)?
                .set_param(kind, value),
            (LayerKind::ParallelConv2d(p), Some(i)) => p
                .siblings_mut()
                .get_mut(i)
                .ok_or_else(missing)?
                .set_param(kind, value),
            _ => Err(missing()),
        }
    }
}

impl From<LayerKind> for Layer {
    fn from(kind: LayerKind) -> Self {
        Layer::new(kind)
    }
}

impl From<DenseLayer> for Layer {
    fn from(layer: DenseLayer) -> Self {
        Layer::new(LayerKind::Dense(layer))
    }
}

impl From<Conv2DLayer> for Layer {
    fn from(layer: Conv2DLayer) -> Self {
        Layer::new(LayerKind::Conv2d(layer))
    }
}

impl From<ActivationLayer> for Layer {
    fn from(layer: ActivationLayer) -> Self {
        Layer::new(LayerKind::Activation(layer))
    }
}

impl From<FlattenLayer> for Layer {
    fn from(layer: FlattenLayer) -> Self {
        Layer::new(LayerKind::Flatten(layer))
    }
}

impl From<Parallel<DenseLayer>> for Layer {
    fn from(layer: Parallel<DenseLayer>) -> Self {
        Layer::new(LayerKind::ParallelDense(layer))
    }
}

impl From<Parallel<Conv2DLayer>> for Layer {
    fn from(layer: Parallel<Conv2DLayer>) -> Self {
        Layer::new(LayerKind::ParallelConv2d(layer))
    }
}
