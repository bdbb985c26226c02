//! Sequential host network
//!
//! A minimal host for the extension engine: it runs the forward pass through every
//! layer's forward hook, evaluates the loss, and runs the ordinary first-order
//! backward pass. The backward pass hands the engine what it needs: the gradient of
//! the loss with respect to every layer output, in layer order.

use crate::error::{BackpropError, Result};
use crate::layers::{Layer, ParamId};
use crate::loss::{Loss, Target};
use crate::utils::tensor::Tensor;
use ndarray::Axis;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<Layer>,
    loss: Loss,
    input: Option<Tensor>,
    target: Option<Target>,
    output: Option<Tensor>,
    grads: HashMap<ParamId, Tensor>,
}

impl Sequential {
    pub fn new(layers: Vec<Layer>, loss: Loss) -> Self {
        Self {
            layers,
            loss,
            input: None,
            target: None,
            output: None,
            grads: HashMap::new(),
        }
    }

    pub fn push(&mut self, layer: impl Into<Layer>) {
        self.layers.push(layer.into());
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn loss(&self) -> &Loss {
        &self.loss
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// Network output of the last forward pass.
    pub fn output(&self) -> Option<&Tensor> {
        self.output.as_ref()
    }

    /// Run every layer, caching inputs and outputs.
    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let mut current = input.clone();
        for layer in &mut self.layers {
            current = layer.forward(&current)?;
        }
        self.input = Some(input.clone());
        self.output = Some(current.clone());
        Ok(current)
    }

    /// Forward pass followed by the loss; remembers the target for the backward pass.
    pub fn forward_loss(&mut self, input: &Tensor, target: Target) -> Result<f64> {
        let output = self.forward(input)?;
        let value = self.loss.derivatives().value(&output, &target)?;
        self.target = Some(target);
        Ok(value)
    }

    /// Ordinary backward pass.
    ///
    /// Stores the parameter gradients and returns `∂L/∂(output of layer i)` for every
    /// layer `i`.
    pub fn backward(&mut self) -> Result<Vec<Tensor>> {
        let (output, target) = match (&self.output, &self.target) {
            (Some(output), Some(target)) => (output, target),
            _ => {
                return Err(BackpropError::shape(
                    "backward called before forward_loss",
                ))
            }
        };
        let mut grad = self.loss.derivatives().gradient(output, target)?;
        let mut grad_outputs = vec![Tensor::zeros(ndarray::IxDyn(&[0])); self.layers.len()];
        self.grads.clear();

        for (index, layer) in self.layers.iter().enumerate().rev() {
            let (input, layer_output) = layer.cached()?;
            if grad.shape() != layer_output.shape() {
                return Err(BackpropError::shape(format!(
                    "gradient {:?} does not match output {:?} of layer {}",
                    grad.shape(),
                    layer_output.shape(),
                    index
                )));
            }
            for block in layer.parameter_blocks() {
                let block_output = block.slice_batched(layer_output);
                let mat = block.slice_batched(&grad).insert_axis(Axis(0));
                for kind in block.kinds() {
                    let g = block
                        .provider
                        .param_jac_t_mat_prod(kind, input, &block_output, &mat, true)?
                        .index_axis_move(Axis(0), 0);
                    self.grads.insert(block.id(index, kind), g);
                }
            }
            let upstream = layer.derivatives().jac_t_mat_prod(
                input,
                layer_output,
                &grad.clone().insert_axis(Axis(0)),
            )?;
            grad_outputs[index] =
                std::mem::replace(&mut grad, upstream.index_axis_move(Axis(0), 0));
        }
        debug!(layers = self.layers.len(), params = self.grads.len(), "host backward done");
        Ok(grad_outputs)
    }

    /// Ordinary gradient of the last backward pass.
    pub fn grad(&self, id: ParamId) -> Option<&Tensor> {
        self.grads.get(&id)
    }

    pub fn param_ids(&self) -> Vec<ParamId> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(index, layer)| layer.param_ids(index))
            .collect()
    }

    pub fn param(&self, id: ParamId) -> Option<Tensor> {
        self.layers.get(id.layer)?.param(id.sibling, id.kind)
    }

    pub fn set_param(&mut self, id: ParamId, value: &Tensor) -> Result<()> {
        self.layers
            .get_mut(id.layer)
            .ok_or_else(|| BackpropError::shape(format!("no layer {}", id.layer)))?
            .set_param(id.sibling, id.kind, value)
    }
}
