//! Architecture configuration structures
//!
//! This module provides configuration structures for defining sequential networks and
//! their loss via JSON configuration files, so the extension engine can be pointed at
//! different models without code changes.

use crate::error::{BackpropError, Result};
use crate::layers::{
    ActivationLayer, Conv2DLayer, DenseLayer, FlattenLayer, Layer, Parallel,
};
use crate::loss::{Loss, Reduction};
use crate::model::Sequential;
use crate::utils::rng::SimpleRng;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Configuration for a single layer in the network.
///
/// Defines the layer type and its parameters. Different layer types require different fields:
///
/// - **linear**: Requires `input_size` and `output_size`, optional `bias` (default true)
/// - **conv2d**: Requires `in_channels`, `out_channels`, `kernel_size`, `input_height`,
///   `input_width`, and optional `padding` (default 0), `stride` (default 1),
///   `dilation` (default 1), `bias` (default true), `save_memory` (default false)
/// - **parallel_linear**: Requires `input_size` and `out_features_list`
/// - **parallel_conv2d**: Like conv2d, with `out_features_list` instead of `out_channels`
/// - **relu**, **sigmoid**, **tanh**, **flatten**: No parameters
///
/// # Examples
///
/// ```json
/// {
///   "layer_type": "linear",
///   "input_size": 784,
///   "output_size": 512
/// }
/// ```
///
/// ```json
/// {
///   "layer_type": "conv2d",
///   "in_channels": 1,
///   "out_channels": 8,
///   "kernel_size": 3,
///   "padding": 1,
///   "stride": 1,
///   "input_height": 28,
///   "input_width": 28,
///   "save_memory": true
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct LayerConfig {
    /// Type of layer: "linear", "conv2d", "parallel_linear", "parallel_conv2d",
    /// "relu", "sigmoid", "tanh" or "flatten"
    pub layer_type: String,

    // Linear layer parameters
    /// Input size for linear layers
    pub input_size: Option<usize>,
    /// Output size for linear layers
    pub output_size: Option<usize>,
    /// Whether the layer owns a bias (default: true)
    pub bias: Option<bool>,

    // Conv2D layer parameters
    /// Number of input channels for Conv2D layer
    pub in_channels: Option<usize>,
    /// Number of output channels (filters) for Conv2D layer
    pub out_channels: Option<usize>,
    /// Kernel size for Conv2D layer (assumes square kernel)
    pub kernel_size: Option<usize>,
    /// Zero-padding for Conv2D layer (default: 0)
    pub padding: Option<usize>,
    /// Stride for Conv2D layer (default: 1)
    pub stride: Option<usize>,
    /// Dilation for Conv2D layer (default: 1)
    pub dilation: Option<usize>,
    /// Input height for Conv2D layer
    pub input_height: Option<usize>,
    /// Input width for Conv2D layer
    pub input_width: Option<usize>,
    /// Weight Jacobian-transpose products without the unfolded input (default: false)
    pub save_memory: Option<bool>,

    // Parallel composite parameters
    /// Output features (or channels) of every sibling
    pub out_features_list: Option<Vec<usize>>,
}

/// Loss closing the network.
#[derive(Debug, Clone, Deserialize)]
pub struct LossConfig {
    /// "mse" or "cross_entropy"
    pub loss_type: String,
    /// "mean" (default), "sum" or "none"
    #[serde(default)]
    pub reduction: Reduction,
}

/// Configuration for the entire network.
///
/// Contains a sequence of layer configurations that define the network structure and
/// the loss. Layers are applied in the order they appear in the configuration.
///
/// # Example
///
/// ```json
/// {
///   "layers": [
///     { "layer_type": "linear", "input_size": 4, "output_size": 6 },
///     { "layer_type": "sigmoid" },
///     { "layer_type": "linear", "input_size": 6, "output_size": 3 }
///   ],
///   "loss": { "loss_type": "cross_entropy", "reduction": "mean" }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ArchitectureConfig {
    /// Sequence of layer configurations defining the network structure
    pub layers: Vec<LayerConfig>,
    pub loss: LossConfig,
}

/// Loads an architecture configuration from a JSON file.
///
/// Reads the file at `path` and deserializes its JSON contents into an `ArchitectureConfig`.
/// Performs validation on the configuration structure and the layer connections.
///
/// # Examples
///
/// ```no_run
/// use rust_extended_backprop::architecture::load_architecture;
///
/// let arch = load_architecture("config/architectures/mlp_sigmoid.json").unwrap();
/// assert!(!arch.layers.is_empty());
/// ```
pub fn load_architecture(path: impl AsRef<Path>) -> Result<ArchitectureConfig> {
    let contents = fs::read_to_string(path)?;
    let config: ArchitectureConfig = serde_json::from_str(&contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

fn require(value: Option<usize>, index: usize, layer: &str, field: &str) -> Result<usize> {
    match value {
        None => Err(BackpropError::config(format!(
            "Layer {}: {} layer requires '{}'",
            index, layer, field
        ))),
        Some(0) => Err(BackpropError::config(format!(
            "Layer {}: {} must be greater than 0",
            index, field
        ))),
        Some(v) => Ok(v),
    }
}

fn out_features(layer: &LayerConfig, index: usize) -> Result<&[usize]> {
    match layer.out_features_list.as_deref() {
        None => Err(BackpropError::config(format!(
            "Layer {}: {} layer requires 'out_features_list'",
            index, layer.layer_type
        ))),
        Some(list) if list.is_empty() || list.contains(&0) => Err(BackpropError::config(format!(
            "Layer {}: out_features_list must contain positive sizes",
            index
        ))),
        Some(list) => Ok(list),
    }
}

fn conv_geometry(layer: &LayerConfig, index: usize) -> Result<(usize, usize, usize, usize)> {
    let kernel_size = require(layer.kernel_size, index, "Conv2D", "kernel_size")?;
    let input_height = require(layer.input_height, index, "Conv2D", "input_height")?;
    let input_width = require(layer.input_width, index, "Conv2D", "input_width")?;
    let padding = layer.padding.unwrap_or(0);
    let stride = layer.stride.unwrap_or(1);
    let dilation = layer.dilation.unwrap_or(1);
    if stride == 0 || dilation == 0 {
        return Err(BackpropError::config(format!(
            "Layer {}: stride and dilation must be greater than 0",
            index
        )));
    }
    let span = dilation * (kernel_size - 1) + 1;
    if input_height + 2 * padding < span || input_width + 2 * padding < span {
        return Err(BackpropError::config(format!(
            "Layer {}: kernel does not fit the {}x{} input",
            index, input_height, input_width
        )));
    }
    let out_height = (input_height + 2 * padding - span) / stride + 1;
    let out_width = (input_width + 2 * padding - span) / stride + 1;
    Ok((input_height, input_width, out_height, out_width))
}

/// Gets the per-sample input shape a layer configuration expects.
///
/// `None` for layers that accept any shape.
fn get_layer_input_shape(layer: &LayerConfig, index: usize) -> Result<Option<Vec<usize>>> {
    match layer.layer_type.to_lowercase().as_str() {
        "linear" | "parallel_linear" => Ok(Some(vec![require(
            layer.input_size,
            index,
            "Linear",
            "input_size",
        )?])),
        "conv2d" | "parallel_conv2d" => {
            let in_channels = require(layer.in_channels, index, "Conv2D", "in_channels")?;
            let (h, w, _, _) = conv_geometry(layer, index)?;
            Ok(Some(vec![in_channels, h, w]))
        }
        "relu" | "sigmoid" | "tanh" | "flatten" => Ok(None),
        _ => Err(unknown_layer(layer, index)),
    }
}

/// Gets the per-sample output shape of a layer configuration given its input shape.
fn get_layer_output_shape(
    layer: &LayerConfig,
    index: usize,
    input: Option<&[usize]>,
) -> Result<Option<Vec<usize>>> {
    match layer.layer_type.to_lowercase().as_str() {
        "linear" => Ok(Some(vec![require(
            layer.output_size,
            index,
            "Linear",
            "output_size",
        )?])),
        "parallel_linear" => Ok(Some(vec![out_features(layer, index)?.iter().sum()])),
        "conv2d" => {
            let out_channels = require(layer.out_channels, index, "Conv2D", "out_channels")?;
            let (_, _, oh, ow) = conv_geometry(layer, index)?;
            Ok(Some(vec![out_channels, oh, ow]))
        }
        "parallel_conv2d" => {
            let out_channels = out_features(layer, index)?.iter().sum();
            let (_, _, oh, ow) = conv_geometry(layer, index)?;
            Ok(Some(vec![out_channels, oh, ow]))
        }
        // Activations don't change the shape
        "relu" | "sigmoid" | "tanh" => Ok(input.map(<[usize]>::to_vec)),
        "flatten" => Ok(input.map(|shape| vec![shape.iter().product()])),
        _ => Err(unknown_layer(layer, index)),
    }
}

fn unknown_layer(layer: &LayerConfig, index: usize) -> BackpropError {
    BackpropError::config(format!(
        "Layer {}: Invalid layer type '{}'. Must be one of: linear, conv2d, parallel_linear, \
         parallel_conv2d, relu, sigmoid, tanh, flatten",
        index, layer.layer_type
    ))
}

/// Validates an architecture configuration.
///
/// Checks that:
/// - Architecture has at least one layer
/// - Each layer has the required fields for its type
/// - Parameter values are within valid ranges
/// - Layer connections are valid (output shape of layer i matches input shape of layer i+1)
/// - The loss type is known
///
/// # Errors
///
/// Returns [`BackpropError::Config`] with a descriptive message if validation fails.
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<()> {
    if config.layers.is_empty() {
        return Err(BackpropError::config(
            "Architecture must have at least one layer",
        ));
    }

    let mut current: Option<Vec<usize>> = None;
    for (i, layer) in config.layers.iter().enumerate() {
        let expected = get_layer_input_shape(layer, i)?;
        if let (Some(have), Some(want)) = (&current, &expected) {
            if have != want {
                return Err(BackpropError::config(format!(
                    "Layer connection mismatch: Layer {} output shape {:?} does not match Layer {} input shape {:?}",
                    i - 1,
                    have,
                    i,
                    want
                )));
            }
        }
        let input = current.as_deref().or(expected.as_deref()).map(<[usize]>::to_vec);
        current = get_layer_output_shape(layer, i, input.as_deref())?;
    }

    match config.loss.loss_type.to_lowercase().as_str() {
        "mse" | "cross_entropy" => Ok(()),
        other => Err(BackpropError::config(format!(
            "Invalid loss type '{}'. Must be one of: mse, cross_entropy",
            other
        ))),
    }
}

/// Builds a sequential network from architecture configuration.
///
/// Each layer is initialized with the parameters from the config and uses the provided
/// RNG for weight initialization.
///
/// # Arguments
///
/// * `config` - Architecture configuration defining the layer sequence and loss
/// * `rng` - Random number generator for weight initialization
///
/// # Examples
///
/// ```no_run
/// use rust_extended_backprop::architecture::{build_model, load_architecture};
/// use rust_extended_backprop::utils::rng::SimpleRng;
///
/// let config = load_architecture("config/architectures/mlp_sigmoid.json").unwrap();
/// let mut rng = SimpleRng::new(42);
/// let model = build_model(&config, &mut rng).unwrap();
/// assert_eq!(model.len(), config.layers.len());
/// ```
pub fn build_model(config: &ArchitectureConfig, rng: &mut SimpleRng) -> Result<Sequential> {
    validate_architecture(config)?;
    let mut layers: Vec<Layer> = Vec::with_capacity(config.layers.len());

    for (i, layer_config) in config.layers.iter().enumerate() {
        let bias = layer_config.bias.unwrap_or(true);
        let layer: Layer = match layer_config.layer_type.to_lowercase().as_str() {
            "linear" => DenseLayer::new(
                require(layer_config.input_size, i, "Linear", "input_size")?,
                require(layer_config.output_size, i, "Linear", "output_size")?,
                bias,
                rng,
            )
            .into(),
            "parallel_linear" => {
                let input_size = require(layer_config.input_size, i, "Linear", "input_size")?;
                let siblings = out_features(layer_config, i)?
                    .iter()
                    .map(|&out| DenseLayer::new(input_size, out, bias, rng))
                    .collect();
                Parallel::new(siblings)?.into()
            }
            "conv2d" => {
                let out_channels = require(layer_config.out_channels, i, "Conv2D", "out_channels")?;
                build_conv(layer_config, i, out_channels, rng)?.into()
            }
            "parallel_conv2d" => {
                let siblings = out_features(layer_config, i)?
                    .iter()
                    .map(|&out| build_conv(layer_config, i, out, rng))
                    .collect::<Result<Vec<_>>>()?;
                Parallel::new(siblings)?.into()
            }
            "relu" => ActivationLayer::relu().into(),
            "sigmoid" => ActivationLayer::sigmoid().into(),
            "tanh" => ActivationLayer::tanh().into(),
            "flatten" => FlattenLayer::new().into(),
            _ => return Err(unknown_layer(layer_config, i)),
        };
        layers.push(layer);
    }

    let reduction = config.loss.reduction;
    let loss = match config.loss.loss_type.to_lowercase().as_str() {
        "mse" => Loss::mse(reduction),
        _ => Loss::cross_entropy(reduction),
    };
    Ok(Sequential::new(layers, loss))
}

fn build_conv(
    layer_config: &LayerConfig,
    index: usize,
    out_channels: usize,
    rng: &mut SimpleRng,
) -> Result<Conv2DLayer> {
    let mut layer = Conv2DLayer::new(
        require(layer_config.in_channels, index, "Conv2D", "in_channels")?,
        out_channels,
        require(layer_config.kernel_size, index, "Conv2D", "kernel_size")?,
        layer_config.padding.unwrap_or(0),
        layer_config.stride.unwrap_or(1),
        layer_config.bias.unwrap_or(true),
        rng,
    )?
    .with_dilation(layer_config.dilation.unwrap_or(1))?;
    layer.set_save_memory(layer_config.save_memory.unwrap_or(false));
    Ok(layer)
}
