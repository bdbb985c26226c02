//! Configuration structures for extended backpropagation
//!
//! This module provides the JSON configuration of one extended backward pass: which
//! extensions run, the three strategy choices, the Monte-Carlo sample count and the
//! seed of the sampling RNG.

use crate::error::{BackpropError, Result};
use crate::extensions::Extension;
use crate::strategies::{
    BackpropStrategy, ExpectationApproximation, LossHessianStrategy, Strategies,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Configuration for an extended backward pass.
///
/// Strategy fields hold the textual labels of the strategy registry; they are checked
/// against the closed sets of choices when the file is loaded.
///
/// - **loss_hessian_strategy**: `"exact"`, `"sampling"` or `"average"`
/// - **backprop_strategy**: `"sqrt"` or `"average"`
/// - **ea_strategy**: `"E[J^T E(H) J]"` or `"E(J^T) E(H) E(J)"`
///
/// # Example
///
/// ```json
/// {
///   "extensions": ["batch_grad", "diag_h"],
///   "loss_hessian_strategy": "sampling",
///   "backprop_strategy": "sqrt",
///   "ea_strategy": "E[J^T E(H) J]",
///   "mc_samples": 8,
///   "seed": 42
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionConfig {
    /// Extension labels: "batch_grad", "sum_grad_squared", "diag_h", "hbp"
    #[serde(default)]
    pub extensions: Vec<String>,

    #[serde(default = "default_loss_hessian")]
    pub loss_hessian_strategy: String,

    #[serde(default = "default_backprop")]
    pub backprop_strategy: String,

    #[serde(default = "default_ea")]
    pub ea_strategy: String,

    /// Monte-Carlo samples for the "sampling" loss Hessian strategy (default 1)
    #[serde(default = "default_mc_samples")]
    pub mc_samples: usize,

    /// Seed of the sampling RNG (default 42)
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_loss_hessian() -> String {
    LossHessianStrategy::Exact.label().to_string()
}

fn default_backprop() -> String {
    BackpropStrategy::Sqrt.label().to_string()
}

fn default_ea() -> String {
    ExpectationApproximation::BotevMartens.label().to_string()
}

fn default_mc_samples() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

/// Parsed, validated settings consumed by [`crate::engine::ExtendedBackprop`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionSettings {
    pub extensions: Vec<Extension>,
    pub strategies: Strategies,
    pub seed: u64,
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            strategies: Strategies::default(),
            seed: default_seed(),
        }
    }
}

impl ExtensionConfig {
    /// Resolve labels into typed settings.
    ///
    /// Fails with [`BackpropError::UnknownStrategy`] on the first unknown label.
    pub fn settings(&self) -> Result<ExtensionSettings> {
        let extensions = self
            .extensions
            .iter()
            .map(|label| label.parse())
            .collect::<Result<Vec<Extension>>>()?;
        let strategies = Strategies::from_labels(
            &self.loss_hessian_strategy,
            &self.backprop_strategy,
            &self.ea_strategy,
        )?
        .with_mc_samples(self.mc_samples);
        Ok(ExtensionSettings {
            extensions,
            strategies,
            seed: self.seed,
        })
    }
}

/// Loads an extension configuration from a JSON file.
///
/// Reads the file at `path`, deserializes its JSON contents into an `ExtensionConfig` and
/// validates it.
///
/// # Returns
///
/// `Ok(ExtensionConfig)` on success, or an error if the file cannot be read, the JSON is
/// invalid, or a value is out of range.
///
/// # Examples
///
/// ```no_run
/// use rust_extended_backprop::config::load_config;
///
/// let cfg = load_config("config/diag_h.json").unwrap();
/// assert_eq!(cfg.backprop_strategy, "sqrt");
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<ExtensionConfig> {
    let contents = fs::read_to_string(path)?;
    let config: ExtensionConfig = serde_json::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse configuration JSON from a string and validate it.
pub fn parse_config(contents: &str) -> Result<ExtensionConfig> {
    let config: ExtensionConfig = serde_json::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &ExtensionConfig) -> Result<()> {
    LossHessianStrategy::check_exists(&config.loss_hessian_strategy)?;
    BackpropStrategy::check_exists(&config.backprop_strategy)?;
    ExpectationApproximation::check_exists(&config.ea_strategy)?;

    for label in &config.extensions {
        label.parse::<Extension>()?;
    }

    if config.mc_samples == 0 {
        return Err(BackpropError::config("mc_samples must be greater than 0"));
    }

    // sampling only makes sense when something consumes loss curvature
    let uses_curvature = config
        .extensions
        .iter()
        .any(|label| label == "diag_h" || label == "hbp");
    if config.loss_hessian_strategy == LossHessianStrategy::Sampling.label()
        && !uses_curvature
        && !config.extensions.is_empty()
    {
        tracing::warn!("loss_hessian_strategy 'sampling' has no effect without diag_h or hbp");
    }

    Ok(())
}
