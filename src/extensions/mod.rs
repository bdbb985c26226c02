//! Quantities computed alongside the ordinary gradient
//!
//! Every extension runs once per parameter-owning block of every layer, after the
//! upstream curvature for that layer's output is available and before it is
//! propagated further.

pub mod diag_h;
pub mod first_order;
pub mod hbp;

use crate::curvature::SignedFactor;
use crate::error::{BackpropError, Result};
use crate::layers::{ParamBlock, ParamKind};
use crate::strategies::Strategies;
use crate::utils::tensor::Tensor;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extension {
    /// Per-example gradients.
    BatchGrad,
    /// Sum of squared per-example gradients.
    SumGradSquared,
    /// Diagonal of the Hessian.
    DiagH,
    /// Hessian blocks per parameter.
    Hbp,
}

impl Extension {
    pub const CHOICES: &'static [&'static str] =
        &["batch_grad", "sum_grad_squared", "diag_h", "hbp"];

    pub fn label(&self) -> &'static str {
        match self {
            Extension::BatchGrad => "batch_grad",
            Extension::SumGradSquared => "sum_grad_squared",
            Extension::DiagH => "diag_h",
            Extension::Hbp => "hbp",
        }
    }

    /// Whether the extension reads in-flight square-root factors.
    pub fn needs_sqrt_factors(&self, strategies: &Strategies) -> bool {
        match self {
            Extension::DiagH => true,
            Extension::Hbp => strategies.backprop.is_sqrt(),
            _ => false,
        }
    }

    /// Whether the extension reads the in-flight batch-averaged matrix.
    pub fn needs_batch_hessian(&self, strategies: &Strategies) -> bool {
        matches!(self, Extension::Hbp) && strategies.backprop.is_batch_average()
    }
}

impl FromStr for Extension {
    type Err = BackpropError;

    fn from_str(label: &str) -> Result<Self> {
        match label {
            "batch_grad" => Ok(Extension::BatchGrad),
            "sum_grad_squared" => Ok(Extension::SumGradSquared),
            "diag_h" => Ok(Extension::DiagH),
            "hbp" => Ok(Extension::Hbp),
            _ => Err(BackpropError::UnknownStrategy {
                kind: "extension",
                label: label.to_string(),
                choices: Self::CHOICES,
            }),
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything an extension sees for one parameter of one layer.
pub struct LayerStep<'s, 'a> {
    pub block: &'s ParamBlock<'a>,
    pub kind: ParamKind,
    pub input: &'s Tensor,
    /// This block's part of the layer output `[N, *out]`.
    pub output: &'s Tensor,
    /// This block's part of the output gradient `[N, *out]`.
    pub grad_output: &'s Tensor,
    /// This block's part of the in-flight factors `[V, N, *out]`.
    pub sqrt_factors: &'s [SignedFactor],
    /// This block's diagonal part of the in-flight batch-averaged matrix.
    pub batch_hessian: Option<&'s Array2<f64>>,
    pub strategies: &'s Strategies,
}
