//! Strategy registry
//!
//! Closed enumerations selecting how loss-level curvature is represented and how it is
//! propagated through the network. Each enumeration parses from a fixed set of string
//! labels; anything else is rejected with [`BackpropError::UnknownStrategy`] before any
//! traversal starts.

use crate::error::{BackpropError, Result};
use std::fmt;
use std::str::FromStr;

/// How the Hessian of the loss with respect to the network output is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossHessianStrategy {
    /// Exact per-example square-root factorization.
    Exact,
    /// Monte-Carlo approximation drawn from the loss's output distribution.
    Sampling,
    /// Batch-averaged Hessian shared by every example.
    Average,
}

impl LossHessianStrategy {
    pub const EXACT: &'static str = "exact";
    pub const SAMPLING: &'static str = "sampling";
    pub const AVERAGE: &'static str = "average";
    pub const CHOICES: &'static [&'static str] = &[Self::EXACT, Self::SAMPLING, Self::AVERAGE];

    /// Validate a label without keeping the parsed value.
    pub fn check_exists(label: &str) -> Result<()> {
        label.parse::<Self>().map(|_| ())
    }

    pub fn label(&self) -> &'static str {
        match self {
            LossHessianStrategy::Exact => Self::EXACT,
            LossHessianStrategy::Sampling => Self::SAMPLING,
            LossHessianStrategy::Average => Self::AVERAGE,
        }
    }
}

impl FromStr for LossHessianStrategy {
    type Err = BackpropError;

    fn from_str(label: &str) -> Result<Self> {
        match label {
            Self::EXACT => Ok(LossHessianStrategy::Exact),
            Self::SAMPLING => Ok(LossHessianStrategy::Sampling),
            Self::AVERAGE => Ok(LossHessianStrategy::Average),
            _ => Err(BackpropError::UnknownStrategy {
                kind: "loss Hessian",
                label: label.to_string(),
                choices: Self::CHOICES,
            }),
        }
    }
}

/// How curvature travels from the loss toward the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackpropStrategy {
    /// Per-example symmetric square-root factors.
    Sqrt,
    /// A single batch-averaged matrix.
    BatchAverage,
}

impl BackpropStrategy {
    pub const SQRT: &'static str = "sqrt";
    pub const BATCH_AVERAGE: &'static str = "average";
    pub const CHOICES: &'static [&'static str] = &[Self::BATCH_AVERAGE, Self::SQRT];

    pub fn check_exists(label: &str) -> Result<()> {
        label.parse::<Self>().map(|_| ())
    }

    /// Re-validates `label`, then tells whether it names the square-root variant.
    pub fn is_sqrt_label(label: &str) -> Result<bool> {
        Ok(label.parse::<Self>()?.is_sqrt())
    }

    /// Re-validates `label`, then tells whether it names the batch-averaged variant.
    pub fn is_batch_average_label(label: &str) -> Result<bool> {
        Ok(label.parse::<Self>()?.is_batch_average())
    }

    pub fn is_sqrt(&self) -> bool {
        matches!(self, BackpropStrategy::Sqrt)
    }

    pub fn is_batch_average(&self) -> bool {
        matches!(self, BackpropStrategy::BatchAverage)
    }

    pub fn label(&self) -> &'static str {
        match self {
            BackpropStrategy::Sqrt => Self::SQRT,
            BackpropStrategy::BatchAverage => Self::BATCH_AVERAGE,
        }
    }
}

impl FromStr for BackpropStrategy {
    type Err = BackpropError;

    fn from_str(label: &str) -> Result<Self> {
        match label {
            Self::SQRT => Ok(BackpropStrategy::Sqrt),
            Self::BATCH_AVERAGE => Ok(BackpropStrategy::BatchAverage),
            _ => Err(BackpropError::UnknownStrategy {
                kind: "backpropagation",
                label: label.to_string(),
                choices: Self::CHOICES,
            }),
        }
    }
}

/// Approximation of the expectation over the batch used by batch-averaged propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectationApproximation {
    /// `E[Jᵀ E(H) J]`: the factored second moment.
    BotevMartens,
    /// `E(Jᵀ) E(H) E(J)`: the product of expectations.
    Chen,
}

impl ExpectationApproximation {
    pub const BOTEV_MARTENS: &'static str = "E[J^T E(H) J]";
    pub const CHEN: &'static str = "E(J^T) E(H) E(J)";
    pub const CHOICES: &'static [&'static str] = &[Self::BOTEV_MARTENS, Self::CHEN];

    pub fn check_exists(label: &str) -> Result<()> {
        label.parse::<Self>().map(|_| ())
    }

    /// Re-validates `label`, then tells whether parameter Jacobians are averaged
    /// over the batch before use.
    pub fn should_average_param_jac_label(label: &str) -> Result<bool> {
        Ok(label.parse::<Self>()?.should_average_param_jac())
    }

    pub fn should_average_param_jac(&self) -> bool {
        matches!(self, ExpectationApproximation::Chen)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExpectationApproximation::BotevMartens => Self::BOTEV_MARTENS,
            ExpectationApproximation::Chen => Self::CHEN,
        }
    }
}

impl FromStr for ExpectationApproximation {
    type Err = BackpropError;

    fn from_str(label: &str) -> Result<Self> {
        match label {
            Self::BOTEV_MARTENS => Ok(ExpectationApproximation::BotevMartens),
            Self::CHEN => Ok(ExpectationApproximation::Chen),
            _ => Err(BackpropError::UnknownStrategy {
                kind: "expectation approximation",
                label: label.to_string(),
                choices: Self::CHOICES,
            }),
        }
    }
}

macro_rules! display_label {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        })*
    };
}

display_label!(LossHessianStrategy, BackpropStrategy, ExpectationApproximation);

/// The full set of strategy choices for one extended backward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Strategies {
    pub loss_hessian: LossHessianStrategy,
    pub backprop: BackpropStrategy,
    pub expectation: ExpectationApproximation,
    /// Number of Monte-Carlo samples for [`LossHessianStrategy::Sampling`].
    pub mc_samples: usize,
}

impl Default for Strategies {
    fn default() -> Self {
        Self {
            loss_hessian: LossHessianStrategy::Exact,
            backprop: BackpropStrategy::Sqrt,
            expectation: ExpectationApproximation::BotevMartens,
            mc_samples: 1,
        }
    }
}

impl Strategies {
    /// Parse all three labels, failing on the first unknown one.
    pub fn from_labels(loss_hessian: &str, backprop: &str, expectation: &str) -> Result<Self> {
        Ok(Self {
            loss_hessian: loss_hessian.parse()?,
            backprop: backprop.parse()?,
            expectation: expectation.parse()?,
            ..Self::default()
        })
    }

    pub fn with_mc_samples(mut self, mc_samples: usize) -> Self {
        self.mc_samples = mc_samples;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates_are_exclusive() {
        for label in BackpropStrategy::CHOICES {
            let sqrt = BackpropStrategy::is_sqrt_label(label).unwrap();
            let avg = BackpropStrategy::is_batch_average_label(label).unwrap();
            assert!(sqrt ^ avg);
        }
    }

    #[test]
    fn test_unknown_label_fails_closed() {
        assert!(matches!(
            BackpropStrategy::is_sqrt_label("cholesky"),
            Err(BackpropError::UnknownStrategy { .. })
        ));
        assert!(ExpectationApproximation::should_average_param_jac_label("E[J]").is_err());
        assert!(LossHessianStrategy::check_exists("EXACT").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let ea = ExpectationApproximation::Chen;
        assert_eq!(ea.to_string().parse::<ExpectationApproximation>().unwrap(), ea);
    }
}
