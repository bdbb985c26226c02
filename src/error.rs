//! Error taxonomy for extended backpropagation
//!
//! Every failure in this crate is either a programming/configuration error or a
//! genuine mathematical singularity. None of them are retried.

use thiserror::Error;

/// Errors raised by strategies, layers, losses, the engine and the configuration layer.
#[derive(Debug, Error)]
pub enum BackpropError {
    /// A strategy label outside its closed set of choices.
    #[error("unknown {kind} strategy: '{label}'. Expecting one of {choices:?}")]
    UnknownStrategy {
        kind: &'static str,
        label: String,
        choices: &'static [&'static str],
    },

    /// Arity or rank mismatch at a hook boundary or inside a Jacobian product.
    #[error("shape error: {0}")]
    ShapeError(String),

    /// The loss Hessian is not defined at the current input.
    #[error("hessian undefined: {0}")]
    HessianUndefined(String),

    /// A composite split/merge was given an inconsistent partition.
    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    /// A query was made for an artifact that the last pass did not produce.
    #[error("no {artifact} stored for parameter {param}")]
    MissingArtifact { param: String, artifact: &'static str },

    /// Configuration values that are structurally valid JSON but semantically wrong.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BackpropError {
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        BackpropError::ShapeError(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        BackpropError::Config(message.into())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BackpropError>;
