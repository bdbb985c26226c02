//! Rust Extended Backpropagation Library
//!
//! This library extends the ordinary backward pass of a layered network so that, in the
//! same traversal, it also produces per-example gradients, second moments of gradients,
//! diagonal Hessians and Hessian-backpropagation curvature blocks.
//!
//! # Modules
//!
//! - `layers`: Derivative contracts and layer implementations (Dense, Conv2D, Parallel, etc.)
//! - `loss`: Loss modules and their Hessian factorizations
//! - `strategies`: Closed strategy registries selecting the curvature approximation
//! - `curvature`: Signed square-root factors and curvature representations
//! - `extensions`: Per-parameter quantities computed during the backward hook
//! - `context`: Per-traversal state carried between layers
//! - `engine`: The extended backward pass
//! - `artifacts`: Results attached to parameters
//! - `model`: Sequential host network with the ordinary backward pass
//! - `config`: Extension configuration structures
//! - `architecture`: Architecture configuration and model building
//! - `utils`: Shared utilities (tensor helpers, RNG, activation functions, etc.)

pub mod architecture;
pub mod artifacts;
pub mod config;
pub mod context;
pub mod curvature;
pub mod engine;
pub mod error;
pub mod extensions;
pub mod layers;
pub mod loss;
pub mod model;
pub mod strategies;
pub mod utils;

pub use artifacts::Artifacts;
pub use curvature::{Curvature, Sign, SignedFactor};
pub use engine::ExtendedBackprop;
pub use error::{BackpropError, Result};
pub use extensions::Extension;
pub use layers::{ParamId, ParamKind};
pub use loss::{Loss, Reduction, Target};
pub use model::Sequential;
pub use strategies::{BackpropStrategy, ExpectationApproximation, LossHessianStrategy, Strategies};
