//! Shared utilities for layers, losses and the extension engine
//!
//! This module provides the tensor alias and reshaping helpers, random number
//! generation, activation functions and the convolution patch-extraction operator.

pub mod activations;
pub mod rng;
pub mod tensor;
pub mod unfold;

pub use rng::SimpleRng;
pub use tensor::Tensor;
