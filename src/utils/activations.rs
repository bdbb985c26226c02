//! Activation functions and their first two derivatives
//!
//! Derivatives are expressed in terms of the input `x` and the output `y = f(x)`,
//! whichever is cheaper, so layers can evaluate them from their forward cache.

/// Sigmoid activation: 1 / (1 + exp(-x))
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Sigmoid derivative assuming y = sigmoid(x).
pub fn sigmoid_derivative(y: f64) -> f64 {
    y * (1.0 - y)
}

/// Second sigmoid derivative assuming y = sigmoid(x).
pub fn sigmoid_second_derivative(y: f64) -> f64 {
    y * (1.0 - y) * (1.0 - 2.0 * y)
}

/// Tanh derivative assuming y = tanh(x).
pub fn tanh_derivative(y: f64) -> f64 {
    1.0 - y * y
}

/// Second tanh derivative assuming y = tanh(x).
pub fn tanh_second_derivative(y: f64) -> f64 {
    -2.0 * y * (1.0 - y * y)
}

pub fn relu(x: f64) -> f64 {
    x.max(0.0)
}

/// ReLU derivative; zero at the kink.
pub fn relu_derivative(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Softmax of a single row with the max-subtraction trick for numerical stability.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max_value = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&v| (v - max_value).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
