//! Elementwise activation functions
//!
//! The activation layer shares one shape/IO implementation across every
//! kind, so the kinds are a closed enum rather than separate layer types.
//! Derivatives of sigmoid, tanh and softsign are expressed through the
//! output `y = f(x)`; leaky ReLU is keyed on the sign of the input.

use serde::{Deserialize, Serialize};

/// Activation kind with its first and second derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activation {
    Identity,
    Sigmoid,
    Tanh,
    Softsign,
    /// `x` for positive inputs, `negative_slope · x` otherwise. A slope of 0
    /// is a plain ReLU.
    LeakyRelu {
        #[serde(default)]
        negative_slope: f32,
    },
}

impl Activation {
    /// `f(x)`
    pub fn eval(&self, x: f32) -> f32 {
        match *self {
            Activation::Identity => x,
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Softsign => x / (1.0 + x.abs()),
            Activation::LeakyRelu { negative_slope } => {
                if x > 0.0 {
                    x
                } else {
                    negative_slope * x
                }
            }
        }
    }

    /// `f'(x)`, given both the input `x` and the output `y = f(x)`.
    pub fn first_derivative(&self, x: f32, y: f32) -> f32 {
        match *self {
            Activation::Identity => 1.0,
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Tanh => 1.0 - y * y,
            Activation::Softsign => {
                let d = 1.0 - y.abs();
                d * d
            }
            Activation::LeakyRelu { negative_slope } => {
                if x > 0.0 {
                    1.0
                } else {
                    negative_slope
                }
            }
        }
    }

    /// `f''(x)`, given both the input `x` and the output `y = f(x)`.
    pub fn second_derivative(&self, x: f32, y: f32) -> f32 {
        match *self {
            Activation::Identity | Activation::LeakyRelu { .. } => 0.0,
            Activation::Sigmoid => self.first_derivative(x, y) * (1.0 - 2.0 * y),
            Activation::Tanh => -2.0 * y * (1.0 - y * y),
            Activation::Softsign => -2.0 * y.signum() * (1.0 - y.abs()).powi(3),
        }
    }
}

/// Logistic sigmoid, 1 / (1 + exp(-x)).
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
