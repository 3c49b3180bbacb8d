//! Parameter initialisation
//!
//! Fillers run once, at layer setup, against the network's seeded RNG.

use crate::tensor::Tensor;
use crate::utils::rng::SimpleRng;
use serde::{Deserialize, Serialize};

/// How a freshly allocated parameter tensor is populated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filler {
    Constant { value: f32 },
    Uniform { min: f32, max: f32 },
    /// Uniform in `[-sqrt(3 / fan_in), sqrt(3 / fan_in)]`, where `fan_in`
    /// is the per-output element count (`len / batch`).
    Xavier,
    Gaussian { mean: f32, std: f32 },
}

impl Default for Filler {
    fn default() -> Self {
        Filler::Constant { value: 0.0 }
    }
}

impl Filler {
    /// Overwrite `tensor`'s values.
    pub fn fill(&self, tensor: &Tensor, rng: &mut SimpleRng) {
        let fan_in = tensor.shape().batch_size().max(1);
        let mut values = tensor.value_mut();
        match *self {
            Filler::Constant { value } => values.fill(value),
            Filler::Uniform { min, max } => {
                for v in values.iter_mut() {
                    *v = rng.gen_range_f32(min, max);
                }
            }
            Filler::Xavier => {
                let limit = (3.0f32 / fan_in as f32).sqrt();
                for v in values.iter_mut() {
                    *v = rng.gen_range_f32(-limit, limit);
                }
            }
            Filler::Gaussian { mean, std } => {
                for v in values.iter_mut() {
                    *v = mean + std * rng.next_gaussian();
                }
            }
        }
    }
}

/// Default weight filler for affine and convolution layers.
pub fn default_weight_filler() -> Filler {
    Filler::Xavier
}
