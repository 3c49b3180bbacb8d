//! Elementwise activation layer

use crate::error::Result;
use crate::layers::{Allocation, Layer, LayerBase, LayerIo};
use crate::tensor::Tensor;
use crate::utils::activations::Activation;
use crate::utils::rng::SimpleRng;

/// Applies one [`Activation`] to every element; output shape equals input
/// shape.
pub struct ActivationLayer {
    base: LayerBase,
    activation: Activation,
}

impl ActivationLayer {
    pub fn new(base: LayerBase, activation: Activation) -> Self {
        Self { base, activation }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Layer for ActivationLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn setup(&mut self, inputs: &[&Tensor], _rng: &mut SimpleRng) -> Result<Allocation> {
        self.base.check_arity(inputs, 1, 1)?;
        Ok(Allocation {
            outputs: vec![self.base.new_output(0, inputs[0].shape())],
            params: Vec::new(),
        })
    }

    fn forward(&self, io: &LayerIo<'_>) -> f32 {
        let bottom = io.input(0).value();
        let mut top = io.output(0).value_mut();
        for (y, &x) in top.iter_mut().zip(bottom.iter()) {
            *y = self.activation.eval(x);
        }
        0.0
    }

    fn backward(&self, io: &LayerIo<'_>, _propagate_params: bool) {
        let bottom = io.input(0).value();
        let top = io.output(0).value();
        let top_diff = io.output(0).gradient();
        let mut bottom_diff = io.input(0).gradient_mut();

        for (i, d) in bottom_diff.iter_mut().enumerate() {
            *d = top_diff[i] * self.activation.first_derivative(bottom[i], top[i]);
        }
    }
}
