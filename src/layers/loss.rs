//! Cross-entropy loss layers
//!
//! Both layers run an internal sub-layer (softmax or sigmoid) into a private
//! tensor, write the mean loss into a `(1, 1, 1, 1)` output, and seed that
//! output's gradient with the loss weight `1.0`. Backward reads the weight
//! back from the output gradient.

use crate::error::{Error, Result};
use crate::layers::activation::ActivationLayer;
use crate::layers::softmax::SoftmaxLayer;
use crate::layers::{configure, Allocation, Layer, LayerBase, LayerIo};
use crate::tensor::{Shape, Tensor};
use crate::utils::activations::Activation;
use crate::utils::rng::SimpleRng;

const LOSS_SHAPE: Shape = Shape::new(1, 1, 1, 1);

fn loss_output(base: &LayerBase) -> Tensor {
    let loss = base.new_output(0, LOSS_SHAPE);
    loss.gradient_mut()[0] = 1.0;
    loss
}

/// Multinomial logistic loss over a softmax of input 0.
///
/// Inputs: scores `(N, C, H, W)` and labels with `N·H·W` entries holding
/// class indices as floats. Outputs: the loss and, optionally, a copy of
/// the class probabilities.
pub struct SoftmaxWithLossLayer {
    base: LayerBase,
    softmax: SoftmaxLayer,
    prob: Option<Tensor>,
}

impl SoftmaxWithLossLayer {
    pub fn new(base: LayerBase) -> Self {
        let softmax = SoftmaxLayer::new(LayerBase::new(
            format!("{}_softmax", base.name()),
            base.input_names().first().cloned(),
            [format!("{}_softmax_prob", base.name())],
        ));
        Self {
            base,
            softmax,
            prob: None,
        }
    }

    fn softmax_io<'n>(&'n self, io: &LayerIo<'n>, prob: &'n Tensor) -> LayerIo<'n> {
        LayerIo {
            inputs: vec![io.input(0)],
            outputs: vec![prob],
            params: Vec::new(),
            blas: io.blas,
        }
    }

    /// Flat index of the labelled class's probability at `(b, s)`.
    fn label_index(shape: Shape, labels: &[f32], b: usize, s: usize) -> usize {
        let spatial = shape.spatial_size();
        let class = labels[b * spatial + s] as usize;
        b * shape.batch_size() + class * spatial + s
    }
}

impl Layer for SoftmaxWithLossLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn setup(&mut self, inputs: &[&Tensor], rng: &mut SimpleRng) -> Result<Allocation> {
        self.base.check_inputs(inputs, 2)?;
        self.base.check_outputs(1..=2)?;

        let scores = inputs[0].shape();
        let labels = inputs[1].shape();
        if labels.batch != scores.batch || labels.size() != scores.batch * scores.spatial_size() {
            return Err(Error::invalid(
                self.base.name(),
                format!(
                    "labels {} do not provide one class index per position of {}",
                    labels, scores
                ),
            ));
        }

        let mut internal = configure(&mut self.softmax, &inputs[..1], rng)?;
        let prob = internal.outputs.remove(0);

        let mut outputs = vec![loss_output(&self.base)];
        if self.base.output_names().len() == 2 {
            outputs.push(self.base.new_output(1, prob.shape()));
        }
        self.prob = Some(prob);

        Ok(Allocation {
            outputs,
            params: Vec::new(),
        })
    }

    fn forward(&self, io: &LayerIo<'_>) -> f32 {
        let Some(prob) = self.prob.as_ref() else {
            return 0.0;
        };
        self.softmax.forward(&self.softmax_io(io, prob));

        let shape = prob.shape();
        let count = (shape.batch * shape.spatial_size()) as f32;
        let probs = prob.value();
        let labels = io.input(1).value();

        let mut loss = 0.0;
        for b in 0..shape.batch {
            for s in 0..shape.spatial_size() {
                let p = probs[Self::label_index(shape, &labels, b, s)];
                loss -= p.max(f32::MIN_POSITIVE).ln();
            }
        }
        let loss = loss / count;

        io.output(0).value_mut()[0] = loss;
        if let Some(out) = io.outputs.get(1) {
            out.value_mut().copy_from_slice(&probs);
        }
        loss
    }

    fn backward(&self, io: &LayerIo<'_>, _propagate_params: bool) {
        let Some(prob) = self.prob.as_ref() else {
            return;
        };
        let shape = prob.shape();
        let count = (shape.batch * shape.spatial_size()) as f32;
        let labels = io.input(1).value();
        let mut bottom_diff = io.input(0).gradient_mut();

        bottom_diff.copy_from_slice(&prob.value());
        for b in 0..shape.batch {
            for s in 0..shape.spatial_size() {
                bottom_diff[Self::label_index(shape, &labels, b, s)] -= 1.0;
            }
        }
        let weight = io.output(0).gradient()[0];
        io.blas.scal(weight / count, &mut bottom_diff);
    }
}

/// Binary cross-entropy over `sigmoid(input 0)` against targets in input 1.
///
/// Both inputs must have the same shape. The loss is summed over all
/// elements and divided by the batch count.
pub struct SigmoidCrossEntropyLossLayer {
    base: LayerBase,
    sigmoid: ActivationLayer,
    sigmoid_output: Option<Tensor>,
}

impl SigmoidCrossEntropyLossLayer {
    pub fn new(base: LayerBase) -> Self {
        let sigmoid = ActivationLayer::new(
            LayerBase::new(
                format!("{}_sigmoid", base.name()),
                base.input_names().first().cloned(),
                [format!("{}_sigmoid_top", base.name())],
            ),
            Activation::Sigmoid,
        );
        Self {
            base,
            sigmoid,
            sigmoid_output: None,
        }
    }
}

impl Layer for SigmoidCrossEntropyLossLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn setup(&mut self, inputs: &[&Tensor], rng: &mut SimpleRng) -> Result<Allocation> {
        self.base.check_arity(inputs, 2, 1)?;
        if inputs[0].shape() != inputs[1].shape() {
            return Err(Error::ShapeMismatch {
                layer: self.base.name().to_string(),
                expected: inputs[0].shape(),
                got: inputs[1].shape(),
            });
        }

        let mut internal = configure(&mut self.sigmoid, &inputs[..1], rng)?;
        self.sigmoid_output = Some(internal.outputs.remove(0));

        Ok(Allocation {
            outputs: vec![loss_output(&self.base)],
            params: Vec::new(),
        })
    }

    fn forward(&self, io: &LayerIo<'_>) -> f32 {
        let Some(sigmoid_output) = self.sigmoid_output.as_ref() else {
            return 0.0;
        };
        self.sigmoid.forward(&LayerIo {
            inputs: vec![io.input(0)],
            outputs: vec![sigmoid_output],
            params: Vec::new(),
            blas: io.blas,
        });

        let input = io.input(0).value();
        let target = io.input(1).value();
        // max(x, 0) − x·t + ln(1 + e^−|x|) never exponentiates a positive value.
        let loss: f32 = input
            .iter()
            .zip(target.iter())
            .map(|(&x, &t)| x.max(0.0) - x * t + (-x.abs()).exp().ln_1p())
            .sum();
        let loss = loss / io.input(0).shape().batch as f32;

        io.output(0).value_mut()[0] = loss;
        loss
    }

    fn backward(&self, io: &LayerIo<'_>, _propagate_params: bool) {
        let Some(sigmoid_output) = self.sigmoid_output.as_ref() else {
            return;
        };
        let probs = sigmoid_output.value();
        let target = io.input(1).value();
        let mut bottom_diff = io.input(0).gradient_mut();

        for (d, (&p, &t)) in bottom_diff.iter_mut().zip(probs.iter().zip(target.iter())) {
            *d = p - t;
        }
        let weight = io.output(0).gradient()[0];
        let batch = io.input(0).shape().batch as f32;
        io.blas.scal(weight / batch, &mut bottom_diff);
    }
}
