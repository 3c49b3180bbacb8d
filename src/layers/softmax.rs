//! Softmax normalisation across the channel axis
//!
//! Each spatial position of each sample is normalised independently:
//! subtract the channel maximum, exponentiate, divide by the channel sum.

use crate::blas::{block, block_mut, Transpose};
use crate::error::Result;
use crate::layers::{Allocation, Layer, LayerBase, LayerIo};
use crate::tensor::{Shape, Tensor};
use crate::utils::rng::SimpleRng;
use std::cell::RefCell;

pub struct SoftmaxLayer {
    base: LayerBase,
    shape: Shape,
    // Ones over the channel axis, used to broadcast per-position scalars.
    sum_multiplier: Vec<f32>,
    // Per-position max during forward, per-position dot during backward.
    scale: RefCell<Vec<f32>>,
}

impl SoftmaxLayer {
    pub fn new(base: LayerBase) -> Self {
        Self {
            base,
            shape: Shape::default(),
            sum_multiplier: Vec::new(),
            scale: RefCell::new(Vec::new()),
        }
    }
}

impl Layer for SoftmaxLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn setup(&mut self, inputs: &[&Tensor], _rng: &mut SimpleRng) -> Result<Allocation> {
        self.base.check_arity(inputs, 1, 1)?;

        self.shape = inputs[0].shape();
        self.sum_multiplier = vec![1.0; self.shape.channel];
        *self.scale.get_mut() = vec![0.0; self.shape.spatial_size()];

        Ok(Allocation {
            outputs: vec![self.base.new_output(0, self.shape)],
            params: Vec::new(),
        })
    }

    fn forward(&self, io: &LayerIo<'_>) -> f32 {
        let channels = self.shape.channel;
        let spatial = self.shape.spatial_size();
        let sample = self.shape.batch_size();

        let bottom = io.input(0).value();
        let mut top = io.output(0).value_mut();
        let mut scale = self.scale.borrow_mut();
        top.copy_from_slice(&bottom);

        for b in 0..self.shape.batch {
            let bottom_slice = block(&bottom, b, sample);
            let top_slice = block_mut(&mut top, b, sample);

            scale.copy_from_slice(&bottom_slice[..spatial]);
            for c in 1..channels {
                for (max, &v) in scale.iter_mut().zip(block(bottom_slice, c, spatial)) {
                    *max = max.max(v);
                }
            }

            // top -= ones(channels) · maxᵀ
            io.blas.gemm(
                Transpose::No,
                Transpose::No,
                channels,
                spatial,
                1,
                -1.0,
                &self.sum_multiplier,
                &scale,
                1.0,
                top_slice,
            );
            for v in top_slice.iter_mut() {
                *v = v.exp();
            }

            // Per-position channel sum.
            io.blas.gemv(
                Transpose::Yes,
                channels,
                spatial,
                1.0,
                top_slice,
                &self.sum_multiplier,
                0.0,
                &mut scale,
            );
            for c in 0..channels {
                for (v, &sum) in block_mut(top_slice, c, spatial).iter_mut().zip(scale.iter()) {
                    *v /= sum;
                }
            }
        }
        0.0
    }

    fn backward(&self, io: &LayerIo<'_>, _propagate_params: bool) {
        let channels = self.shape.channel;
        let spatial = self.shape.spatial_size();
        let sample = self.shape.batch_size();

        let top = io.output(0).value();
        let top_diff = io.output(0).gradient();
        let mut bottom_diff = io.input(0).gradient_mut();
        let mut scale = self.scale.borrow_mut();
        bottom_diff.copy_from_slice(&top_diff);

        for b in 0..self.shape.batch {
            let diff_slice = block_mut(&mut bottom_diff, b, sample);
            let top_slice = block(&top, b, sample);

            // Σ_c gradOut·out at every position.
            for (s, dot) in scale.iter_mut().enumerate() {
                *dot = io
                    .blas
                    .dot(channels, &diff_slice[s..], spatial, &top_slice[s..], spatial);
            }
            io.blas.gemm(
                Transpose::No,
                Transpose::No,
                channels,
                spatial,
                1,
                -1.0,
                &self.sum_multiplier,
                &scale,
                1.0,
                diff_slice,
            );
        }

        for (d, &y) in bottom_diff.iter_mut().zip(top.iter()) {
            *d *= y;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blas::NaiveBlas;
    use crate::layers::configure;

    #[test]
    fn test_uniform_input_gives_uniform_output() {
        let bottom = Tensor::from_values("x", Shape::new(1, 4, 1, 1), vec![3.0; 4]);
        let mut layer = SoftmaxLayer::new(LayerBase::new("sm", ["x"], ["p"]));
        let allocation = configure(&mut layer, &[&bottom], &mut SimpleRng::new(1)).unwrap();
        let io = LayerIo {
            inputs: vec![&bottom],
            outputs: vec![&allocation.outputs[0]],
            params: Vec::new(),
            blas: &NaiveBlas,
        };
        layer.forward(&io);
        for &p in allocation.outputs[0].value().iter() {
            assert!((p - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_large_inputs_stay_finite() {
        let bottom = Tensor::from_values("x", Shape::new(1, 3, 1, 1), vec![1000.0, 1001.0, 1002.0]);
        let mut layer = SoftmaxLayer::new(LayerBase::new("sm", ["x"], ["p"]));
        let allocation = configure(&mut layer, &[&bottom], &mut SimpleRng::new(1)).unwrap();
        let io = LayerIo {
            inputs: vec![&bottom],
            outputs: vec![&allocation.outputs[0]],
            params: Vec::new(),
            blas: &NaiveBlas,
        };
        layer.forward(&io);
        let out = allocation.outputs[0].value();
        assert!(out.iter().all(|p| p.is_finite()));
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_channel_sums_at_every_position() {
        let shape = Shape::new(2, 5, 3, 4);
        let mut rng = SimpleRng::new(9);
        let values = (0..shape.size())
            .map(|_| rng.gen_range_f32(-80.0, 80.0))
            .collect();
        let bottom = Tensor::from_values("x", shape, values);
        let mut layer = SoftmaxLayer::new(LayerBase::new("sm", ["x"], ["p"]));
        let allocation = configure(&mut layer, &[&bottom], &mut SimpleRng::new(1)).unwrap();
        let top = &allocation.outputs[0];
        let io = LayerIo {
            inputs: vec![&bottom],
            outputs: vec![top],
            params: Vec::new(),
            blas: &NaiveBlas,
        };
        layer.forward(&io);

        for b in 0..shape.batch {
            for h in 0..shape.height {
                for w in 0..shape.width {
                    let sum: f32 = (0..shape.channel).map(|c| top.value_at(b, c, h, w)).sum();
                    assert!((sum - 1.0).abs() < 1e-5, "sum {} at ({}, {}, {})", sum, b, h, w);
                }
            }
        }
    }
}
