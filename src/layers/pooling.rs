//! Max and average pooling

use crate::error::{Error, Result};
use crate::layers::conv2d::WindowGeometry;
use crate::layers::{Allocation, Layer, LayerBase, LayerIo};
use crate::tensor::{Shape, Tensor};
use crate::utils::rng::SimpleRng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMethod {
    Max,
    Average,
}

/// Spatial pooling over each channel plane independently.
///
/// Max pooling records the flat in-plane index of each window's winner and
/// may expose it as an optional second output (indices stored as `f32`).
/// Average pooling divides by the window area after clipping to the input.
pub struct PoolingLayer {
    base: LayerBase,
    method: PoolMethod,
    geometry: WindowGeometry,
    bottom_shape: Shape,
    top_shape: Shape,
    argmax: RefCell<Vec<usize>>,
}

impl PoolingLayer {
    pub fn new(base: LayerBase, method: PoolMethod, geometry: WindowGeometry) -> Self {
        Self {
            base,
            method,
            geometry,
            bottom_shape: Shape::default(),
            top_shape: Shape::default(),
            argmax: RefCell::new(Vec::new()),
        }
    }

    pub fn method(&self) -> PoolMethod {
        self.method
    }

    /// Pooled extent along one axis: the convolution formula, minus one when
    /// the last window would start inside the trailing padding.
    fn pooled_size(size: usize, kernel: usize, pad: usize, stride: usize) -> usize {
        let mut pooled = (size + 2 * pad - kernel) / stride + 1;
        if (pooled - 1) * stride >= size + pad {
            pooled -= 1;
        }
        pooled
    }

    /// Clipped `[h_start, h_end) × [w_start, w_end)` window for output `(ph, pw)`.
    fn window(&self, ph: usize, pw: usize) -> (usize, usize, usize, usize) {
        let g = &self.geometry;
        let h_start = (ph * g.stride_h) as isize - g.pad_h as isize;
        let w_start = (pw * g.stride_w) as isize - g.pad_w as isize;
        let h_end = (h_start + g.kernel_h as isize).min(self.bottom_shape.height as isize);
        let w_end = (w_start + g.kernel_w as isize).min(self.bottom_shape.width as isize);
        (
            h_start.max(0) as usize,
            h_end as usize,
            w_start.max(0) as usize,
            w_end as usize,
        )
    }

    fn forward_max(&self, bottom: &[f32], top: &mut [f32], argmax: &mut [usize]) {
        let in_plane = self.bottom_shape.spatial_size();
        let out_plane = self.top_shape.spatial_size();
        let width = self.bottom_shape.width;

        for plane in 0..self.bottom_shape.batch * self.bottom_shape.channel {
            let input = &bottom[plane * in_plane..(plane + 1) * in_plane];
            for ph in 0..self.top_shape.height {
                for pw in 0..self.top_shape.width {
                    let (hs, he, ws, we) = self.window(ph, pw);
                    let out = plane * out_plane + ph * self.top_shape.width + pw;
                    let mut best = f32::NEG_INFINITY;
                    let mut best_index = hs * width + ws;
                    for h in hs..he {
                        for w in ws..we {
                            let index = h * width + w;
                            if input[index] > best {
                                best = input[index];
                                best_index = index;
                            }
                        }
                    }
                    top[out] = best;
                    argmax[out] = best_index;
                }
            }
        }
    }

    fn forward_average(&self, bottom: &[f32], top: &mut [f32]) {
        let in_plane = self.bottom_shape.spatial_size();
        let out_plane = self.top_shape.spatial_size();
        let width = self.bottom_shape.width;

        for plane in 0..self.bottom_shape.batch * self.bottom_shape.channel {
            let input = &bottom[plane * in_plane..(plane + 1) * in_plane];
            for ph in 0..self.top_shape.height {
                for pw in 0..self.top_shape.width {
                    let (hs, he, ws, we) = self.window(ph, pw);
                    let mut sum = 0.0;
                    for h in hs..he {
                        sum += input[h * width + ws..h * width + we].iter().sum::<f32>();
                    }
                    let area = ((he - hs) * (we - ws)) as f32;
                    top[plane * out_plane + ph * self.top_shape.width + pw] = sum / area;
                }
            }
        }
    }

    fn backward_average(&self, top_diff: &[f32], bottom_diff: &mut [f32]) {
        let in_plane = self.bottom_shape.spatial_size();
        let out_plane = self.top_shape.spatial_size();
        let width = self.bottom_shape.width;

        for plane in 0..self.bottom_shape.batch * self.bottom_shape.channel {
            let input_diff = &mut bottom_diff[plane * in_plane..(plane + 1) * in_plane];
            for ph in 0..self.top_shape.height {
                for pw in 0..self.top_shape.width {
                    let (hs, he, ws, we) = self.window(ph, pw);
                    let area = ((he - hs) * (we - ws)) as f32;
                    let share =
                        top_diff[plane * out_plane + ph * self.top_shape.width + pw] / area;
                    for h in hs..he {
                        for d in &mut input_diff[h * width + ws..h * width + we] {
                            *d += share;
                        }
                    }
                }
            }
        }
    }
}

impl Layer for PoolingLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn setup(&mut self, inputs: &[&Tensor], _rng: &mut SimpleRng) -> Result<Allocation> {
        let name = self.base.name().to_string();
        self.base.check_inputs(inputs, 1)?;
        match self.method {
            PoolMethod::Max => self.base.check_outputs(1..=2)?,
            PoolMethod::Average => self.base.check_outputs(1..=1)?,
        }
        self.geometry.validate(&name)?;
        let g = self.geometry;
        if g.pad_h >= g.kernel_h || g.pad_w >= g.kernel_w {
            return Err(Error::invalid(&name, "padding must be smaller than the kernel"));
        }

        let bottom = inputs[0].shape();
        if bottom.height + 2 * g.pad_h < g.kernel_h || bottom.width + 2 * g.pad_w < g.kernel_w {
            return Err(Error::invalid(
                &name,
                format!("kernel does not fit padded input {}", bottom),
            ));
        }
        let top = Shape::new(
            bottom.batch,
            bottom.channel,
            Self::pooled_size(bottom.height, g.kernel_h, g.pad_h, g.stride_h),
            Self::pooled_size(bottom.width, g.kernel_w, g.pad_w, g.stride_w),
        );
        self.bottom_shape = bottom;
        self.top_shape = top;
        if self.method == PoolMethod::Max {
            *self.argmax.get_mut() = vec![0; top.size()];
        }

        let outputs = (0..self.base.output_names().len())
            .map(|i| self.base.new_output(i, top))
            .collect();
        Ok(Allocation {
            outputs,
            params: Vec::new(),
        })
    }

    fn forward(&self, io: &LayerIo<'_>) -> f32 {
        let bottom = io.input(0).value();
        let mut top = io.output(0).value_mut();

        match self.method {
            PoolMethod::Max => {
                let mut argmax = self.argmax.borrow_mut();
                self.forward_max(&bottom, &mut top, &mut argmax);
                if let Some(mask) = io.outputs.get(1) {
                    for (m, &index) in mask.value_mut().iter_mut().zip(argmax.iter()) {
                        *m = index as f32;
                    }
                }
            }
            PoolMethod::Average => self.forward_average(&bottom, &mut top),
        }
        0.0
    }

    fn backward(&self, io: &LayerIo<'_>, _propagate_params: bool) {
        let top_diff = io.output(0).gradient();
        let mut bottom_diff = io.input(0).gradient_mut();
        bottom_diff.fill(0.0);

        match self.method {
            PoolMethod::Max => {
                let argmax = self.argmax.borrow();
                let in_plane = self.bottom_shape.spatial_size();
                let out_plane = self.top_shape.spatial_size();
                for (out, (&diff, &index)) in top_diff.iter().zip(argmax.iter()).enumerate() {
                    bottom_diff[(out / out_plane) * in_plane + index] += diff;
                }
            }
            PoolMethod::Average => self.backward_average(&top_diff, &mut bottom_diff),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blas::NaiveBlas;
    use crate::layers::configure;

    fn run(layer: &PoolingLayer, bottom: &Tensor, outputs: &[Tensor]) {
        let io = LayerIo {
            inputs: vec![bottom],
            outputs: outputs.iter().collect(),
            params: Vec::new(),
            blas: &NaiveBlas,
        };
        layer.forward(&io);
        outputs[0].gradient_mut().fill(1.0);
        layer.backward(&io, true);
    }

    #[test]
    fn test_pooled_size() {
        assert_eq!(PoolingLayer::pooled_size(24, 2, 0, 2), 12);
        assert_eq!(PoolingLayer::pooled_size(5, 2, 1, 2), 3);
        assert_eq!(PoolingLayer::pooled_size(5, 3, 1, 3), 2);
    }

    #[test]
    fn test_max_pool_routes_gradient_to_winner() {
        let bottom = Tensor::from_values(
            "x",
            Shape::new(1, 1, 2, 4),
            vec![1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 8.0, 7.0],
        );
        let mut layer = PoolingLayer::new(
            LayerBase::new("pool", ["x"], ["y", "mask"]),
            PoolMethod::Max,
            WindowGeometry::square(2).with_stride(2),
        );
        let allocation = configure(&mut layer, &[&bottom], &mut SimpleRng::new(1)).unwrap();
        run(&layer, &bottom, &allocation.outputs);

        assert_eq!(&*allocation.outputs[0].value(), &[5.0, 8.0]);
        assert_eq!(&*allocation.outputs[1].value(), &[1.0, 6.0]);
        assert_eq!(
            &*bottom.gradient(),
            &[0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_average_pool_divides_by_clipped_area() {
        let bottom = Tensor::from_values("x", Shape::new(1, 1, 2, 2), vec![1.0, 2.0, 3.0, 4.0]);
        let mut layer = PoolingLayer::new(
            LayerBase::new("pool", ["x"], ["y"]),
            PoolMethod::Average,
            WindowGeometry::square(2).with_stride(2).with_pad(1),
        );
        let allocation = configure(&mut layer, &[&bottom], &mut SimpleRng::new(1)).unwrap();
        assert_eq!(allocation.outputs[0].shape(), Shape::new(1, 1, 2, 2));
        run(&layer, &bottom, &allocation.outputs);

        // Each window covers exactly one real pixel.
        assert_eq!(&*allocation.outputs[0].value(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(&*bottom.gradient(), &[1.0; 4]);
    }

    #[test]
    fn test_average_pool_rejects_mask_output() {
        let bottom = Tensor::new("x", Shape::new(1, 1, 4, 4));
        let mut layer = PoolingLayer::new(
            LayerBase::new("pool", ["x"], ["y", "mask"]),
            PoolMethod::Average,
            WindowGeometry::square(2),
        );
        assert!(configure(&mut layer, &[&bottom], &mut SimpleRng::new(1)).is_err());
    }
}
