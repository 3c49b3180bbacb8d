//! 2D convolution via patch extraction
//!
//! Each sample is unrolled with [`im2col`] into a `(C·kh·kw) × (H'·W')`
//! column matrix, after which convolution is one matrix product per group:
//! `top_g (m × n) = W_g (m × k) · col_g (k × n)`. The backward pass runs the
//! transposed products and folds the column gradient back with [`col2im`].

use crate::blas::{block, block_mut, Transpose};
use crate::error::{Error, Result};
use crate::layers::{Allocation, Layer, LayerBase, LayerIo};
use crate::tensor::{Shape, Tensor};
use crate::utils::filler::{default_weight_filler, Filler};
use crate::utils::rng::SimpleRng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Sliding-window geometry shared by convolution and pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub kernel_h: usize,
    pub kernel_w: usize,
    #[serde(default)]
    pub pad_h: usize,
    #[serde(default)]
    pub pad_w: usize,
    #[serde(default = "default_stride")]
    pub stride_h: usize,
    #[serde(default = "default_stride")]
    pub stride_w: usize,
}

fn default_stride() -> usize {
    1
}

impl WindowGeometry {
    /// Square kernel, no padding, unit stride.
    pub fn square(kernel: usize) -> Self {
        Self {
            kernel_h: kernel,
            kernel_w: kernel,
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride_h = stride;
        self.stride_w = stride;
        self
    }

    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad_h = pad;
        self.pad_w = pad;
        self
    }

    /// `floor((size + 2·pad − kernel) / stride) + 1` along both axes, or
    /// `None` when the padded input is smaller than the kernel.
    pub fn output_size(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let padded_h = height + 2 * self.pad_h;
        let padded_w = width + 2 * self.pad_w;
        if padded_h < self.kernel_h || padded_w < self.kernel_w {
            return None;
        }
        Some((
            (padded_h - self.kernel_h) / self.stride_h + 1,
            (padded_w - self.kernel_w) / self.stride_w + 1,
        ))
    }

    pub(crate) fn validate(&self, layer: &str) -> Result<()> {
        if self.kernel_h == 0 || self.kernel_w == 0 {
            return Err(Error::invalid(layer, "kernel size must be greater than 0"));
        }
        if self.stride_h == 0 || self.stride_w == 0 {
            return Err(Error::invalid(layer, "stride must be greater than 0"));
        }
        Ok(())
    }
}

/// Unroll one `channels × height × width` image into its patch matrix.
///
/// Row `(c·kh + i)·kw + j` of `col` holds, for every output position, the
/// input pixel under kernel offset `(i, j)` of channel `c`, or zero where
/// the window reaches into the padding.
pub fn im2col(
    data: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    geometry: &WindowGeometry,
    col: &mut [f32],
) {
    let (height_col, width_col) = geometry.output_size(height, width).unwrap_or((0, 0));
    let channels_col = channels * geometry.kernel_h * geometry.kernel_w;

    for c in 0..channels_col {
        let w_offset = c % geometry.kernel_w;
        let h_offset = (c / geometry.kernel_w) % geometry.kernel_h;
        let c_im = c / geometry.kernel_h / geometry.kernel_w;
        for h in 0..height_col {
            let h_pad = (h * geometry.stride_h + h_offset) as isize - geometry.pad_h as isize;
            for w in 0..width_col {
                let w_pad = (w * geometry.stride_w + w_offset) as isize - geometry.pad_w as isize;
                col[(c * height_col + h) * width_col + w] = if h_pad >= 0
                    && (h_pad as usize) < height
                    && w_pad >= 0
                    && (w_pad as usize) < width
                {
                    data[(c_im * height + h_pad as usize) * width + w_pad as usize]
                } else {
                    0.0
                };
            }
        }
    }
}

/// Inverse of [`im2col`]: zero `data`, then scatter-add every patch entry
/// back to the pixel it was read from. Padding entries are dropped.
pub fn col2im(
    col: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    geometry: &WindowGeometry,
    data: &mut [f32],
) {
    data[..channels * height * width].fill(0.0);
    let (height_col, width_col) = geometry.output_size(height, width).unwrap_or((0, 0));
    let channels_col = channels * geometry.kernel_h * geometry.kernel_w;

    for c in 0..channels_col {
        let w_offset = c % geometry.kernel_w;
        let h_offset = (c / geometry.kernel_w) % geometry.kernel_h;
        let c_im = c / geometry.kernel_h / geometry.kernel_w;
        for h in 0..height_col {
            let h_pad = (h * geometry.stride_h + h_offset) as isize - geometry.pad_h as isize;
            if h_pad < 0 || h_pad as usize >= height {
                continue;
            }
            for w in 0..width_col {
                let w_pad = (w * geometry.stride_w + w_offset) as isize - geometry.pad_w as isize;
                if w_pad >= 0 && (w_pad as usize) < width {
                    data[(c_im * height + h_pad as usize) * width + w_pad as usize] +=
                        col[(c * height_col + h) * width_col + w];
                }
            }
        }
    }
}

/// Grouped 2D convolution with optional bias.
///
/// Every input `i` is convolved into output `i` with one shared weight set;
/// all inputs must have the same shape. Parameters, in order: weight
/// `(num_outputs, C/groups, kh, kw)` and, when enabled, bias
/// `(1, 1, 1, num_outputs)`.
pub struct ConvolutionLayer {
    base: LayerBase,
    num_outputs: usize,
    groups: usize,
    geometry: WindowGeometry,
    bias: bool,
    weight_filler: Filler,
    bias_filler: Filler,

    bottom_shape: Shape,
    // Per-group GEMM sizes: W_g is m × k, col_g is k × n.
    m: usize,
    k: usize,
    n: usize,
    bias_multiplier: Vec<f32>,
    col: RefCell<Vec<f32>>,
    col_diff: RefCell<Vec<f32>>,
}

impl ConvolutionLayer {
    pub fn new(base: LayerBase, num_outputs: usize, geometry: WindowGeometry) -> Self {
        Self {
            base,
            num_outputs,
            groups: 1,
            geometry,
            bias: true,
            weight_filler: default_weight_filler(),
            bias_filler: Filler::default(),
            bottom_shape: Shape::default(),
            m: 0,
            k: 0,
            n: 0,
            bias_multiplier: Vec::new(),
            col: RefCell::new(Vec::new()),
            col_diff: RefCell::new(Vec::new()),
        }
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_fillers(mut self, weight_filler: Filler, bias_filler: Filler) -> Self {
        self.weight_filler = weight_filler;
        self.bias_filler = bias_filler;
        self
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn geometry(&self) -> &WindowGeometry {
        &self.geometry
    }

    fn validate(&self, inputs: &[&Tensor]) -> Result<()> {
        let name = self.base.name();
        if inputs.is_empty() || self.base.input_names().len() != inputs.len() {
            return Err(Error::InputArity {
                layer: name.to_string(),
                expected: self.base.input_names().len().max(1),
                got: inputs.len(),
            });
        }
        self.base.check_outputs(inputs.len()..=inputs.len())?;
        self.geometry.validate(name)?;
        if self.num_outputs == 0 {
            return Err(Error::invalid(name, "num_outputs must be greater than 0"));
        }
        if self.groups == 0 {
            return Err(Error::invalid(name, "groups must be greater than 0"));
        }

        let shape = inputs[0].shape();
        if shape.channel % self.groups != 0 {
            return Err(Error::invalid(
                name,
                format!(
                    "{} input channels not divisible into {} groups",
                    shape.channel, self.groups
                ),
            ));
        }
        if self.num_outputs % self.groups != 0 {
            return Err(Error::invalid(
                name,
                format!(
                    "{} outputs not divisible into {} groups",
                    self.num_outputs, self.groups
                ),
            ));
        }
        for input in &inputs[1..] {
            if input.shape() != shape {
                return Err(Error::ShapeMismatch {
                    layer: name.to_string(),
                    expected: shape,
                    got: input.shape(),
                });
            }
        }
        Ok(())
    }
}

impl Layer for ConvolutionLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn setup(&mut self, inputs: &[&Tensor], rng: &mut SimpleRng) -> Result<Allocation> {
        self.validate(inputs)?;

        let bottom = inputs[0].shape();
        let (top_h, top_w) = self
            .geometry
            .output_size(bottom.height, bottom.width)
            .ok_or_else(|| {
                Error::invalid(
                    self.base.name(),
                    format!("kernel does not fit padded input {}", bottom),
                )
            })?;

        self.bottom_shape = bottom;
        self.m = self.num_outputs / self.groups;
        self.k = bottom.channel / self.groups * self.geometry.kernel_h * self.geometry.kernel_w;
        self.n = top_h * top_w;
        *self.col.get_mut() = vec![0.0; self.k * self.groups * self.n];
        *self.col_diff.get_mut() = vec![0.0; self.k * self.groups * self.n];

        let weight = self.base.new_internal(
            "weight",
            Shape::new(
                self.num_outputs,
                bottom.channel / self.groups,
                self.geometry.kernel_h,
                self.geometry.kernel_w,
            ),
        );
        self.weight_filler.fill(&weight, rng);
        let mut params = vec![weight];

        if self.bias {
            let bias = self
                .base
                .new_internal("bias", Shape::new(1, 1, 1, self.num_outputs));
            self.bias_filler.fill(&bias, rng);
            params.push(bias);
            self.bias_multiplier = vec![1.0; self.n];
        }

        let top = Shape::new(bottom.batch, self.num_outputs, top_h, top_w);
        let outputs = (0..inputs.len())
            .map(|i| self.base.new_output(i, top))
            .collect();

        Ok(Allocation { outputs, params })
    }

    fn forward(&self, io: &LayerIo<'_>) -> f32 {
        let shape = self.bottom_shape;
        let weight = io.param(0).value();
        let mut col = self.col.borrow_mut();

        for (input, output) in io.inputs.iter().zip(&io.outputs) {
            let bottom = input.value();
            let mut top = output.value_mut();

            for b in 0..shape.batch {
                let top_slice = block_mut(&mut top, b, self.num_outputs * self.n);
                im2col(
                    block(&bottom, b, shape.batch_size()),
                    shape.channel,
                    shape.height,
                    shape.width,
                    &self.geometry,
                    &mut col,
                );

                for g in 0..self.groups {
                    io.blas.gemm(
                        Transpose::No,
                        Transpose::No,
                        self.m,
                        self.n,
                        self.k,
                        1.0,
                        block(&weight, g, self.m * self.k),
                        block(&col, g, self.k * self.n),
                        0.0,
                        block_mut(top_slice, g, self.m * self.n),
                    );
                }

                if self.bias {
                    let bias = io.param(1).value();
                    io.blas.gemm(
                        Transpose::No,
                        Transpose::No,
                        self.num_outputs,
                        self.n,
                        1,
                        1.0,
                        &bias,
                        &self.bias_multiplier,
                        1.0,
                        top_slice,
                    );
                }
            }
        }
        0.0
    }

    fn backward(&self, io: &LayerIo<'_>, propagate_params: bool) {
        let shape = self.bottom_shape;
        let top_size = self.num_outputs * self.n;
        let weight = io.param(0).value();
        let mut col = self.col.borrow_mut();
        let mut col_diff = self.col_diff.borrow_mut();

        if propagate_params {
            io.param(0).gradient_mut().fill(0.0);
            if self.bias {
                io.param(1).gradient_mut().fill(0.0);
            }
        }

        for (input, output) in io.inputs.iter().zip(&io.outputs) {
            let top_diff = output.gradient();
            let bottom = input.value();
            let mut bottom_diff = input.gradient_mut();

            for b in 0..shape.batch {
                let top_diff_slice = block(&top_diff, b, top_size);

                if propagate_params {
                    im2col(
                        block(&bottom, b, shape.batch_size()),
                        shape.channel,
                        shape.height,
                        shape.width,
                        &self.geometry,
                        &mut col,
                    );
                    let mut weight_diff = io.param(0).gradient_mut();
                    for g in 0..self.groups {
                        // dW_g += topDiff_g · col_gᵀ
                        io.blas.gemm(
                            Transpose::No,
                            Transpose::Yes,
                            self.m,
                            self.k,
                            self.n,
                            1.0,
                            block(top_diff_slice, g, self.m * self.n),
                            block(&col, g, self.k * self.n),
                            1.0,
                            block_mut(&mut weight_diff, g, self.m * self.k),
                        );
                    }
                    if self.bias {
                        io.blas.gemv(
                            Transpose::No,
                            self.num_outputs,
                            self.n,
                            1.0,
                            top_diff_slice,
                            &self.bias_multiplier,
                            1.0,
                            &mut io.param(1).gradient_mut(),
                        );
                    }
                }

                for g in 0..self.groups {
                    // dCol_g = W_gᵀ · topDiff_g
                    io.blas.gemm(
                        Transpose::Yes,
                        Transpose::No,
                        self.k,
                        self.n,
                        self.m,
                        1.0,
                        block(&weight, g, self.m * self.k),
                        block(top_diff_slice, g, self.m * self.n),
                        0.0,
                        block_mut(&mut col_diff, g, self.k * self.n),
                    );
                }
                col2im(
                    &col_diff,
                    shape.channel,
                    shape.height,
                    shape.width,
                    &self.geometry,
                    block_mut(&mut bottom_diff, b, shape.batch_size()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blas::NaiveBlas;
    use crate::layers::configure;

    #[test]
    fn test_output_size_formula() {
        let geometry = WindowGeometry::square(5);
        assert_eq!(geometry.output_size(28, 28), Some((24, 24)));
        assert_eq!(geometry.with_pad(2).output_size(28, 28), Some((28, 28)));
        assert_eq!(WindowGeometry::square(3).with_stride(2).output_size(7, 8), Some((3, 3)));
        assert_eq!(geometry.output_size(4, 4), None);
    }

    #[test]
    fn test_im2col_identity_kernel() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let geometry = WindowGeometry::square(1);
        let mut col = vec![0.0; 12];
        im2col(&data, 3, 2, 2, &geometry, &mut col);
        assert_eq!(col, data);

        let mut back = vec![f32::NAN; 12];
        col2im(&col, 3, 2, 2, &geometry, &mut back);
        assert_eq!(back, data);
    }

    #[test]
    fn test_im2col_zero_pads() {
        // 1x2x2 image, 3x3 kernel, pad 1 -> 2x2 output, 9 rows
        let data = [1.0, 2.0, 3.0, 4.0];
        let geometry = WindowGeometry::square(3).with_pad(1);
        let mut col = vec![f32::NAN; 9 * 4];
        im2col(&data, 1, 2, 2, &geometry, &mut col);
        // Centre offset (1,1) sees the image itself.
        assert_eq!(&col[4 * 4..5 * 4], &data);
        // Top-left offset (0,0) only reaches pixel (0,0) from output (1,1).
        assert_eq!(&col[0..4], &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_col2im_accumulates_overlaps() {
        // 1x1x3 row, 1x2 kernel: middle pixel appears in both windows.
        let geometry = WindowGeometry {
            kernel_h: 1,
            kernel_w: 2,
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
        };
        let col = [1.0, 1.0, 1.0, 1.0];
        let mut data = [0.0; 3];
        col2im(&col, 1, 1, 3, &geometry, &mut data);
        assert_eq!(data, [1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_mnist_geometry_shapes() {
        let bottom = Tensor::new("data", Shape::new(4, 1, 28, 28));
        let mut layer = ConvolutionLayer::new(
            LayerBase::new("conv1", ["data"], ["conv1"]),
            20,
            WindowGeometry::square(5),
        );
        let allocation = configure(&mut layer, &[&bottom], &mut SimpleRng::new(3)).unwrap();
        assert_eq!(allocation.outputs[0].shape(), Shape::new(4, 20, 24, 24));
        assert_eq!(allocation.params[0].shape(), Shape::new(20, 1, 5, 5));
        assert_eq!(allocation.params[1].shape(), Shape::new(1, 1, 1, 20));
    }

    #[test]
    fn test_groups_must_divide_channels() {
        let bottom = Tensor::new("data", Shape::new(1, 3, 4, 4));
        let mut layer = ConvolutionLayer::new(
            LayerBase::new("conv", ["data"], ["conv"]),
            4,
            WindowGeometry::square(3),
        )
        .with_groups(2);
        let err = configure(&mut layer, &[&bottom], &mut SimpleRng::new(3)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_pointwise_forward_matches_weights() {
        let bottom = Tensor::from_values("x", Shape::new(1, 2, 1, 2), vec![1.0, 2.0, 3.0, 4.0]);
        let mut layer =
            ConvolutionLayer::new(LayerBase::new("c", ["x"], ["y"]), 1, WindowGeometry::square(1));
        let allocation = configure(&mut layer, &[&bottom], &mut SimpleRng::new(3)).unwrap();
        allocation.params[0].value_mut().copy_from_slice(&[2.0, -1.0]);
        allocation.params[1].value_mut()[0] = 0.5;

        let io = LayerIo {
            inputs: vec![&bottom],
            outputs: vec![&allocation.outputs[0]],
            params: allocation.params.iter().collect(),
            blas: &NaiveBlas,
        };
        layer.forward(&io);
        // 2·[1,2] − [3,4] + 0.5
        assert_eq!(&*allocation.outputs[0].value(), &[-0.5, 0.5]);
    }
}
