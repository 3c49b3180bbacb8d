//! Affine ("inner product") layer
//!
//! Performs `top = bottom · Wᵀ (+ ones · bias)` over the per-sample
//! flattened input: `bottom` is `m × k`, `W` is `n × k`, `top` is `m × n`,
//! where `m` is the batch count and `n` the number of outputs.

use crate::blas::Transpose;
use crate::error::Result;
use crate::layers::{Allocation, Layer, LayerBase, LayerIo};
use crate::tensor::{Shape, Tensor};
use crate::utils::filler::{default_weight_filler, Filler};
use crate::utils::rng::SimpleRng;

/// Fully connected layer with optional bias.
///
/// Parameters, in order: weight `(n, k, 1, 1)` and, when enabled, bias
/// `(1, 1, 1, n)`.
///
/// # Example
///
/// ```
/// use blobflow::layers::InnerProductLayer;
///
/// let layer = InnerProductLayer::new("ip1", "pool2", "ip1", 500, true);
/// assert_eq!(layer.num_outputs(), 500);
/// ```
pub struct InnerProductLayer {
    base: LayerBase,
    num_outputs: usize,
    bias: bool,
    weight_filler: Filler,
    bias_filler: Filler,
    m: usize,
    n: usize,
    k: usize,
    bias_multiplier: Vec<f32>,
}

impl InnerProductLayer {
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        num_outputs: usize,
        bias: bool,
    ) -> Self {
        let input: String = input.into();
        let output: String = output.into();
        Self {
            base: LayerBase::new(name, [input], [output]),
            num_outputs,
            bias,
            weight_filler: default_weight_filler(),
            bias_filler: Filler::default(),
            m: 0,
            n: 0,
            k: 0,
            bias_multiplier: Vec::new(),
        }
    }

    /// Build from an explicit base (used by descriptor construction).
    pub fn with_base(base: LayerBase, num_outputs: usize, bias: bool) -> Self {
        Self {
            base,
            ..Self::new("", "", "", num_outputs, bias)
        }
    }

    pub fn with_fillers(mut self, weight_filler: Filler, bias_filler: Filler) -> Self {
        self.weight_filler = weight_filler;
        self.bias_filler = bias_filler;
        self
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    pub fn has_bias(&self) -> bool {
        self.bias
    }
}

impl Layer for InnerProductLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn setup(&mut self, inputs: &[&Tensor], rng: &mut SimpleRng) -> Result<Allocation> {
        self.base.check_arity(inputs, 1, 1)?;
        if self.num_outputs == 0 {
            return Err(crate::Error::invalid(
                self.base.name(),
                "num_outputs must be greater than 0",
            ));
        }

        let bottom = inputs[0].shape();
        self.m = bottom.batch;
        self.n = self.num_outputs;
        self.k = bottom.batch_size();

        let weight = self.base.new_internal("weight", Shape::new(self.n, self.k, 1, 1));
        self.weight_filler.fill(&weight, rng);
        let mut params = vec![weight];

        if self.bias {
            let bias = self.base.new_internal("bias", Shape::new(1, 1, 1, self.n));
            self.bias_filler.fill(&bias, rng);
            params.push(bias);
            self.bias_multiplier = vec![1.0; self.m];
        }

        Ok(Allocation {
            outputs: vec![self.base.new_output(0, Shape::new(self.m, self.n, 1, 1))],
            params,
        })
    }

    fn forward(&self, io: &LayerIo<'_>) -> f32 {
        let bottom = io.input(0).value();
        let weight = io.param(0).value();
        let mut top = io.output(0).value_mut();

        io.blas.gemm(
            Transpose::No,
            Transpose::Yes,
            self.m,
            self.n,
            self.k,
            1.0,
            &bottom,
            &weight,
            0.0,
            &mut top,
        );
        if self.bias {
            let bias = io.param(1).value();
            io.blas.gemm(
                Transpose::No,
                Transpose::No,
                self.m,
                self.n,
                1,
                1.0,
                &self.bias_multiplier,
                &bias,
                1.0,
                &mut top,
            );
        }
        0.0
    }

    fn backward(&self, io: &LayerIo<'_>, propagate_params: bool) {
        let top_diff = io.output(0).gradient();

        if propagate_params {
            let bottom = io.input(0).value();
            // dW = topDiffᵀ · bottom
            io.blas.gemm(
                Transpose::Yes,
                Transpose::No,
                self.n,
                self.k,
                self.m,
                1.0,
                &top_diff,
                &bottom,
                0.0,
                &mut io.param(0).gradient_mut(),
            );
            if self.bias {
                // db = topDiffᵀ · ones
                io.blas.gemv(
                    Transpose::Yes,
                    self.m,
                    self.n,
                    1.0,
                    &top_diff,
                    &self.bias_multiplier,
                    0.0,
                    &mut io.param(1).gradient_mut(),
                );
            }
        }

        // dBottom = topDiff · W
        let weight = io.param(0).value();
        io.blas.gemm(
            Transpose::No,
            Transpose::No,
            self.m,
            self.k,
            self.n,
            1.0,
            &top_diff,
            &weight,
            0.0,
            &mut io.input(0).gradient_mut(),
        );
    }
}
