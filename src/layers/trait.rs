//! Layer trait definition
//!
//! Every computation stage implements [`Layer`]: a one-time `setup` that
//! derives output shapes and allocates tensors, then any number of
//! `forward`/`backward` calls against tensors bound for that call only.

use crate::blas::Blas;
use crate::error::{Error, Result};
use crate::tensor::{Shape, Tensor};
use crate::utils::rng::SimpleRng;

/// Lifecycle of a layer instance.
///
/// `Unconfigured → Ready` on a successful setup, `Unconfigured → Failed`
/// otherwise. There are no other transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Unconfigured,
    Ready,
    Failed,
}

/// Name, declared wiring and lifecycle state shared by all layers.
#[derive(Debug, Clone)]
pub struct LayerBase {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    state: LayerState,
}

impl LayerBase {
    pub fn new<I, O>(name: impl Into<String>, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            state: LayerState::Unconfigured,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    /// Validate the bound inputs and the declared outputs against fixed counts.
    pub fn check_arity(
        &self,
        inputs: &[&Tensor],
        expected_inputs: usize,
        expected_outputs: usize,
    ) -> Result<()> {
        self.check_inputs(inputs, expected_inputs)?;
        self.check_outputs(expected_outputs..=expected_outputs)
    }

    pub fn check_inputs(&self, inputs: &[&Tensor], expected: usize) -> Result<()> {
        if inputs.len() != expected || self.inputs.len() != expected {
            return Err(Error::InputArity {
                layer: self.name.clone(),
                expected,
                got: inputs.len().max(self.inputs.len()),
            });
        }
        Ok(())
    }

    pub fn check_outputs(&self, expected: std::ops::RangeInclusive<usize>) -> Result<()> {
        if !expected.contains(&self.outputs.len()) {
            return Err(Error::OutputArity {
                layer: self.name.clone(),
                expected: *expected.start(),
                got: self.outputs.len(),
            });
        }
        Ok(())
    }

    /// Allocate a zeroed output tensor for the `index`-th declared output.
    pub fn new_output(&self, index: usize, shape: Shape) -> Tensor {
        Tensor::new(self.outputs[index].clone(), shape)
    }

    /// Allocate a zeroed tensor named `<layer>_<suffix>`.
    pub fn new_internal(&self, suffix: &str, shape: Shape) -> Tensor {
        Tensor::new(format!("{}_{}", self.name, suffix), shape)
    }
}

/// Tensors a layer hands to its network at setup.
///
/// `outputs` are in declared-output order; `params` are the trainable
/// tensors the solver updates. The network takes ownership of both.
#[derive(Debug, Default)]
pub struct Allocation {
    pub outputs: Vec<Tensor>,
    pub params: Vec<Tensor>,
}

/// Tensors and backend bound to a layer for the duration of one call.
pub struct LayerIo<'n> {
    pub inputs: Vec<&'n Tensor>,
    pub outputs: Vec<&'n Tensor>,
    pub params: Vec<&'n Tensor>,
    pub blas: &'n dyn Blas,
}

impl<'n> LayerIo<'n> {
    pub fn input(&self, index: usize) -> &'n Tensor {
        self.inputs[index]
    }

    pub fn output(&self, index: usize) -> &'n Tensor {
        self.outputs[index]
    }

    pub fn param(&self, index: usize) -> &'n Tensor {
        self.params[index]
    }
}

/// Core trait for computation stages.
///
/// `forward` must not modify input values. `backward` overwrites input
/// gradients (it does not accumulate across consumers) and, when
/// `propagate_params` is set, writes parameter gradients.
pub trait Layer {
    fn base(&self) -> &LayerBase;

    fn base_mut(&mut self) -> &mut LayerBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn input_names(&self) -> &[String] {
        self.base().input_names()
    }

    fn output_names(&self) -> &[String] {
        self.base().output_names()
    }

    fn state(&self) -> LayerState {
        self.base().state()
    }

    /// Validate arity and hyperparameters against the bound inputs, derive
    /// output shapes and allocate outputs, parameters and working buffers.
    ///
    /// Called through [`configure`], which enforces the state machine.
    fn setup(&mut self, inputs: &[&Tensor], rng: &mut SimpleRng) -> Result<Allocation>;

    /// Compute outputs from inputs. Returns this layer's loss contribution
    /// (zero for non-loss layers).
    fn forward(&self, io: &LayerIo<'_>) -> f32;

    /// Propagate output gradients into input (and optionally parameter)
    /// gradients.
    fn backward(&self, io: &LayerIo<'_>, propagate_params: bool);

    /// Data-feeding layers expose their cursor here.
    fn as_data_provider(&self) -> Option<&dyn DataProvider> {
        None
    }
}

/// External data source driven like a layer's forward pass.
pub trait DataProvider {
    /// Fill `outputs` with the next batch and advance the cursor, wrapping
    /// modulo [`total_inputs`](Self::total_inputs).
    fn produce_next_batch(&self, outputs: &[&Tensor]);

    /// Index of the next sample to be produced.
    fn current_index(&self) -> usize;

    /// Number of samples in the source.
    fn total_inputs(&self) -> usize;
}

/// Run `setup` under the layer state machine.
///
/// A second call on a `Ready` layer fails with `AlreadyConfigured`; any call
/// after a failed setup fails with `LayerFailed`. On success the returned
/// outputs are checked against the declared output names.
pub fn configure(
    layer: &mut dyn Layer,
    inputs: &[&Tensor],
    rng: &mut SimpleRng,
) -> Result<Allocation> {
    match layer.state() {
        LayerState::Unconfigured => {}
        LayerState::Ready => return Err(Error::AlreadyConfigured(layer.name().to_string())),
        LayerState::Failed => return Err(Error::LayerFailed(layer.name().to_string())),
    }

    let result = layer.setup(inputs, rng).and_then(|allocation| {
        let declared = layer.output_names();
        if allocation.outputs.len() != declared.len() {
            return Err(Error::OutputArity {
                layer: layer.name().to_string(),
                expected: declared.len(),
                got: allocation.outputs.len(),
            });
        }
        for (tensor, name) in allocation.outputs.iter().zip(declared) {
            if tensor.name() != name {
                return Err(Error::invalid(
                    layer.name(),
                    format!("allocated output {} but declared {}", tensor.name(), name),
                ));
            }
        }
        Ok(allocation)
    });

    layer.base_mut().state = if result.is_ok() {
        LayerState::Ready
    } else {
        LayerState::Failed
    };
    result
}
