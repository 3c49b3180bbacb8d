//! Network descriptions
//!
//! A network is described by an unordered list of [`LayerDescriptor`]s, each
//! naming the tensors it reads and writes plus its kind-specific
//! hyperparameters. Descriptors can be written by hand or loaded from JSON,
//! so architectures can be changed without touching code.

use crate::error::{Error, Result};
use crate::layers::{
    ActivationLayer, ConvolutionLayer, FixedDataLayer, InnerProductLayer, Layer, LayerBase,
    PoolMethod, PoolingLayer, SigmoidCrossEntropyLossLayer, SoftmaxLayer, SoftmaxWithLossLayer,
    WindowGeometry,
};
use crate::tensor::Shape;
use crate::utils::activations::Activation;
use crate::utils::filler::{default_weight_filler, Filler};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

fn enabled() -> bool {
    true
}

fn one() -> usize {
    1
}

/// Layer kind and hyperparameters.
///
/// # Examples
///
/// ```json
/// { "type": "inner_product", "num_outputs": 500 }
/// ```
///
/// ```json
/// {
///   "type": "convolution",
///   "num_outputs": 20,
///   "window": { "kernel_h": 5, "kernel_w": 5 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    InnerProduct {
        num_outputs: usize,
        #[serde(default = "enabled")]
        bias: bool,
        #[serde(default)]
        weight_filler: Option<Filler>,
        #[serde(default)]
        bias_filler: Option<Filler>,
    },
    Softmax,
    Convolution {
        num_outputs: usize,
        window: WindowGeometry,
        #[serde(default = "one")]
        groups: usize,
        #[serde(default = "enabled")]
        bias: bool,
        #[serde(default)]
        weight_filler: Option<Filler>,
        #[serde(default)]
        bias_filler: Option<Filler>,
    },
    Pooling {
        method: PoolMethod,
        window: WindowGeometry,
    },
    Activation {
        activation: Activation,
    },
    SoftmaxWithLoss,
    SigmoidCrossEntropyLoss,
    /// In-memory samples; see [`FixedDataLayer`].
    FixedData {
        sample_shapes: Vec<Shape>,
        streams: Vec<Vec<Vec<f32>>>,
        #[serde(default = "one")]
        batch_size: usize,
    },
}

/// One layer of a network: its name, wiring and kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub kind: LayerKind,
}

impl LayerDescriptor {
    pub fn new<I, O>(name: impl Into<String>, inputs: I, outputs: O, kind: LayerKind) -> Self
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
            kind,
        }
    }

    /// Affine layer with bias and default fillers.
    pub fn inner_product(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        num_outputs: usize,
    ) -> Self {
        let input: String = input.into();
        let output: String = output.into();
        Self::new(
            name,
            [input],
            [output],
            LayerKind::InnerProduct {
                num_outputs,
                bias: true,
                weight_filler: None,
                bias_filler: None,
            },
        )
    }

    /// Elementwise activation.
    pub fn activation(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        activation: Activation,
    ) -> Self {
        let input: String = input.into();
        let output: String = output.into();
        Self::new(name, [input], [output], LayerKind::Activation { activation })
    }

    /// Softmax cross-entropy over `scores` against `label`, loss only.
    pub fn softmax_loss(
        name: impl Into<String>,
        scores: impl Into<String>,
        label: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        let scores: String = scores.into();
        let label: String = label.into();
        let output: String = output.into();
        Self::new(name, [scores, label], [output], LayerKind::SoftmaxWithLoss)
    }

    /// Check the hyperparameters that can be judged without input shapes.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.is_empty() {
            crate::bail!("layer name must not be empty");
        }
        match &self.kind {
            LayerKind::InnerProduct { num_outputs, .. } if *num_outputs == 0 => {
                Err(Error::invalid(name, "num_outputs must be greater than 0"))
            }
            LayerKind::Convolution {
                num_outputs,
                window,
                groups,
                ..
            } => {
                if *num_outputs == 0 {
                    return Err(Error::invalid(name, "num_outputs must be greater than 0"));
                }
                if *groups == 0 || num_outputs % groups != 0 {
                    return Err(Error::invalid(
                        name,
                        format!("{} outputs not divisible into {} groups", num_outputs, groups),
                    ));
                }
                window.validate(name)
            }
            LayerKind::Pooling { window, .. } => window.validate(name),
            LayerKind::FixedData { batch_size, .. } if *batch_size == 0 => {
                Err(Error::invalid(name, "batch size must be greater than 0"))
            }
            _ => Ok(()),
        }
    }

    /// Construct the (unconfigured) layer this descriptor describes.
    pub fn build(&self) -> Box<dyn Layer> {
        let base = LayerBase::new(
            self.name.clone(),
            self.inputs.iter().cloned(),
            self.outputs.iter().cloned(),
        );
        match &self.kind {
            LayerKind::InnerProduct {
                num_outputs,
                bias,
                weight_filler,
                bias_filler,
            } => Box::new(
                InnerProductLayer::with_base(base, *num_outputs, *bias).with_fillers(
                    weight_filler.unwrap_or_else(default_weight_filler),
                    bias_filler.unwrap_or_default(),
                ),
            ),
            LayerKind::Softmax => Box::new(SoftmaxLayer::new(base)),
            LayerKind::Convolution {
                num_outputs,
                window,
                groups,
                bias,
                weight_filler,
                bias_filler,
            } => Box::new(
                ConvolutionLayer::new(base, *num_outputs, *window)
                    .with_groups(*groups)
                    .with_bias(*bias)
                    .with_fillers(
                        weight_filler.unwrap_or_else(default_weight_filler),
                        bias_filler.unwrap_or_default(),
                    ),
            ),
            LayerKind::Pooling { method, window } => {
                Box::new(PoolingLayer::new(base, *method, *window))
            }
            LayerKind::Activation { activation } => {
                Box::new(ActivationLayer::new(base, *activation))
            }
            LayerKind::SoftmaxWithLoss => Box::new(SoftmaxWithLossLayer::new(base)),
            LayerKind::SigmoidCrossEntropyLoss => {
                Box::new(SigmoidCrossEntropyLossLayer::new(base))
            }
            LayerKind::FixedData {
                sample_shapes,
                streams,
                batch_size,
            } => Box::new(FixedDataLayer::new(
                base,
                sample_shapes.clone(),
                streams.clone(),
                *batch_size,
            )),
        }
    }
}

/// A whole network: descriptors plus the seed used for parameter fillers.
///
/// # Example
///
/// ```json
/// {
///   "seed": 7,
///   "layers": [
///     { "name": "ip", "inputs": ["data"], "outputs": ["ip"],
///       "kind": { "type": "inner_product", "num_outputs": 2, "bias": false } },
///     { "name": "loss", "inputs": ["ip", "label"], "outputs": ["loss"],
///       "kind": { "type": "softmax_with_loss" } }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub seed: Option<u64>,
    pub layers: Vec<LayerDescriptor>,
}

impl NetworkConfig {
    /// Structural checks: at least one layer, unique layer names, unique
    /// output names and valid per-layer hyperparameters.
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            crate::bail!("network must have at least one layer");
        }

        let mut names = HashSet::new();
        let mut outputs = HashSet::new();
        for descriptor in &self.layers {
            if !names.insert(descriptor.name.as_str()) {
                return Err(Error::DuplicateLayer(descriptor.name.clone()));
            }
            for output in &descriptor.outputs {
                if !outputs.insert(output.as_str()) {
                    return Err(Error::DuplicateTensor {
                        tensor: output.clone(),
                        layer: descriptor.name.clone(),
                    });
                }
            }
            descriptor.validate()?;
        }
        Ok(())
    }
}

/// Load and validate a [`NetworkConfig`] from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use blobflow::architecture::load_architecture;
///
/// let config = load_architecture("config/lenet.json").unwrap();
/// assert!(!config.layers.is_empty());
/// ```
pub fn load_architecture(path: impl AsRef<Path>) -> Result<NetworkConfig> {
    let contents = fs::read_to_string(path)?;
    let config: NetworkConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
