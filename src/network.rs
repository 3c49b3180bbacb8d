//! Graph assembly and execution
//!
//! A [`Network`] takes an unordered set of layers, orders them so that every
//! layer's inputs are produced by an earlier layer, and owns every tensor
//! the layers exchange. Passes run over the ordered layers with `&self`;
//! tensors are mutated through their checked interior buffers.
//!
//! An evaluation network can be attached to an existing one with
//! [`Network::attach`]. It borrows the parent's tensors and parameters where
//! names and shapes agree and owns everything else, so the parent keeps
//! sole ownership of its buffers.

use crate::architecture::{LayerDescriptor, NetworkConfig};
use crate::blas::{Blas, NaiveBlas};
use crate::error::{Error, Result};
use crate::layers::{configure, DataProvider, Layer, LayerIo};
use crate::tensor::Tensor;
use crate::utils::rng::SimpleRng;
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::rc::Rc;

/// Index of a tensor inside its network.
pub type TensorId = usize;

/// Default seed for parameter fillers.
pub const DEFAULT_SEED: u64 = 1;

enum Slot<'a> {
    Owned(Tensor),
    Borrowed(&'a Tensor),
}

impl<'a> Slot<'a> {
    fn get(&self) -> &Tensor {
        match self {
            Slot::Owned(tensor) => tensor,
            Slot::Borrowed(tensor) => tensor,
        }
    }

    fn is_borrowed(&self) -> bool {
        matches!(self, Slot::Borrowed(_))
    }
}

struct LayerRecord {
    layer: Box<dyn Layer>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    params: Vec<TensorId>,
}

/// An assembled, ordered set of layers and the tensors they share.
///
/// `'a` is the lifetime of the parent network for attached networks;
/// stand-alone networks are `Network<'static>`.
pub struct Network<'a> {
    slots: Vec<Slot<'a>>,
    by_name: HashMap<String, TensorId>,
    records: Vec<LayerRecord>,
    params: Vec<TensorId>,
    blas: Rc<dyn Blas>,
    propagate_params: Cell<bool>,
}

/// Collects layers and options, then assembles a [`Network`].
///
/// # Example
///
/// ```
/// use blobflow::architecture::LayerDescriptor;
/// use blobflow::layers::{FixedDataLayer, LayerBase};
/// use blobflow::network::NetworkBuilder;
/// use blobflow::tensor::Shape;
///
/// let data = FixedDataLayer::new(
///     LayerBase::new("data", Vec::<String>::new(), ["x", "label"]),
///     vec![Shape::new(1, 2, 1, 1), Shape::new(1, 1, 1, 1)],
///     vec![vec![vec![1.0, 0.0]], vec![vec![1.0]]],
///     1,
/// );
/// let net = NetworkBuilder::new()
///     .layer(Box::new(data))
///     .descriptor(&LayerDescriptor::inner_product("ip", "x", "ip", 2))
///     .descriptor(&LayerDescriptor::softmax_loss("loss", "ip", "label", "loss"))
///     .seed(7)
///     .build()
///     .unwrap();
/// assert_eq!(net.layer_names(), ["data", "ip", "loss"]);
/// ```
pub struct NetworkBuilder {
    layers: Vec<Box<dyn Layer>>,
    blas: Option<Rc<dyn Blas>>,
    seed: u64,
    propagate_params: bool,
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            blas: None,
            seed: DEFAULT_SEED,
            propagate_params: true,
        }
    }

    pub fn descriptor(mut self, descriptor: &LayerDescriptor) -> Self {
        self.layers.push(descriptor.build());
        self
    }

    pub fn descriptors<'d>(mut self, descriptors: impl IntoIterator<Item = &'d LayerDescriptor>) -> Self {
        self.layers
            .extend(descriptors.into_iter().map(LayerDescriptor::build));
        self
    }

    /// Add a layer constructed outside the descriptor vocabulary.
    pub fn layer(mut self, layer: Box<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn blas(mut self, blas: Rc<dyn Blas>) -> Self {
        self.blas = Some(blas);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn propagate_params(mut self, propagate: bool) -> Self {
        self.propagate_params = propagate;
        self
    }

    /// Assemble a stand-alone network.
    pub fn build(self) -> Result<Network<'static>> {
        let blas = self.blas.unwrap_or_else(|| Rc::new(NaiveBlas));
        Assembler::new(None, self.seed).run(self.layers, blas, self.propagate_params)
    }

    /// Assemble a network attached to `parent`'s tensor namespace.
    ///
    /// Uses the parent's backend unless one was set explicitly.
    pub fn attach<'a>(self, parent: &'a Network<'_>) -> Result<Network<'a>> {
        let blas = self.blas.unwrap_or_else(|| Rc::clone(&parent.blas));
        Assembler::new(Some(parent), self.seed).run(self.layers, blas, self.propagate_params)
    }
}

/// Dependency resolution state for one assembly.
struct Assembler<'a, 'p> {
    parent: Option<&'a Network<'p>>,
    rng: SimpleRng,
    slots: Vec<Slot<'a>>,
    by_name: HashMap<String, TensorId>,
}

impl<'a, 'p> Assembler<'a, 'p> {
    fn new(parent: Option<&'a Network<'p>>, seed: u64) -> Self {
        Self {
            parent,
            rng: SimpleRng::new(seed),
            slots: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    fn run(
        mut self,
        layers: Vec<Box<dyn Layer>>,
        blas: Rc<dyn Blas>,
        propagate_params: bool,
    ) -> Result<Network<'a>> {
        check_unique(&layers)?;
        self.seed_from_parent(&layers);

        let mut pending = layers;
        let mut records = Vec::with_capacity(pending.len());
        let mut params = Vec::new();

        while !pending.is_empty() {
            let Some(index) = pending.iter().position(|layer| {
                layer
                    .input_names()
                    .iter()
                    .all(|name| self.by_name.contains_key(name))
            }) else {
                let unresolved: Vec<String> =
                    pending.iter().map(|layer| layer.name().to_string()).collect();
                log::warn!(
                    "network assembly stalled, unreachable layers: {}",
                    unresolved.join(", ")
                );
                return Err(Error::UnreachableLayers(unresolved));
            };

            let layer = pending.remove(index);
            let record = self.add_layer(layer)?;
            params.extend_from_slice(&record.params);
            records.push(record);
        }

        Ok(Network {
            slots: self.slots,
            by_name: self.by_name,
            records,
            params,
            blas,
            propagate_params: Cell::new(propagate_params),
        })
    }

    /// Make parent tensors visible under every name the new layers do not
    /// produce themselves.
    fn seed_from_parent(&mut self, layers: &[Box<dyn Layer>]) {
        let Some(parent) = self.parent else {
            return;
        };
        let produced: HashSet<&str> = layers
            .iter()
            .flat_map(|layer| layer.output_names())
            .map(String::as_str)
            .collect();

        let mut inherited: Vec<(&String, &TensorId)> = parent
            .by_name
            .iter()
            .filter(|(name, _)| !produced.contains(name.as_str()))
            .collect();
        inherited.sort_by_key(|(_, &id)| id);

        for (name, &id) in inherited {
            let tensor = parent.slots[id].get();
            self.by_name.insert(name.clone(), self.slots.len());
            self.slots.push(Slot::Borrowed(tensor));
        }
    }

    fn add_layer(&mut self, mut layer: Box<dyn Layer>) -> Result<LayerRecord> {
        let inputs: Vec<TensorId> = layer
            .input_names()
            .iter()
            .map(|name| self.by_name[name])
            .collect();

        let allocation = {
            let bound: Vec<&Tensor> = inputs.iter().map(|&id| self.slots[id].get()).collect();
            configure(layer.as_mut(), &bound, &mut self.rng)?
        };

        let shared_params = self.parent_params(layer.name(), &allocation.params);
        let outputs: Vec<TensorId> = allocation
            .outputs
            .into_iter()
            .map(|tensor| self.register_output(layer.name(), tensor))
            .collect();

        let params: Vec<TensorId> = match shared_params {
            Some(shared) => {
                log::debug!("{}: sharing parameters with parent network", layer.name());
                shared
                    .into_iter()
                    .map(|tensor| self.push(Slot::Borrowed(tensor)))
                    .collect()
            }
            None => allocation
                .params
                .into_iter()
                .map(|tensor| self.push(Slot::Owned(tensor)))
                .collect(),
        };

        log::debug!(
            "added layer {} ({} -> {})",
            layer.name(),
            self.describe_ids(&inputs),
            self.describe_ids(&outputs)
        );

        Ok(LayerRecord {
            layer,
            inputs,
            outputs,
            params,
        })
    }

    /// Register a freshly allocated output, borrowing the parent's buffer
    /// instead when it has the same name and shape.
    fn register_output(&mut self, layer: &str, tensor: Tensor) -> TensorId {
        let reusable = self
            .parent
            .and_then(|parent| parent.tensor(tensor.name()))
            .filter(|existing| existing.shape() == tensor.shape());

        let id = match reusable {
            Some(existing) => {
                log::debug!("{}: reusing parent buffer {}", layer, existing);
                self.push(Slot::Borrowed(existing))
            }
            None => {
                if self.parent.is_some() {
                    log::debug!("{}: allocating {}", layer, tensor);
                }
                self.push(Slot::Owned(tensor))
            }
        };
        let name = self.slots[id].get().name().to_string();
        self.by_name.insert(name, id);
        id
    }

    /// Parent parameters for `layer` when they match the fresh ones in
    /// count and shape.
    fn parent_params(&self, layer: &str, fresh: &[Tensor]) -> Option<Vec<&'a Tensor>> {
        let existing = self.parent?.layer_parameters(layer)?;
        let matches = existing.len() == fresh.len()
            && existing
                .iter()
                .zip(fresh)
                .all(|(old, new)| old.shape() == new.shape());
        (matches && !fresh.is_empty()).then_some(existing)
    }

    fn push(&mut self, slot: Slot<'a>) -> TensorId {
        self.slots.push(slot);
        self.slots.len() - 1
    }

    fn describe_ids(&self, ids: &[TensorId]) -> String {
        ids.iter()
            .map(|&id| self.slots[id].get().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn check_unique(layers: &[Box<dyn Layer>]) -> Result<()> {
    let mut names = HashSet::new();
    let mut outputs = HashSet::new();
    for layer in layers {
        if !names.insert(layer.name()) {
            return Err(Error::DuplicateLayer(layer.name().to_string()));
        }
        for output in layer.output_names() {
            if !outputs.insert(output.as_str()) {
                return Err(Error::DuplicateTensor {
                    tensor: output.clone(),
                    layer: layer.name().to_string(),
                });
            }
        }
    }
    Ok(())
}

impl Network<'static> {
    /// Assemble descriptors on the reference backend with [`DEFAULT_SEED`].
    pub fn new(descriptors: &[LayerDescriptor]) -> Result<Self> {
        NetworkBuilder::new().descriptors(descriptors).build()
    }

    /// Validate and assemble a loaded configuration.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        config.validate()?;
        NetworkBuilder::new()
            .descriptors(&config.layers)
            .seed(config.seed.unwrap_or(DEFAULT_SEED))
            .build()
    }
}

impl<'a> Network<'a> {
    /// Assemble `descriptors` against `parent`'s tensor namespace.
    ///
    /// Inputs the new layers do not produce resolve to the parent's
    /// tensors. Outputs whose name and shape match a parent tensor write
    /// into that tensor; the rest (e.g. a different batch size) are owned by
    /// the new network. Layers named like a parent layer with identically
    /// shaped parameters share those parameters.
    pub fn attach(descriptors: &[LayerDescriptor], parent: &'a Network<'_>) -> Result<Self> {
        NetworkBuilder::new().descriptors(descriptors).attach(parent)
    }

    fn bind(&self, record: &LayerRecord) -> LayerIo<'_> {
        let lookup = |ids: &[TensorId]| ids.iter().map(|&id| self.slots[id].get()).collect();
        LayerIo {
            inputs: lookup(&record.inputs),
            outputs: lookup(&record.outputs),
            params: lookup(&record.params),
            blas: &*self.blas,
        }
    }

    /// Run every layer forward in order; returns the summed loss.
    pub fn forward(&self) -> f32 {
        self.records
            .iter()
            .map(|record| record.layer.forward(&self.bind(record)))
            .sum()
    }

    /// Run every layer backward in reverse order.
    pub fn backward(&self) {
        let propagate = self.propagate_params.get();
        for record in self.records.iter().rev() {
            record.layer.backward(&self.bind(record), propagate);
        }
    }

    pub fn forward_backward(&self) -> f32 {
        let loss = self.forward();
        self.backward();
        loss
    }

    /// Apply `value += gradient` to every trainable parameter.
    ///
    /// The solver is expected to have turned raw gradients into the final
    /// additive step beforehand.
    pub fn update(&self) {
        for param in self.params() {
            let gradient = param.gradient();
            self.blas.axpy(1.0, &gradient, &mut param.value_mut());
        }
    }

    /// Wiring tensor by name.
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.by_name.get(name).map(|&id| self.slots[id].get())
    }

    /// Whether `name` resolves to a buffer owned by another network.
    pub fn is_borrowed(&self, name: &str) -> bool {
        self.by_name
            .get(name)
            .is_some_and(|&id| self.slots[id].is_borrowed())
    }

    /// Layer names in execution order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.records.iter().map(|record| record.layer.name()).collect()
    }

    pub fn layer(&self, name: &str) -> Option<&dyn Layer> {
        self.record(name).map(|record| record.layer.as_ref())
    }

    /// Trainable parameters of one layer, in the layer's order.
    pub fn layer_parameters(&self, name: &str) -> Option<Vec<&Tensor>> {
        self.record(name).map(|record| {
            record
                .params
                .iter()
                .map(|&id| self.slots[id].get())
                .collect()
        })
    }

    /// All trainable parameters, layer by layer in execution order.
    pub fn params(&self) -> Vec<&Tensor> {
        self.params.iter().map(|&id| self.slots[id].get()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Layers that feed external data, in execution order.
    pub fn data_providers(&self) -> Vec<&dyn DataProvider> {
        self.records
            .iter()
            .filter_map(|record| record.layer.as_data_provider())
            .collect()
    }

    pub fn blas(&self) -> &dyn Blas {
        &*self.blas
    }

    pub fn propagate_params(&self) -> bool {
        self.propagate_params.get()
    }

    /// Toggle parameter-gradient computation in subsequent backward passes.
    pub fn set_propagate_params(&self, propagate: bool) {
        self.propagate_params.set(propagate);
    }

    /// Ordered layer table, also emitted at `info` level.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, record) in self.records.iter().enumerate() {
            let names = |ids: &[TensorId]| {
                ids.iter()
                    .map(|&id| self.slots[id].get().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let _ = writeln!(
                out,
                "{:>3} {:<16} in [{}] out [{}] params [{}]",
                i,
                record.layer.name(),
                names(&record.inputs),
                names(&record.outputs),
                names(&record.params),
            );
        }
        log::info!("network with {} layers:\n{}", self.len(), out);
        out
    }

    fn record(&self, name: &str) -> Option<&LayerRecord> {
        self.records
            .iter()
            .find(|record| record.layer.name() == name)
    }
}
