//! In-memory data provider

use crate::error::{Error, Result};
use crate::layers::{Allocation, DataProvider, Layer, LayerBase, LayerIo};
use crate::tensor::{Shape, Tensor};
use crate::utils::rng::SimpleRng;
use std::cell::Cell;

/// Feeds fixed, in-memory samples into its outputs.
///
/// Each output `i` is backed by one stream of samples (`streams[i]`), all
/// streams holding the same number of samples. A sample of stream `i` has
/// `sample_shapes[i].batch_size()` values; the output tensor stacks
/// `batch_size` consecutive samples. The cursor wraps around the end of the
/// streams.
///
/// # Example
///
/// ```
/// use blobflow::layers::{FixedDataLayer, LayerBase};
/// use blobflow::tensor::Shape;
///
/// let layer = FixedDataLayer::new(
///     LayerBase::new("data", Vec::<String>::new(), ["data", "label"]),
///     vec![Shape::new(1, 2, 1, 1), Shape::new(1, 1, 1, 1)],
///     vec![
///         vec![vec![0.0, 1.0], vec![1.0, 0.0]],
///         vec![vec![1.0], vec![0.0]],
///     ],
///     1,
/// );
/// assert_eq!(layer.batch_size(), 1);
/// ```
pub struct FixedDataLayer {
    base: LayerBase,
    sample_shapes: Vec<Shape>,
    streams: Vec<Vec<Vec<f32>>>,
    batch_size: usize,
    cursor: Cell<usize>,
}

impl FixedDataLayer {
    pub fn new(
        base: LayerBase,
        sample_shapes: Vec<Shape>,
        streams: Vec<Vec<Vec<f32>>>,
        batch_size: usize,
    ) -> Self {
        Self {
            base,
            sample_shapes,
            streams,
            batch_size,
            cursor: Cell::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn validate(&self) -> Result<()> {
        let name = self.base.name();
        if self.streams.is_empty() || self.streams.len() != self.sample_shapes.len() {
            return Err(Error::invalid(
                name,
                "need one sample shape per non-empty data stream",
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid(name, "batch size must be greater than 0"));
        }

        let total = self.streams[0].len();
        if total == 0 {
            return Err(Error::invalid(name, "data streams are empty"));
        }
        for (i, (stream, shape)) in self.streams.iter().zip(&self.sample_shapes).enumerate() {
            if stream.len() != total {
                return Err(Error::invalid(
                    name,
                    format!("stream {} has {} samples, expected {}", i, stream.len(), total),
                ));
            }
            let sample_size = shape.batch_size();
            if sample_size == 0 {
                return Err(Error::invalid(
                    name,
                    format!("stream {} has empty sample shape {}", i, shape),
                ));
            }
            if let Some(bad) = stream.iter().position(|s| s.len() != sample_size) {
                return Err(Error::invalid(
                    name,
                    format!(
                        "sample {} of stream {} has {} values, expected {}",
                        bad,
                        i,
                        stream[bad].len(),
                        sample_size
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl Layer for FixedDataLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn setup(&mut self, inputs: &[&Tensor], _rng: &mut SimpleRng) -> Result<Allocation> {
        self.base.check_arity(inputs, 0, self.streams.len())?;
        self.validate()?;
        self.cursor.set(0);

        let outputs = self
            .sample_shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| self.base.new_output(i, shape.with_batch(self.batch_size)))
            .collect();
        Ok(Allocation {
            outputs,
            params: Vec::new(),
        })
    }

    fn forward(&self, io: &LayerIo<'_>) -> f32 {
        self.produce_next_batch(&io.outputs);
        0.0
    }

    fn backward(&self, _io: &LayerIo<'_>, _propagate_params: bool) {}

    fn as_data_provider(&self) -> Option<&dyn DataProvider> {
        Some(self)
    }
}

impl DataProvider for FixedDataLayer {
    fn produce_next_batch(&self, outputs: &[&Tensor]) {
        let total = self.total_inputs();
        let start = self.cursor.get();

        for (output, stream) in outputs.iter().zip(&self.streams) {
            let mut values = output.value_mut();
            let sample_size = values.len() / self.batch_size;
            for (b, chunk) in values.chunks_mut(sample_size).enumerate() {
                chunk.copy_from_slice(&stream[(start + b) % total]);
            }
        }
        self.cursor.set((start + self.batch_size) % total);
    }

    fn current_index(&self) -> usize {
        self.cursor.get()
    }

    fn total_inputs(&self) -> usize {
        self.streams.first().map_or(0, Vec::len)
    }
}
