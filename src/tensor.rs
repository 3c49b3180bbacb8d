//! Named 4-D value/gradient buffers
//!
//! A [`Tensor`] couples two co-indexed buffers of identical length: `value`
//! (forward activations or parameters) and `gradient` (backward-accumulated
//! derivatives). Geometry is a fixed `(batch, channel, height, width)`
//! [`Shape`], stored row-major with the batch index slowest.
//!
//! Buffers live behind `RefCell`s so that layers can write their outputs
//! while other layers' tensors are read through shared references. A
//! conflicting access (e.g. a layer writing a tensor it is also reading)
//! is a wiring bug and panics at the borrow.

use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;

/// 4-D geometry: batch, channel, height, width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    pub batch: usize,
    pub channel: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub const fn new(batch: usize, channel: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channel,
            height,
            width,
        }
    }

    /// Total element count.
    pub fn size(&self) -> usize {
        self.batch * self.batch_size()
    }

    /// Elements per batch sample (`channel × height × width`).
    pub fn batch_size(&self) -> usize {
        self.channel * self.spatial_size()
    }

    /// Elements per channel plane (`height × width`).
    pub fn spatial_size(&self) -> usize {
        self.height * self.width
    }

    /// Row-major, batch-major linear offset of `(b, c, h, w)`.
    pub fn offset(&self, b: usize, c: usize, h: usize, w: usize) -> usize {
        ((b * self.channel + c) * self.height + h) * self.width + w
    }

    /// Same geometry with a different batch count.
    pub fn with_batch(&self, batch: usize) -> Self {
        Self { batch, ..*self }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.batch, self.channel, self.height, self.width
        )
    }
}

/// A named value/gradient buffer pair.
#[derive(Debug)]
pub struct Tensor {
    name: String,
    shape: Shape,
    value: RefCell<Vec<f32>>,
    gradient: RefCell<Vec<f32>>,
}

impl Tensor {
    /// Allocate a zero-filled tensor.
    pub fn new(name: impl Into<String>, shape: Shape) -> Self {
        let capacity = shape.size();
        Self {
            name: name.into(),
            shape,
            value: RefCell::new(vec![0.0; capacity]),
            gradient: RefCell::new(vec![0.0; capacity]),
        }
    }

    /// Allocate a tensor with the given values and a zero gradient.
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != shape.size()`.
    pub fn from_values(name: impl Into<String>, shape: Shape, values: Vec<f32>) -> Self {
        assert_eq!(
            values.len(),
            shape.size(),
            "value count does not match shape {}",
            shape
        );
        let tensor = Self::new(name, shape);
        *tensor.value.borrow_mut() = values;
        tensor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Element count of each buffer.
    pub fn len(&self) -> usize {
        self.shape.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self) -> Ref<'_, [f32]> {
        Ref::map(self.value.borrow(), |v| v.as_slice())
    }

    pub fn value_mut(&self) -> RefMut<'_, [f32]> {
        RefMut::map(self.value.borrow_mut(), |v| v.as_mut_slice())
    }

    pub fn gradient(&self) -> Ref<'_, [f32]> {
        Ref::map(self.gradient.borrow(), |v| v.as_slice())
    }

    pub fn gradient_mut(&self) -> RefMut<'_, [f32]> {
        RefMut::map(self.gradient.borrow_mut(), |v| v.as_mut_slice())
    }

    /// Value at a 4-D coordinate.
    pub fn value_at(&self, b: usize, c: usize, h: usize, w: usize) -> f32 {
        self.value.borrow()[self.shape.offset(b, c, h, w)]
    }

    /// Gradient at a 4-D coordinate.
    pub fn gradient_at(&self, b: usize, c: usize, h: usize, w: usize) -> f32 {
        self.gradient.borrow()[self.shape.offset(b, c, h, w)]
    }

    /// Reallocate both buffers for a new geometry. Contents are reset to zero.
    pub fn reshape(&mut self, shape: Shape) {
        let capacity = shape.size();
        self.shape = shape;
        *self.value.get_mut() = vec![0.0; capacity];
        *self.gradient.get_mut() = vec![0.0; capacity];
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: dim={}", self.name, self.shape)
    }
}
