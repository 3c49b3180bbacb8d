//! blobflow: a layered feed-forward / back-propagation engine
//!
//! Layers exchange named [`Tensor`](tensor::Tensor)s, each a value buffer
//! paired with a gradient buffer. A [`Network`](network::Network) orders an
//! unordered set of layers by their tensor dependencies, runs forward and
//! backward passes over them, and applies the parameter steps a
//! [`Solver`](solver::Solver) computes.
//!
//! # Modules
//!
//! - `tensor`: shapes and value/gradient buffers
//! - `blas`: numeric backend trait and implementations
//! - `layers`: layer contract and layer library (affine, softmax,
//!   convolution, pooling, activations, losses, data)
//! - `network`: graph assembly and execution
//! - `solver`: momentum SGD
//! - `config`: solver configuration
//! - `architecture`: serializable network descriptions
//! - `utils`: RNG, fillers, activation functions, LR schedules

pub mod error;

pub mod architecture;
pub mod blas;
pub mod config;
pub mod layers;
pub mod network;
pub mod solver;
pub mod tensor;
pub mod utils;

pub use error::{Error, Result};
pub use network::{Network, NetworkBuilder};
pub use tensor::{Shape, Tensor};
