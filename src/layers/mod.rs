//! Layer contract and the layer algorithm library
//!
//! Every stage implements [`Layer`]. Concrete layers:
//!
//! - [`InnerProductLayer`]: affine transform
//! - [`SoftmaxLayer`]: channel-wise softmax
//! - [`ConvolutionLayer`]: grouped convolution via [`im2col`]
//! - [`PoolingLayer`]: max / average pooling
//! - [`ActivationLayer`]: elementwise [`Activation`](crate::utils::Activation)
//! - [`SoftmaxWithLossLayer`], [`SigmoidCrossEntropyLossLayer`]: losses
//! - [`FixedDataLayer`]: in-memory [`DataProvider`]

mod r#trait;
pub mod activation;
pub mod conv2d;
pub mod data;
pub mod inner_product;
pub mod loss;
pub mod pooling;
pub mod softmax;

pub use activation::ActivationLayer;
pub use conv2d::{col2im, im2col, ConvolutionLayer, WindowGeometry};
pub use data::FixedDataLayer;
pub use inner_product::InnerProductLayer;
pub use loss::{SigmoidCrossEntropyLossLayer, SoftmaxWithLossLayer};
pub use pooling::{PoolMethod, PoolingLayer};
pub use r#trait::{configure, Allocation, DataProvider, Layer, LayerBase, LayerIo, LayerState};
pub use softmax::SoftmaxLayer;
