//! Solvers: turning parameter gradients into parameter updates
//!
//! The network applies `value += gradient` to every parameter; a solver's
//! job is to overwrite each parameter gradient with the final additive step
//! beforehand. Any update rule can be plugged in this way without touching
//! the execution engine.
//!
//! # Example
//!
//! ```
//! use blobflow::architecture::LayerDescriptor;
//! use blobflow::config::SolverConfig;
//! use blobflow::layers::{FixedDataLayer, LayerBase};
//! use blobflow::network::NetworkBuilder;
//! use blobflow::solver::{SgdSolver, Solver};
//! use blobflow::tensor::Shape;
//!
//! let data = FixedDataLayer::new(
//!     LayerBase::new("data", Vec::<String>::new(), ["x", "label"]),
//!     vec![Shape::new(1, 2, 1, 1), Shape::new(1, 1, 1, 1)],
//!     vec![vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![vec![0.0], vec![1.0]]],
//!     2,
//! );
//! let net = NetworkBuilder::new()
//!     .layer(Box::new(data))
//!     .descriptor(&LayerDescriptor::inner_product("ip", "x", "ip", 2))
//!     .descriptor(&LayerDescriptor::softmax_loss("loss", "ip", "label", "loss"))
//!     .build()
//!     .unwrap();
//!
//! let mut solver = SgdSolver::new(SolverConfig::default());
//! for _ in 0..10 {
//!     solver.step(&net);
//! }
//! assert_eq!(solver.iterations(), 10);
//! ```

pub mod sgd;

pub use sgd::SgdSolver;

use crate::network::Network;

/// Core trait for parameter update rules.
pub trait Solver {
    /// Replace every parameter gradient of `net` with the additive step to
    /// apply. Advances the iteration counter. Nothing is learned when
    /// `net` has parameter-gradient propagation switched off.
    fn compute_updates(&mut self, net: &Network<'_>);

    /// Update calls since construction or the last reset.
    fn iterations(&self) -> usize;

    /// Learning rate used by the most recent update.
    fn learning_rate(&self) -> f32;

    /// Clear all accumulated state.
    fn reset(&mut self);

    /// One training iteration: forward, backward, compute updates, apply.
    /// Returns the loss of the forward pass.
    fn step(&mut self, net: &Network<'_>) -> f32 {
        let loss = net.forward_backward();
        self.compute_updates(net);
        net.update();
        loss
    }
}
