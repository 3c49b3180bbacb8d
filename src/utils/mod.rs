//! Shared utilities
//!
//! Random number generation, parameter fillers, activation functions and
//! learning-rate schedules used by layers and solvers.

pub mod activations;
pub mod filler;
pub mod lr_scheduler;
pub mod rng;

pub use activations::Activation;
pub use filler::Filler;
pub use lr_scheduler::{LRScheduler, StepDecay};
pub use rng::SimpleRng;
