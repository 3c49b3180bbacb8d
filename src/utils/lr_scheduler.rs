//! Learning rate scheduler trait and the step-decay schedule
//!
//! The SGD solver advances its scheduler once per update call, so "epoch"
//! below means "solver iteration" in that context.

/// Core trait for learning rate schedulers.
///
/// # Example
///
/// ```
/// use blobflow::utils::lr_scheduler::{LRScheduler, StepDecay};
///
/// let mut scheduler = StepDecay::new(0.1, 3, 0.5);
/// for _ in 0..3 {
///     scheduler.step();
/// }
/// assert_eq!(scheduler.get_lr(), 0.05);
/// scheduler.reset();
/// assert_eq!(scheduler.get_lr(), 0.1);
/// ```
pub trait LRScheduler {
    /// Get the current learning rate.
    fn get_lr(&self) -> f32;

    /// Advance the scheduler by one step and recompute the rate.
    fn step(&mut self);

    /// Reset the scheduler to its initial state.
    fn reset(&mut self);
}

/// Step decay learning rate scheduler.
///
/// Formula: lr = initial_lr * gamma^(steps / step_size), integer division.
#[derive(Debug, Clone)]
pub struct StepDecay {
    initial_lr: f32,
    step_size: usize,
    gamma: f32,
    current_step: usize,
    current_lr: f32,
}

impl StepDecay {
    /// Creates a new step decay scheduler.
    ///
    /// # Arguments
    ///
    /// * `initial_lr` - Starting learning rate
    /// * `step_size` - Number of steps between decays (must be > 0)
    /// * `gamma` - Decay factor applied at each boundary
    pub fn new(initial_lr: f32, step_size: usize, gamma: f32) -> Self {
        Self {
            initial_lr,
            step_size,
            gamma,
            current_step: 0,
            current_lr: initial_lr,
        }
    }

    /// Steps taken since construction or the last reset.
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

impl LRScheduler for StepDecay {
    fn get_lr(&self) -> f32 {
        self.current_lr
    }

    fn step(&mut self) {
        self.current_step += 1;
        let num_decays = self.current_step / self.step_size.max(1);
        self.current_lr = self.initial_lr * self.gamma.powi(num_decays as i32);
    }

    fn reset(&mut self) {
        self.current_step = 0;
        self.current_lr = self.initial_lr;
    }
}
