//! Stochastic gradient descent with momentum and weight decay

use crate::config::SolverConfig;
use crate::network::Network;
use crate::solver::Solver;
use crate::utils::lr_scheduler::{LRScheduler, StepDecay};

/// Momentum SGD.
///
/// For each parameter, with `v` the previous step:
///
/// ```text
/// g    ← g + weight_decay · w
/// step ← momentum · v − lr · g
/// v    ← step
/// g    ← step
/// ```
///
/// `lr` follows a [`StepDecay`] schedule advanced once per update call.
/// When the network does not propagate parameter gradients the call is a
/// no-op apart from zeroing those gradients.
pub struct SgdSolver {
    config: SolverConfig,
    scheduler: StepDecay,
    history: Vec<Vec<f32>>,
    iterations: usize,
}

impl SgdSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self {
            config,
            scheduler: StepDecay::new(config.base_lr, config.step_size, config.gamma),
            history: Vec::new(),
            iterations: 0,
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Previous step per parameter, in network parameter order.
    pub fn history(&self) -> &[Vec<f32>] {
        &self.history
    }
}

impl Default for SgdSolver {
    fn default() -> Self {
        Self::new(SolverConfig::default())
    }
}

impl Solver for SgdSolver {
    fn compute_updates(&mut self, net: &Network<'_>) {
        if !net.propagate_params() {
            // Parameter gradients still hold the last step; clear them so a
            // following update leaves the values alone.
            log::debug!("parameter gradients disabled, skipping update");
            for param in net.params() {
                param.gradient_mut().fill(0.0);
            }
            return;
        }

        let previous_rate = self.scheduler.get_lr();
        self.iterations += 1;
        self.scheduler.step();
        let rate = self.scheduler.get_lr();
        if rate != previous_rate {
            log::info!(
                "iteration {}: learning rate {} -> {}",
                self.iterations,
                previous_rate,
                rate
            );
        }

        let params = net.params();
        let layout_changed = self.history.len() != params.len()
            || self
                .history
                .iter()
                .zip(&params)
                .any(|(last, param)| last.len() != param.len());
        if layout_changed {
            self.history = params.iter().map(|param| vec![0.0; param.len()]).collect();
        }

        let blas = net.blas();
        for (param, last) in params.iter().zip(self.history.iter_mut()) {
            let value = param.value();
            let mut gradient = param.gradient_mut();
            if self.config.weight_decay != 0.0 {
                blas.axpy(self.config.weight_decay, &value, &mut gradient);
            }
            blas.scal(self.config.momentum, last);
            blas.axpy(-rate, &gradient, last);
            gradient.copy_from_slice(last);
        }
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn learning_rate(&self) -> f32 {
        self.scheduler.get_lr()
    }

    fn reset(&mut self) {
        self.history.clear();
        self.iterations = 0;
        self.scheduler.reset();
    }
}
