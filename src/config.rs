//! Solver configuration
//!
//! Hyperparameters for momentum SGD, loadable from JSON. Every field is
//! optional in the file and falls back to the defaults below.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Momentum SGD hyperparameters.
///
/// The learning rate follows a step schedule:
/// `base_lr · gamma^(iteration / step_size)`.
///
/// # Example
///
/// ```json
/// {
///   "base_lr": 0.05,
///   "momentum": 0.9,
///   "weight_decay": 0.0005,
///   "gamma": 0.1,
///   "step_size": 5000
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub momentum: f32,
    pub base_lr: f32,
    pub weight_decay: f32,
    pub gamma: f32,
    pub step_size: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            base_lr: 0.01,
            weight_decay: 0.0005,
            gamma: 0.1,
            step_size: 100_000,
        }
    }
}

impl SolverConfig {
    /// Check value ranges: rates non-negative, momentum in `[0, 1)`,
    /// non-zero step size.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, reason: &str| {
            if ok {
                Ok(())
            } else {
                Err(Error::invalid("solver", reason))
            }
        };
        check(self.base_lr >= 0.0, "base_lr must be non-negative")?;
        check(
            (0.0..1.0).contains(&self.momentum),
            "momentum must be in [0, 1)",
        )?;
        check(self.weight_decay >= 0.0, "weight_decay must be non-negative")?;
        check(self.gamma >= 0.0, "gamma must be non-negative")?;
        check(self.step_size > 0, "step_size must be greater than 0")
    }
}

/// Load and validate a [`SolverConfig`] from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use blobflow::config::load_solver_config;
///
/// let cfg = load_solver_config("config/solver.json").unwrap();
/// assert!(cfg.base_lr > 0.0);
/// ```
pub fn load_solver_config(path: impl AsRef<Path>) -> Result<SolverConfig> {
    let contents = fs::read_to_string(path)?;
    let config: SolverConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
