//! Tests for the SGD solver and its learning-rate schedule

use approx::assert_relative_eq;
use blobflow::architecture::LayerDescriptor;
use blobflow::config::SolverConfig;
use blobflow::layers::{FixedDataLayer, LayerBase};
use blobflow::network::{Network, NetworkBuilder};
use blobflow::solver::{SgdSolver, Solver};
use blobflow::utils::{LRScheduler, StepDecay};
use blobflow::Shape;

// ============================================================================
// Fixtures
// ============================================================================

fn network() -> Network<'static> {
    let data = FixedDataLayer::new(
        LayerBase::new("data", Vec::<String>::new(), ["x", "label"]),
        vec![Shape::new(1, 3, 1, 1), Shape::new(1, 1, 1, 1)],
        vec![
            vec![vec![1.0, -1.0, 0.5], vec![0.0, 2.0, -0.5]],
            vec![vec![0.0], vec![1.0]],
        ],
        2,
    );
    NetworkBuilder::new()
        .layer(Box::new(data))
        .descriptor(&LayerDescriptor::inner_product("ip", "x", "ip", 2))
        .descriptor(&LayerDescriptor::softmax_loss("loss", "ip", "label", "loss"))
        .seed(11)
        .build()
        .expect("Failed to assemble network")
}

fn snapshot(values: impl Fn(&blobflow::Tensor) -> Vec<f32>, net: &Network<'_>) -> Vec<Vec<f32>> {
    net.params().into_iter().map(values).collect()
}

fn values(net: &Network<'_>) -> Vec<Vec<f32>> {
    snapshot(|p| p.value().to_vec(), net)
}

fn gradients(net: &Network<'_>) -> Vec<Vec<f32>> {
    snapshot(|p| p.gradient().to_vec(), net)
}

fn fill_gradients(net: &Network<'_>, value: f32) {
    for param in net.params() {
        param.gradient_mut().fill(value);
    }
}

// ============================================================================
// Update rule
// ============================================================================

mod update_tests {
    use super::*;

    #[test]
    fn test_first_step_is_scaled_gradient_plus_decay() {
        let net = network();
        net.forward_backward();
        let w = values(&net);
        let g = gradients(&net);

        let config = SolverConfig {
            base_lr: 0.1,
            momentum: 0.9,
            weight_decay: 0.01,
            ..SolverConfig::default()
        };
        let mut solver = SgdSolver::new(config);
        solver.compute_updates(&net);

        let steps = gradients(&net);
        for ((step, w), g) in steps.iter().zip(&w).zip(&g) {
            for ((&s, &w), &g) in step.iter().zip(w).zip(g) {
                assert_relative_eq!(s, -0.1 * (g + 0.01 * w), epsilon = 1e-6);
            }
        }
        assert_eq!(solver.history(), steps.as_slice());
        assert_eq!(solver.iterations(), 1);
    }

    #[test]
    fn test_momentum_carries_previous_step() {
        let net = network();
        let config = SolverConfig {
            base_lr: 0.5,
            momentum: 0.8,
            weight_decay: 0.0,
            ..SolverConfig::default()
        };
        let mut solver = SgdSolver::new(config);

        fill_gradients(&net, 1.0);
        solver.compute_updates(&net);
        assert!(gradients(&net).iter().flatten().all(|&s| s == -0.5));

        fill_gradients(&net, 2.0);
        solver.compute_updates(&net);
        for &s in gradients(&net).iter().flatten() {
            assert_relative_eq!(s, 0.8 * -0.5 - 0.5 * 2.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_step_applies_update() {
        let net = network();
        let before = values(&net);
        let mut solver = SgdSolver::new(SolverConfig {
            base_lr: 0.1,
            ..SolverConfig::default()
        });

        let loss = solver.step(&net);
        assert!(loss.is_finite());

        let steps = gradients(&net);
        for ((after, before), step) in values(&net).iter().zip(&before).zip(&steps) {
            for ((&a, &b), &s) in after.iter().zip(before).zip(step) {
                assert_relative_eq!(a, b + s, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_frozen_parameters_are_not_stepped_again() {
        let net = network();
        let mut solver = SgdSolver::new(SolverConfig {
            base_lr: 0.1,
            ..SolverConfig::default()
        });
        solver.step(&net);
        let trained = values(&net);
        let history = solver.history().to_vec();

        net.set_propagate_params(false);
        for _ in 0..3 {
            let loss = solver.step(&net);
            assert!(loss.is_finite());
        }
        assert_eq!(values(&net), trained);
        assert!(gradients(&net).iter().flatten().all(|&g| g == 0.0));
        assert_eq!(solver.iterations(), 1);
        assert_eq!(solver.history(), history.as_slice());

        net.set_propagate_params(true);
        solver.step(&net);
        assert_ne!(values(&net), trained);
        assert_eq!(solver.iterations(), 2);
    }

    #[test]
    fn test_training_reduces_loss() {
        let net = network();
        let mut solver = SgdSolver::new(SolverConfig {
            base_lr: 0.1,
            weight_decay: 0.0,
            ..SolverConfig::default()
        });
        let first = solver.step(&net);
        let mut last = first;
        for _ in 0..50 {
            last = solver.step(&net);
        }
        assert!(last < first, "loss went from {} to {}", first, last);
    }
}

// ============================================================================
// Learning-rate schedule
// ============================================================================

mod schedule_tests {
    use super::*;

    #[test]
    fn test_learning_rate_decays_at_step_boundary() {
        let net = network();
        let mut solver = SgdSolver::new(SolverConfig {
            base_lr: 0.4,
            gamma: 0.5,
            step_size: 2,
            momentum: 0.0,
            weight_decay: 0.0,
        });

        fill_gradients(&net, 1.0);
        solver.compute_updates(&net);
        assert_relative_eq!(solver.learning_rate(), 0.4);
        assert_relative_eq!(gradients(&net)[0][0], -0.4, epsilon = 1e-6);

        fill_gradients(&net, 1.0);
        solver.compute_updates(&net);
        assert_relative_eq!(solver.learning_rate(), 0.2);
        assert_relative_eq!(gradients(&net)[0][0], -0.2, epsilon = 1e-6);

        solver.compute_updates(&net);
        solver.compute_updates(&net);
        assert_relative_eq!(solver.learning_rate(), 0.1);
        assert_eq!(solver.iterations(), 4);
    }

    #[test]
    fn test_reset_restarts_schedule_and_history() {
        let net = network();
        let mut solver = SgdSolver::new(SolverConfig {
            base_lr: 0.4,
            gamma: 0.5,
            step_size: 1,
            ..SolverConfig::default()
        });
        fill_gradients(&net, 1.0);
        solver.compute_updates(&net);
        assert!(!solver.history().is_empty());

        solver.reset();
        assert!(solver.history().is_empty());
        assert_eq!(solver.iterations(), 0);
        assert_relative_eq!(solver.learning_rate(), 0.4);
    }

    #[test]
    fn test_step_decay_formula() {
        let mut scheduler = StepDecay::new(1.0, 3, 0.1);
        let mut rates = Vec::new();
        for _ in 0..7 {
            scheduler.step();
            rates.push(scheduler.get_lr());
        }
        let expected = [1.0, 1.0, 0.1, 0.1, 0.1, 0.01, 0.01];
        for (rate, expected) in rates.iter().zip(expected) {
            assert_relative_eq!(*rate, expected, epsilon = 1e-7);
        }
        assert_eq!(scheduler.current_step(), 7);
    }

    #[test]
    fn test_history_reallocates_for_new_network() {
        let small = network();
        let mut solver = SgdSolver::default();
        solver.compute_updates(&small);
        assert_eq!(solver.history().len(), 2);

        let larger = NetworkBuilder::new()
            .descriptor(&LayerDescriptor::inner_product("a", "x", "a", 4))
            .descriptor(&LayerDescriptor::inner_product("b", "a", "b", 2))
            .layer(Box::new(FixedDataLayer::new(
                LayerBase::new("data", Vec::<String>::new(), ["x"]),
                vec![Shape::new(1, 3, 1, 1)],
                vec![vec![vec![0.0, 1.0, 2.0]]],
                1,
            )))
            .build()
            .expect("Failed to assemble network");
        solver.compute_updates(&larger);
        assert_eq!(solver.history().len(), 4);
        assert_eq!(solver.history()[0].len(), 12);
    }
}
