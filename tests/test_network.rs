//! Tests for graph assembly and the execution engine
//!
//! Covers dependency ordering, configuration failures, pass semantics and
//! attached evaluation networks.

use approx::assert_relative_eq;
use blobflow::architecture::{LayerDescriptor, LayerKind};
use blobflow::layers::{FixedDataLayer, Layer, LayerBase, LayerState, PoolMethod, WindowGeometry};
use blobflow::network::{Network, NetworkBuilder};
use blobflow::utils::Activation;
use blobflow::{Error, Shape};
use std::collections::HashSet;

// ============================================================================
// Fixtures
// ============================================================================

fn data_layer(batch: usize) -> Box<dyn Layer> {
    let samples = vec![
        vec![1.0, 0.5, -0.5, 0.0],
        vec![-1.0, 0.25, 0.5, 1.0],
        vec![0.0, -0.5, 1.0, -1.0],
        vec![0.5, 0.5, 0.5, 0.5],
    ];
    let labels = vec![vec![0.0], vec![1.0], vec![2.0], vec![1.0]];
    Box::new(FixedDataLayer::new(
        LayerBase::new("data", Vec::<String>::new(), ["x", "label"]),
        vec![Shape::new(1, 4, 1, 1), Shape::new(1, 1, 1, 1)],
        vec![samples, labels],
        batch,
    ))
}

fn classifier() -> Vec<LayerDescriptor> {
    vec![
        LayerDescriptor::softmax_loss("loss", "ip2", "label", "loss"),
        LayerDescriptor::inner_product("ip2", "h", "ip2", 3),
        LayerDescriptor::activation("tanh", "ip1", "h", Activation::Tanh),
        LayerDescriptor::inner_product("ip1", "x", "ip1", 5),
    ]
}

fn build(batch: usize) -> Network<'static> {
    NetworkBuilder::new()
        .descriptors(&classifier())
        .layer(data_layer(batch))
        .seed(5)
        .build()
        .expect("Failed to assemble classifier")
}

// ============================================================================
// Assembly
// ============================================================================

mod assembly_tests {
    use super::*;

    #[test]
    fn test_topological_order() {
        let net = build(2);
        assert_eq!(net.layer_names(), ["data", "ip1", "tanh", "ip2", "loss"]);

        // Every input is produced by a strictly earlier layer.
        let mut available = HashSet::new();
        for name in net.layer_names() {
            let layer = net.layer(name).unwrap();
            for input in layer.input_names() {
                assert!(available.contains(input), "{} reads {} too early", name, input);
            }
            available.extend(layer.output_names().iter().cloned());
        }
    }

    #[test]
    fn test_layers_are_ready_after_assembly() {
        let net = build(2);
        for name in net.layer_names() {
            assert_eq!(net.layer(name).unwrap().state(), LayerState::Ready);
        }
        assert_eq!(net.len(), 5);
        assert!(!net.is_empty());
    }

    #[test]
    fn test_tensor_shapes_registered() {
        let net = build(2);
        assert_eq!(net.tensor("x").unwrap().shape(), Shape::new(2, 4, 1, 1));
        assert_eq!(net.tensor("ip1").unwrap().shape(), Shape::new(2, 5, 1, 1));
        assert_eq!(net.tensor("loss").unwrap().shape(), Shape::new(1, 1, 1, 1));
        assert!(net.tensor("missing").is_none());
    }

    #[test]
    fn test_parameters_gathered_in_execution_order() {
        let net = build(2);
        let names: Vec<&str> = net.params().iter().map(|p| p.name()).collect();
        assert_eq!(names, ["ip1_weight", "ip1_bias", "ip2_weight", "ip2_bias"]);
        assert_eq!(net.layer_parameters("ip1").unwrap().len(), 2);
        assert!(net.layer_parameters("tanh").unwrap().is_empty());
        assert!(net.layer_parameters("nope").is_none());
    }

    #[test]
    fn test_unreachable_layer_named() {
        let err = NetworkBuilder::new()
            .layer(data_layer(1))
            .descriptor(&LayerDescriptor::inner_product("ip", "x", "ip", 2))
            .descriptor(&LayerDescriptor::inner_product("orphan", "ghost", "o", 2))
            .build()
            .err()
            .expect("assembly should fail");
        match err {
            Error::UnreachableLayers(names) => assert_eq!(names, ["orphan"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_cycle_is_unreachable() {
        let err = Network::new(&[
            LayerDescriptor::activation("a", "q", "p", Activation::Sigmoid),
            LayerDescriptor::activation("b", "p", "q", Activation::Sigmoid),
        ])
        .err()
        .expect("assembly should fail");
        match err {
            Error::UnreachableLayers(names) => assert_eq!(names, ["a", "b"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_duplicate_layer_name_rejected() {
        let err = Network::new(&[
            LayerDescriptor::activation("a", "x", "p", Activation::Sigmoid),
            LayerDescriptor::activation("a", "p", "q", Activation::Sigmoid),
        ])
        .err()
        .expect("assembly should fail");
        assert!(matches!(err, Error::DuplicateLayer(name) if name == "a"));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let err = NetworkBuilder::new()
            .layer(data_layer(1))
            .descriptor(&LayerDescriptor::activation("a", "x", "p", Activation::Tanh))
            .descriptor(&LayerDescriptor::activation("b", "x", "p", Activation::Tanh))
            .build()
            .err()
            .expect("assembly should fail");
        assert!(matches!(err, Error::DuplicateTensor { .. }));
    }

    #[test]
    fn test_setup_failure_aborts_assembly() {
        let conv = LayerDescriptor::new(
            "conv",
            ["x"],
            ["conv"],
            LayerKind::Convolution {
                num_outputs: 4,
                window: WindowGeometry::square(1),
                groups: 3,
                bias: true,
                weight_filler: None,
                bias_filler: None,
            },
        );
        let err = NetworkBuilder::new()
            .layer(data_layer(1))
            .descriptor(&conv)
            .build()
            .err()
            .expect("assembly should fail");
        assert!(matches!(err, Error::InvalidConfig { ref layer, .. } if layer == "conv"));
    }

    #[test]
    fn test_wrong_arity_reported() {
        let pool = LayerDescriptor::new(
            "pool",
            ["x", "label"],
            ["pool"],
            LayerKind::Pooling {
                method: PoolMethod::Max,
                window: WindowGeometry::square(1),
            },
        );
        let err = NetworkBuilder::new()
            .layer(data_layer(1))
            .descriptor(&pool)
            .build()
            .err()
            .expect("assembly should fail");
        assert!(matches!(err, Error::InputArity { .. }));
    }

    #[test]
    fn test_same_seed_same_parameters() {
        let a = build(2);
        let b = build(2);
        for (pa, pb) in a.params().iter().zip(b.params()) {
            assert_eq!(&*pa.value(), &*pb.value());
        }
    }

    #[test]
    fn test_describe_lists_layers() {
        let net = build(2);
        let table = net.describe();
        assert_eq!(table.lines().count(), 5);
        assert!(table.contains("ip1_weight: dim=(5,4,1,1)"));
    }
}

// ============================================================================
// Execution
// ============================================================================

mod execution_tests {
    use super::*;

    #[test]
    fn test_forward_returns_loss_and_keeps_inputs() {
        let net = build(2);
        let loss = net.forward();
        assert!(loss.is_finite() && loss > 0.0);
        assert_eq!(net.tensor("loss").unwrap().value()[0], loss);

        // The consumers of x must leave the batch exactly as the data layer wrote it.
        assert_eq!(
            net.tensor("x").unwrap().value().to_vec(),
            vec![1.0, 0.5, -0.5, 0.0, -1.0, 0.25, 0.5, 1.0]
        );
        assert_eq!(net.tensor("label").unwrap().value().to_vec(), vec![0.0, 1.0]);

        // Backward leaves every value untouched.
        let h_before = net.tensor("h").unwrap().value().to_vec();
        net.backward();
        assert_eq!(net.tensor("h").unwrap().value().to_vec(), h_before);
    }

    #[test]
    fn test_data_provider_advances_per_forward() {
        let net = build(2);
        assert_eq!(net.data_providers()[0].current_index(), 0);
        net.forward();
        assert_eq!(net.data_providers()[0].current_index(), 2);
        net.forward();
        assert_eq!(net.data_providers()[0].current_index(), 0);
        assert_eq!(net.data_providers()[0].total_inputs(), 4);
    }

    #[test]
    fn test_update_adds_gradient() {
        let net = build(2);
        net.forward_backward();
        let before: Vec<Vec<f32>> = net.params().iter().map(|p| p.value().to_vec()).collect();
        let grads: Vec<Vec<f32>> = net.params().iter().map(|p| p.gradient().to_vec()).collect();
        net.update();
        for ((param, old), grad) in net.params().iter().zip(&before).zip(&grads) {
            for ((&v, &o), &g) in param.value().iter().zip(old).zip(grad) {
                assert_relative_eq!(v, o + g, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_propagate_params_flag() {
        let net = build(2);
        net.set_propagate_params(false);
        assert!(!net.propagate_params());
        net.forward_backward();
        for param in net.params() {
            assert!(param.gradient().iter().all(|&g| g == 0.0));
        }
        // Input gradients still flow.
        assert!(net.tensor("h").unwrap().gradient().iter().any(|&g| g != 0.0));

        net.set_propagate_params(true);
        net.forward_backward();
        assert!(net.params()[0].gradient().iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_backward_keeps_loss_weight() {
        let net = build(2);
        net.forward_backward();
        net.forward_backward();
        assert_eq!(net.tensor("loss").unwrap().gradient()[0], 1.0);
    }
}

// ============================================================================
// Attached evaluation networks
// ============================================================================

mod attach_tests {
    use super::*;

    #[test]
    fn test_attach_with_same_batch_borrows_everything() {
        let train = build(2);
        let test = Network::attach(&classifier(), &train).expect("Failed to attach");

        assert_eq!(test.layer_names(), ["ip1", "tanh", "ip2", "loss"]);
        for name in ["x", "label", "ip1", "h", "ip2", "loss"] {
            assert!(test.is_borrowed(name), "{} should be borrowed", name);
        }
        assert_eq!(test.params().len(), 4);
        for (a, b) in test.params().iter().zip(train.params()) {
            assert!(std::ptr::eq(*a, b));
        }
    }

    #[test]
    fn test_attach_with_new_batch_shadows_activations() {
        let train = build(4);
        let test = NetworkBuilder::new()
            .layer(data_layer(1))
            .descriptors(&classifier())
            .attach(&train)
            .expect("Failed to attach");

        assert!(!test.is_borrowed("x"));
        assert!(!test.is_borrowed("ip1"));
        assert_eq!(test.tensor("ip1").unwrap().shape().batch, 1);
        assert_eq!(train.tensor("ip1").unwrap().shape().batch, 4);
        // The loss scalar keeps its shape and is shared.
        assert!(test.is_borrowed("loss"));

        // Weights are shared, so training the parent moves the child.
        let before = test.params()[0].value()[0];
        let train_loss = train.forward_backward();
        assert!(train_loss.is_finite());
        train.params()[0].gradient_mut()[0] = 0.5;
        train.update();
        assert_relative_eq!(test.params()[0].value()[0], before + 0.5, epsilon = 1e-6);

        let test_loss = test.forward();
        assert!(test_loss.is_finite());
        assert_eq!(test.data_providers()[0].current_index(), 1);
    }

    #[test]
    fn test_attach_resolves_inputs_from_parent() {
        let train = build(2);
        let probe = Network::attach(
            &[LayerDescriptor::activation(
                "probe",
                "ip2",
                "probe_out",
                Activation::Sigmoid,
            )],
            &train,
        )
        .expect("Failed to attach");

        train.forward();
        probe.forward();
        let logits = train.tensor("ip2").unwrap().value().to_vec();
        let out = probe.tensor("probe_out").unwrap().value().to_vec();
        for (&z, &s) in logits.iter().zip(&out) {
            assert_relative_eq!(s, 1.0 / (1.0 + (-z).exp()), epsilon = 1e-6);
        }
        assert!(train.tensor("probe_out").is_none());
    }
}
