use blobflow::architecture::{LayerDescriptor, LayerKind};
use blobflow::config::SolverConfig;
use blobflow::layers::{FixedDataLayer, LayerBase};
use blobflow::network::NetworkBuilder;
use blobflow::solver::{SgdSolver, Solver};
use blobflow::utils::SimpleRng;
use blobflow::Shape;
use std::process;

// Synthetic two-class problem: the label is (almost) the first feature.
const TRAIN_SIZE: usize = 1000;
const BATCH_SIZE: usize = 1;
// Training hyperparameters.
const ITERATIONS: usize = 1000;
const REPORT_EVERY: usize = 100;

// Four features per sample, laid out as a 2x2 plane. Feature 0 carries the
// class plus a little noise; the others are distractors.
fn random_data(n: usize, rng: &mut SimpleRng) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let mut features = Vec::with_capacity(n);
    let mut labels = Vec::with_capacity(n);
    for _ in 0..n {
        let d = rng.gen_usize(2) as f32;
        let e = rng.gen_usize(2) as f32 - 0.5;
        let f = rng.gen_usize(2) as f32 - 0.5;
        let r = (rng.next_f32() - 0.5) * 0.05;
        features.push(vec![
            d + r + 0.05 * e,
            e + rng.next_f32(),
            f + rng.next_f32(),
            rng.next_f32(),
        ]);
        labels.push(vec![d]);
    }
    (features, labels)
}

fn main() {
    let mut rng = SimpleRng::new(42);
    let (features, labels) = random_data(TRAIN_SIZE, &mut rng);

    let data = FixedDataLayer::new(
        LayerBase::new("random", Vec::<String>::new(), ["data", "label"]),
        vec![Shape::new(1, 1, 2, 2), Shape::new(1, 1, 1, 1)],
        vec![features, labels],
        BATCH_SIZE,
    );
    let ip = LayerDescriptor::new(
        "ip",
        ["data"],
        ["ip"],
        LayerKind::InnerProduct {
            num_outputs: 2,
            bias: false,
            weight_filler: None,
            bias_filler: None,
        },
    );
    let loss = LayerDescriptor::new(
        "loss",
        ["ip", "label"],
        ["loss", "prob"],
        LayerKind::SoftmaxWithLoss,
    );

    let net = NetworkBuilder::new()
        .layer(Box::new(data))
        .descriptor(&ip)
        .descriptor(&loss)
        .build()
        .unwrap_or_else(|err| {
            eprintln!("Failed to create network: {}", err);
            process::exit(1);
        });
    println!("{}", net.describe());

    let mut solver = SgdSolver::new(SolverConfig::default());
    let mut window_loss = 0.0f32;
    for i in 0..ITERATIONS {
        window_loss += solver.step(&net);
        if (i + 1) % REPORT_EVERY == 0 {
            println!(
                "Iteration {}, lr {:.4}, mean loss: {:.6}",
                i + 1,
                solver.learning_rate(),
                window_loss / REPORT_EVERY as f32
            );
            window_loss = 0.0;
        }
    }

    println!("\nLearned weights:");
    for param in net.params() {
        println!("{} = {:?}", param, &*param.value());
    }
}
