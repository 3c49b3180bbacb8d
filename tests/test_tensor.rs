//! Tests for tensor geometry and buffer access

use blobflow::{Shape, Tensor};

#[test]
fn test_coordinate_access_matches_offset() {
    let shape = Shape::new(2, 2, 2, 3);
    let values: Vec<f32> = (0..shape.size()).map(|v| v as f32).collect();
    let tensor = Tensor::from_values("t", shape, values);

    for b in 0..2 {
        for c in 0..2 {
            for h in 0..2 {
                for w in 0..3 {
                    assert_eq!(
                        tensor.value_at(b, c, h, w),
                        shape.offset(b, c, h, w) as f32
                    );
                }
            }
        }
    }
    assert_eq!(tensor.value_at(1, 0, 1, 2), 17.0);
}

#[test]
fn test_value_and_gradient_are_independent() {
    let tensor = Tensor::new("t", Shape::new(1, 1, 2, 2));
    {
        let value = tensor.value();
        let mut gradient = tensor.gradient_mut();
        gradient.copy_from_slice(&value);
        gradient[3] = 2.5;
    }
    tensor.value_mut()[0] = -1.0;

    assert_eq!(&*tensor.value(), &[-1.0, 0.0, 0.0, 0.0]);
    assert_eq!(&*tensor.gradient(), &[0.0, 0.0, 0.0, 2.5]);
    assert_eq!(tensor.gradient_at(0, 0, 1, 1), 2.5);
}

#[test]
fn test_with_batch_keeps_sample_geometry() {
    let sample = Shape::new(1, 3, 28, 28);
    let batch = sample.with_batch(64);
    assert_eq!(batch.batch_size(), sample.batch_size());
    assert_eq!(batch.size(), 64 * 3 * 28 * 28);
    assert_eq!(batch.to_string(), "(64,3,28,28)");
}

#[test]
fn test_empty_tensor() {
    let tensor = Tensor::new("empty", Shape::new(0, 3, 2, 2));
    assert!(tensor.is_empty());
    assert_eq!(tensor.len(), 0);
}

#[test]
#[should_panic(expected = "value count does not match shape")]
fn test_from_values_checks_length() {
    Tensor::from_values("bad", Shape::new(1, 1, 2, 2), vec![1.0; 3]);
}

#[test]
#[should_panic]
fn test_conflicting_borrow_panics() {
    let tensor = Tensor::new("t", Shape::new(1, 1, 1, 1));
    let _reader = tensor.value();
    let _writer = tensor.value_mut();
}
