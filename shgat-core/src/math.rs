//! Numeric kernels shared by the forward pass, the scorer, and the trainer

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;

/// Slope of the LeakyReLU used in attention scoring
pub const LEAKY_RELU_SLOPE: f32 = 0.2;

/// Numerical guard for binary cross-entropy
pub const BCE_EPSILON: f32 = 1e-7;

/// Symmetric uniform limit for attention-vector initialization
pub const ATTENTION_INIT_LIMIT: f32 = 0.1;

/// Stable softmax: subtract the max before exponentiating
pub fn softmax(scores: &DVector<f32>) -> DVector<f32> {
    if scores.is_empty() {
        return scores.clone();
    }
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut out = scores.map(|s| (s - max).exp());
    let sum: f32 = out.iter().sum();
    if sum > 0.0 {
        out /= sum;
    }
    out
}

pub fn leaky_relu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        LEAKY_RELU_SLOPE * x
    }
}

pub fn leaky_relu_derivative(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        LEAKY_RELU_SLOPE
    }
}

/// ELU with alpha = 1
pub fn elu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        x.exp() - 1.0
    }
}

pub fn elu_derivative(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        x.exp()
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Binary cross-entropy of a probability against a {0,1} outcome
pub fn bce_loss(p: f32, y: f32) -> f32 {
    let p = p.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

/// dL/dp for binary cross-entropy, with the same epsilon guard as the loss
pub fn bce_gradient(p: f32, y: f32) -> f32 {
    let p = p.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON);
    (p - y) / (p * (1.0 - p))
}

/// Xavier-uniform matrix: entries in ±sqrt(6 / (fan_in + fan_out)) scaled by `gain`
pub fn xavier_matrix(rng: &mut StdRng, rows: usize, cols: usize, gain: f32) -> DMatrix<f32> {
    let limit = (6.0 / (rows + cols) as f32).sqrt() * gain;
    DMatrix::from_fn(rows, cols, |_, _| rng.gen_range(-limit..limit))
}

/// Small symmetric uniform vector for attention parameters
pub fn attention_vector(rng: &mut StdRng, len: usize) -> DVector<f32> {
    DVector::from_fn(len, |_, _| {
        rng.gen_range(-ATTENTION_INIT_LIMIT..ATTENTION_INIT_LIMIT)
    })
}

/// Lift an input-space vector to the hidden width deterministically.
///
/// Copy when the widths agree, truncate when the input is wider, and tile
/// cyclically when it is narrower. Used to seed the working per-level buffers
/// from intrinsic embeddings.
pub fn lift(input: &DVector<f32>, hidden_dim: usize) -> DVector<f32> {
    let n = input.len();
    if n == hidden_dim {
        return input.clone();
    }
    DVector::from_fn(hidden_dim, |i, _| input[i % n])
}

/// L2 norm over a set of matrices and vectors
pub fn group_norm(matrices: &[&DMatrix<f32>], vectors: &[&DVector<f32>]) -> f32 {
    let mut sum = 0.0f32;
    for m in matrices {
        sum += m.iter().map(|v| v * v).sum::<f32>();
    }
    for v in vectors {
        sum += v.iter().map(|x| x * x).sum::<f32>();
    }
    sum.sqrt()
}

/// Find the first non-finite entry across matrices and vectors, if any
pub fn first_non_finite(matrices: &[&DMatrix<f32>], vectors: &[&DVector<f32>]) -> Option<f32> {
    for m in matrices {
        if let Some(v) = m.iter().find(|v| !v.is_finite()) {
            return Some(*v);
        }
    }
    for v in vectors {
        if let Some(x) = v.iter().find(|x| !x.is_finite()) {
            return Some(*x);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn test_softmax_normalizes() {
        let scores = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let probs = softmax(&scores);
        assert_relative_eq!(probs.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert!(probs.iter().all(|p| *p >= 0.0));
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_is_stable_for_large_scores() {
        let scores = DVector::from_vec(vec![1000.0, 1000.0]);
        let probs = softmax(&scores);
        assert_relative_eq!(probs[0], 0.5, epsilon = 1e-6);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_activations() {
        assert_relative_eq!(leaky_relu(2.0), 2.0);
        assert_relative_eq!(leaky_relu(-1.0), -0.2);
        assert_relative_eq!(elu(1.5), 1.5);
        assert_relative_eq!(elu(-1.0), (-1.0f32).exp() - 1.0);
        assert_relative_eq!(elu_derivative(-1.0), (-1.0f32).exp());
        assert_relative_eq!(sigmoid(0.0), 0.5);
    }

    #[test]
    fn test_bce_guards_against_extremes() {
        assert!(bce_loss(0.0, 1.0).is_finite());
        assert!(bce_loss(1.0, 0.0).is_finite());
        assert!(bce_gradient(0.0, 1.0).is_finite());
        // Gradient points towards the target
        assert!(bce_gradient(0.3, 1.0) < 0.0);
        assert!(bce_gradient(0.7, 0.0) > 0.0);
    }

    #[test]
    fn test_xavier_range() {
        let mut rng = StdRng::seed_from_u64(42);
        let m = xavier_matrix(&mut rng, 8, 8, 1.0);
        let limit = (6.0f32 / 16.0).sqrt();
        assert!(m.iter().all(|v| v.abs() < limit));
        // Not all zero
        assert!(m.iter().any(|v| v.abs() > 1e-4));
    }

    #[test]
    fn test_lift_copies_truncates_and_tiles() {
        let v = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(lift(&v, 4), v);
        assert_eq!(lift(&v, 2), DVector::from_vec(vec![1.0, 2.0]));
        assert_eq!(
            lift(&v, 6),
            DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0])
        );
    }

    #[test]
    fn test_first_non_finite() {
        let good = DMatrix::from_element(2, 2, 1.0f32);
        let mut bad = good.clone();
        bad[(1, 1)] = f32::NAN;
        assert!(first_non_finite(&[&good], &[]).is_none());
        assert!(first_non_finite(&[&good, &bad], &[]).is_some());
    }
}
