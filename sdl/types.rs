// ========================================================================================
//                             Shared numeric contracts
// ========================================================================================

// This file is for types and helpers shared between the update modules.

use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Dimension, concatenate};
use thiserror::Error;

/// Every failure the optimization core can signal.
///
/// Configuration and shape problems are raised by constructors before any
/// optimization work happens. Numerical problems surface mid-run and leave the
/// learner's accumulated results in place for diagnosis.
#[derive(Error, Debug)]
pub enum SdlError {
    #[error("Shape mismatch for {what}: expected {expected}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Cannot normalize or compare against a zero-norm matrix ({0}).")]
    DegenerateNorm(&'static str),

    #[error(
        "Non-finite values appeared in the {block} during outer iteration {iteration}. The run was aborted."
    )]
    NumericalInstability {
        block: &'static str,
        iteration: usize,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Labels must be binary (0 or 1); found {value} at sample {index}.")]
    InvalidLabels { index: usize, value: f64 },

    #[error("The logistic regression solver failed: {0}")]
    SolverFailed(String),
}

/// Bound on the linear predictor before exponentiation, as in the GLM code paths.
pub const LOGIT_CLAMP: f64 = 700.0;

/// Numerically stable logistic function; finite inputs always map into `[0, 1]`.
#[inline]
pub fn sigmoid(z: f64) -> f64 {
    let z = z.clamp(-LOGIT_CLAMP, LOGIT_CLAMP);
    1.0 / (1.0 + (-z).exp())
}

/// `ln(1 + e^z)` without overflow for large `z`.
#[inline]
pub fn softplus(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

/// Frobenius (entrywise Euclidean) norm of an array of any dimension.
pub fn frobenius_norm<S, D>(matrix: &ArrayBase<S, D>) -> f64
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    matrix.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// Squared Frobenius norm of `a - b`.
pub fn squared_distance(a: ArrayView2<f64>, b: ArrayView2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum()
}

pub fn all_finite<S, D>(matrix: &ArrayBase<S, D>) -> bool
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    matrix.iter().all(|v| v.is_finite())
}

/// Signum with `sign(0) = 0`, matching the subgradient used for the L1 penalty.
#[inline]
pub fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Regularization and sign constraint applied to one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penalty {
    pub l1: f64,
    pub l2: f64,
    pub nonnegative: bool,
}

impl Penalty {
    pub const NONE: Penalty = Penalty {
        l1: 0.0,
        l2: 0.0,
        nonnegative: false,
    };

    /// Adds `l1·sign(x) + l2·x` to `grad`.
    pub fn add_gradient(&self, grad: &mut Array1<f64>, x: ArrayView1<f64>) {
        if self.l1 == 0.0 && self.l2 == 0.0 {
            return;
        }
        grad.zip_mut_with(&x, |g, &v| *g += self.l1 * sign(v) + self.l2 * v);
    }
}

/// Builds the classifier design `[1; features; aux]` with one column per sample.
pub fn extended_features(
    features: ArrayView2<f64>,
    aux: Option<ArrayView2<f64>>,
) -> Result<Array2<f64>, SdlError> {
    let ones = Array2::<f64>::ones((1, features.ncols()));
    let stacked = stack_aux(features, aux)?;
    concatenate(Axis(0), &[ones.view(), stacked.view()]).map_err(|_| SdlError::ShapeMismatch {
        what: "classifier design columns",
        expected: ones.ncols(),
        found: stacked.ncols(),
    })
}

/// Stacks features with optional auxiliary rows (no intercept row).
pub fn stack_aux(
    features: ArrayView2<f64>,
    aux: Option<ArrayView2<f64>>,
) -> Result<Array2<f64>, SdlError> {
    match aux {
        Some(aux) if aux.ncols() != features.ncols() => Err(SdlError::ShapeMismatch {
            what: "auxiliary covariate samples",
            expected: features.ncols(),
            found: aux.ncols(),
        }),
        Some(aux) => Ok(concatenate(Axis(0), &[features, aux]).map_err(|_| {
            SdlError::ShapeMismatch {
                what: "auxiliary covariate samples",
                expected: features.ncols(),
                found: aux.ncols(),
            }
        })?),
        None => Ok(features.to_owned()),
    }
}

/// Predicted probabilities `σ(W1 · design)` for every classifier row and sample.
pub fn predict_probabilities(classifier: ArrayView2<f64>, design: ArrayView2<f64>) -> Array2<f64> {
    classifier.dot(&design).mapv(sigmoid)
}

/// Cross-entropy `Σ softplus(η) − y·η` of a single-row classifier against labels.
pub fn cross_entropy(eta: ArrayView1<f64>, labels: ArrayView1<f64>) -> f64 {
    eta.iter()
        .zip(labels.iter())
        .map(|(&e, &y)| softplus(e) - y * e)
        .sum()
}

/// Thresholds probabilities into hard 0/1 labels (`p >= threshold` is positive).
pub fn threshold_labels(probabilities: ArrayView1<f64>, threshold: f64) -> Array1<f64> {
    probabilities.mapv(|p| if p >= threshold { 1.0 } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn sigmoid_stays_in_unit_interval_for_extreme_inputs() {
        for z in [-1e308, -800.0, -5.0, 0.0, 5.0, 800.0, 1e308] {
            let p = sigmoid(z);
            assert!((0.0..=1.0).contains(&p), "sigmoid({z}) = {p}");
        }
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn softplus_matches_naive_formula_where_it_is_safe() {
        for z in [-30.0, -1.0, 0.0, 0.5, 20.0] {
            let naive = (1.0 + f64::exp(z)).ln();
            assert!((softplus(z) - naive).abs() < 1e-12);
        }
        // Large arguments must not overflow.
        assert!((softplus(1000.0) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn extended_features_prepends_intercept_and_appends_aux() {
        let features = array![[1.0, 2.0], [3.0, 4.0]];
        let aux = array![[9.0, 8.0]];
        let design = extended_features(features.view(), Some(aux.view())).unwrap();
        assert_eq!(design, array![[1.0, 1.0], [1.0, 2.0], [3.0, 4.0], [9.0, 8.0]]);
    }

    #[test]
    fn stacking_rejects_misaligned_aux() {
        let features = array![[1.0, 2.0, 3.0]];
        let aux = array![[9.0, 8.0]];
        assert!(matches!(
            stack_aux(features.view(), Some(aux.view())),
            Err(SdlError::ShapeMismatch { expected: 3, found: 2, .. })
        ));
    }
}
