//! Synthetic supervised factorization problems for unit tests.

use crate::classifier::{BfgsLogisticRegression, ClosedFormClassifier};
use crate::state::Loading;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

pub struct SyntheticProblem {
    /// `d1 × n`
    pub x0: Array2<f64>,
    /// `1 × n`, alternating 0/1.
    pub x1: Array2<f64>,
    /// Generating dictionary, `d1 × r`, unit Frobenius norm.
    pub dictionary: Array2<f64>,
}

pub fn planted_dictionary(d1: usize, r: usize, rng: &mut StdRng) -> Array2<f64> {
    let w = Array2::from_shape_simple_fn((d1, r), || rng.r#gen::<f64>());
    let norm = w.iter().map(|v| v * v).sum::<f64>().sqrt();
    w / norm
}

/// Draws `n` samples from `dictionary` with light noise. The code is uniform, with
/// row 0 shifted up by 2 for positive samples.
pub fn sample_from(dictionary: &Array2<f64>, n: usize, rng: &mut StdRng) -> SyntheticProblem {
    let r = dictionary.ncols();
    let labels = Array2::from_shape_fn((1, n), |(_, j)| (j % 2) as f64);
    let mut code = Array2::from_shape_simple_fn((r, n), || rng.r#gen::<f64>());
    for j in 0..n {
        code[[0, j]] += 2.0 * labels[[0, j]];
    }
    let noise = Normal::new(0.0, 0.01).unwrap();
    let x0 = dictionary.dot(&code)
        + Array2::from_shape_simple_fn((dictionary.nrows(), n), || noise.sample(rng));
    SyntheticProblem {
        x0,
        x1: labels,
        dictionary: dictionary.clone(),
    }
}

pub fn synthetic_problem(n: usize, d1: usize, r: usize, seed: u64) -> SyntheticProblem {
    let mut rng = StdRng::seed_from_u64(seed);
    let dictionary = planted_dictionary(d1, r, &mut rng);
    sample_from(&dictionary, n, &mut rng)
}

/// The generating dictionary with a classifier fitted on the compressed features.
pub fn planted_model(problem: &SyntheticProblem) -> Loading {
    let compressed = problem.dictionary.t().dot(&problem.x0);
    let classifier = ClosedFormClassifier::new(BfgsLogisticRegression::default())
        .update(
            Array2::zeros((1, problem.dictionary.ncols() + 1)).view(),
            compressed.view(),
            None,
            problem.x1.row(0),
        )
        .unwrap();
    Loading {
        dictionary: Some(problem.dictionary.clone()),
        classifier,
    }
}
