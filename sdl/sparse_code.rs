//! Sparse-code inference against a fixed dictionary.
//!
//! The fitting loop and the predictors only need "give me a non-negative code for
//! these samples under this dictionary". That capability sits behind
//! [`SparseCoder`]; the crate ships a cyclic coordinate-descent lasso as the default.

use crate::types::SdlError;
use ndarray::{Array1, Array2, ArrayView2};

/// Infers a code `H` (`r × n`) for samples `X` (`d × n`) under a dictionary `W` (`d × r`).
pub trait SparseCoder {
    fn encode(&self, x: ArrayView2<f64>, dictionary: ArrayView2<f64>) -> Result<Array2<f64>, SdlError>;
}

/// Per-column lasso `½||x − W h||² + α||h||₁`, optionally restricted to `h ≥ 0`,
/// solved by cyclic coordinate descent on the Gram matrix `WᵗW`.
#[derive(Debug, Clone)]
pub struct CoordinateDescentLasso {
    pub alpha: f64,
    pub positive: bool,
    pub max_iter: usize,
    /// Converged once the largest coordinate move in a pass is below `tol` times
    /// the largest coefficient.
    pub tol: f64,
}

impl CoordinateDescentLasso {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            positive: true,
            max_iter: 1000,
            tol: 1e-8,
        }
    }

    fn encode_column(&self, gram: &Array2<f64>, correlation: Array1<f64>) -> Array1<f64> {
        let r = gram.nrows();
        let mut h = Array1::<f64>::zeros(r);
        // Running value of G·h.
        let mut gh = Array1::<f64>::zeros(r);

        for _ in 0..self.max_iter {
            let mut max_move: f64 = 0.0;
            let mut max_coef: f64 = 0.0;
            for j in 0..r {
                let diag = gram[[j, j]];
                let old = h[j];
                let new = if diag <= 0.0 {
                    0.0
                } else {
                    let rho = correlation[j] - gh[j] + diag * old;
                    let shrunk = if self.positive {
                        (rho - self.alpha).max(0.0)
                    } else {
                        rho.signum() * (rho.abs() - self.alpha).max(0.0)
                    };
                    shrunk / diag
                };
                let delta = new - old;
                if delta != 0.0 {
                    gh.scaled_add(delta, &gram.column(j));
                    h[j] = new;
                }
                max_move = max_move.max(delta.abs());
                max_coef = max_coef.max(new.abs());
            }
            if max_coef == 0.0 || max_move <= self.tol * max_coef {
                break;
            }
        }
        h
    }
}

impl SparseCoder for CoordinateDescentLasso {
    fn encode(&self, x: ArrayView2<f64>, dictionary: ArrayView2<f64>) -> Result<Array2<f64>, SdlError> {
        if x.nrows() != dictionary.nrows() {
            return Err(SdlError::ShapeMismatch {
                what: "sparse coding feature rows",
                expected: dictionary.nrows(),
                found: x.nrows(),
            });
        }
        let gram = dictionary.t().dot(&dictionary);
        let correlations = dictionary.t().dot(&x);
        let mut code = Array2::<f64>::zeros((dictionary.ncols(), x.ncols()));
        for (i, mut column) in code.columns_mut().into_iter().enumerate() {
            column.assign(&self.encode_column(&gram, correlations.column(i).to_owned()));
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::frobenius_norm;
    use ndarray::array;

    #[test]
    fn orthonormal_dictionary_round_trips_without_regularization() {
        let (c, s) = (0.6_f64, 0.8_f64);
        let w = array![[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]];
        let h_true = array![[1.0, 0.0, 2.5, 0.3], [0.5, 3.0, 0.0, 0.7], [2.0, 1.0, 1.0, 0.0]];
        let x = w.dot(&h_true);

        let coder = CoordinateDescentLasso::new(0.0);
        let h = coder.encode(x.view(), w.view()).unwrap();
        let residual = frobenius_norm(&(&w.dot(&h) - &x));
        assert!(residual < 1e-10, "residual {residual}");
    }

    #[test]
    fn codes_are_nonnegative_when_positive() {
        let w = array![[1.0, 0.2], [0.3, 1.0], [0.5, 0.5]];
        let x = array![[-1.0, 2.0], [3.0, -2.0], [0.0, 1.0]];
        let h = CoordinateDescentLasso::new(0.1).encode(x.view(), w.view()).unwrap();
        assert!(h.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn large_penalty_gives_an_empty_code() {
        let w = array![[1.0, 0.0], [0.0, 1.0]];
        let x = array![[0.5], [0.2]];
        let h = CoordinateDescentLasso::new(10.0).encode(x.view(), w.view()).unwrap();
        assert!(h.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn mismatched_rows_are_rejected() {
        let w = Array2::<f64>::eye(3);
        let x = Array2::<f64>::ones((2, 4));
        assert!(matches!(
            CoordinateDescentLasso::new(0.0).encode(x.view(), w.view()),
            Err(SdlError::ShapeMismatch { expected: 3, found: 2, .. })
        ));
    }
}
