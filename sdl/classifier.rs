//! # Classifier Update
//!
//! The classifier `W1` is a row of logistic-regression weights over the extended
//! design `[1; features; aux]`. It is updated one of two ways:
//!
//! - `ClosedFormClassifier` hands the whole problem to a [`LogisticSolver`] and
//!   overwrites row 0 with the solver's intercept and coefficients. Used every outer
//!   iteration of the filter and feature schedules.
//! - `TrustRegionClassifier` takes projected gradient sweeps from the current
//!   weights, with a warm-started sweep counter. Used by the full-dimension schedule.

use crate::projection::{GradientOptions, RowObjective, projected_gradient_descent};
use crate::types::{
    Penalty, SdlError, all_finite, extended_features, predict_probabilities, sigmoid, softplus,
    stack_aux,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Full-batch binary logistic regression.
pub trait LogisticSolver {
    /// Fits `labels ~ σ(b + wᵗx)` on `features` (`p × n`, one column per sample).
    /// Returns the intercept `b` and the coefficients `w`.
    fn fit(&self, features: ArrayView2<f64>, labels: ArrayView1<f64>) -> Result<(f64, Array1<f64>), SdlError>;
}

/// L2-penalized logistic regression, `½||w||² + C·Σ ℓ(yᵢ, b + wᵗxᵢ)`, with an
/// unpenalized intercept, minimized by BFGS.
#[derive(Debug, Clone)]
pub struct BfgsLogisticRegression {
    /// Inverse regularization strength.
    pub c: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for BfgsLogisticRegression {
    fn default() -> Self {
        Self {
            c: 1.0,
            tolerance: 1e-6,
            max_iterations: 200,
        }
    }
}

/// Penalized negative log-likelihood and its gradient at `theta = [b, w]`.
fn penalized_loss(
    theta: &Array1<f64>,
    design: &Array2<f64>,
    labels: &Array1<f64>,
    c: f64,
) -> (f64, Array1<f64>) {
    let eta = theta.dot(design);
    let mut cost = 0.0;
    let mut residual = Array1::<f64>::zeros(eta.len());
    for (i, (&e, &y)) in eta.iter().zip(labels.iter()).enumerate() {
        cost += softplus(e) - y * e;
        residual[i] = sigmoid(e) - y;
    }
    let mut grad = design.dot(&residual) * c;
    let weights = theta.slice(s![1..]);
    cost = c * cost + 0.5 * weights.dot(&weights);
    grad.slice_mut(s![1..]).scaled_add(1.0, &weights);
    (cost, grad)
}

impl BfgsLogisticRegression {
    /// AdaGrad on the same objective, for when the line search gives up.
    fn fit_by_gradient_descent(&self, design: &Array2<f64>, labels: &Array1<f64>) -> Array1<f64> {
        let mut theta = Array1::<f64>::zeros(design.nrows());
        let mut accumulated = Array1::<f64>::from_elem(design.nrows(), 1e-8);
        for _ in 0..5000 {
            let (_, grad) = penalized_loss(&theta, design, labels, self.c);
            if grad.dot(&grad).sqrt() < self.tolerance {
                break;
            }
            accumulated += &grad.mapv(|g| g * g);
            theta -= &(&grad / &accumulated.mapv(f64::sqrt));
        }
        theta
    }
}

impl LogisticSolver for BfgsLogisticRegression {
    fn fit(&self, features: ArrayView2<f64>, labels: ArrayView1<f64>) -> Result<(f64, Array1<f64>), SdlError> {
        if features.ncols() != labels.len() {
            return Err(SdlError::ShapeMismatch {
                what: "logistic regression samples",
                expected: labels.len(),
                found: features.ncols(),
            });
        }
        let design = extended_features(features, None)?;
        let labels = labels.to_owned();
        let c = self.c;

        let design_for_closure = design.clone();
        let labels_for_closure = labels.clone();
        let cost_and_grad = move |theta: &Array1<f64>| -> (f64, Array1<f64>) {
            penalized_loss(theta, &design_for_closure, &labels_for_closure, c)
        };

        let theta = match Bfgs::new(Array1::zeros(design.nrows()), cost_and_grad)
            .with_tolerance(self.tolerance)
            .with_max_iterations(self.max_iterations)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                iterations,
                ..
            }) if all_finite(&final_point) => {
                log::debug!("Logistic regression converged in {iterations} BFGS iterations.");
                final_point
            }
            Ok(_) => {
                log::warn!("BFGS returned non-finite coefficients; falling back to gradient descent.");
                self.fit_by_gradient_descent(&design, &labels)
            }
            Err(e) => {
                log::warn!("BFGS failed ({e:?}); falling back to gradient descent.");
                self.fit_by_gradient_descent(&design, &labels)
            }
        };

        if !all_finite(&theta) {
            return Err(SdlError::SolverFailed(
                "logistic regression produced non-finite coefficients".to_string(),
            ));
        }
        Ok((theta[0], theta.slice(s![1..]).to_owned()))
    }
}

/// Refits row 0 of `W1` from scratch with a [`LogisticSolver`].
#[derive(Debug, Clone, Default)]
pub struct ClosedFormClassifier<S> {
    pub solver: S,
}

impl<S: LogisticSolver> ClosedFormClassifier<S> {
    pub fn new(solver: S) -> Self {
        Self { solver }
    }

    /// `features` are the per-sample classifier inputs (`W0ᵗX0` or `H`); auxiliary
    /// rows are appended before fitting.
    pub fn update(
        &self,
        classifier: ArrayView2<f64>,
        features: ArrayView2<f64>,
        aux: Option<ArrayView2<f64>>,
        labels: ArrayView1<f64>,
    ) -> Result<Array2<f64>, SdlError> {
        let stacked = stack_aux(features, aux)?;
        if stacked.nrows() + 1 != classifier.ncols() {
            return Err(SdlError::ShapeMismatch {
                what: "classifier columns",
                expected: stacked.nrows() + 1,
                found: classifier.ncols(),
            });
        }
        let (intercept, coefficients) = self.solver.fit(stacked.view(), labels)?;
        let mut updated = classifier.to_owned();
        updated[[0, 0]] = intercept;
        updated.slice_mut(s![0, 1..]).assign(&coefficients);
        Ok(updated)
    }
}

/// Cross-entropy objective over the rows of `W1`.
struct ClassifierObjective<'a> {
    design: Array2<f64>,
    labels: ArrayView2<'a, f64>,
    probabilities: Array2<f64>,
    penalty: Penalty,
}

impl RowObjective for ClassifierObjective<'_> {
    fn begin_sweep(&mut self, current: ArrayView2<f64>) -> Result<(), SdlError> {
        self.probabilities = predict_probabilities(current, self.design.view());
        Ok(())
    }

    fn row_gradient(&self, current: ArrayView2<f64>, row: usize) -> Array1<f64> {
        let residual = &self.probabilities.row(row) - &self.labels.row(row);
        let mut grad = self.design.dot(&residual);
        self.penalty.add_gradient(&mut grad, current.row(row));
        grad
    }

    fn curvature(&self, row: usize) -> f64 {
        // Diagonal of H'H'ᵗ at the row's index; row 0 is the intercept row, so n.
        let design_row = self.design.row(row);
        design_row.dot(&design_row)
    }
}

/// Projected gradient sweeps on `W1` against `H' = [1; H; X_aux]`.
#[derive(Debug, Clone)]
pub struct TrustRegionClassifier {
    pub penalty: Penalty,
    pub sweeps: usize,
    pub stopping_diff: f64,
}

impl TrustRegionClassifier {
    /// Runs `self.sweeps` sweeps starting at sweep index `history`.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        classifier: ArrayView2<f64>,
        features: ArrayView2<f64>,
        aux: Option<ArrayView2<f64>>,
        labels: ArrayView2<f64>,
        radius: Option<f64>,
        history: usize,
        outer_iteration: usize,
    ) -> Result<Array2<f64>, SdlError> {
        let design = extended_features(features, aux)?;
        if design.nrows() != classifier.ncols() {
            return Err(SdlError::ShapeMismatch {
                what: "classifier columns",
                expected: design.nrows(),
                found: classifier.ncols(),
            });
        }
        if labels.dim() != (classifier.nrows(), design.ncols()) {
            return Err(SdlError::ShapeMismatch {
                what: "classifier label samples",
                expected: design.ncols(),
                found: labels.ncols(),
            });
        }
        let mut objective = ClassifierObjective {
            probabilities: Array2::zeros(labels.dim()),
            design,
            labels,
            penalty: self.penalty,
        };
        let options = GradientOptions::new("classifier", self.sweeps)
            .with_history(history)
            .with_radius(radius)
            .with_nonnegativity(self.penalty.nonnegative)
            .with_stopping(true, self.stopping_diff)
            .at_iteration(outer_iteration);
        projected_gradient_descent(classifier, &mut objective, &options)
    }
}

/// Total cross-entropy of classifier row 0 on the extended design.
pub fn classification_loss(
    classifier: ArrayView2<f64>,
    features: ArrayView2<f64>,
    aux: Option<ArrayView2<f64>>,
    labels: ArrayView1<f64>,
) -> Result<f64, SdlError> {
    let design = extended_features(features, aux)?;
    let eta = classifier.row(0).dot(&design);
    Ok(crate::types::cross_entropy(eta.view(), labels))
}

/// Row 0 of `σ(W1 · [1; features; aux])`.
pub fn probabilities(
    classifier: ArrayView2<f64>,
    features: ArrayView2<f64>,
    aux: Option<ArrayView2<f64>>,
) -> Result<Array1<f64>, SdlError> {
    let design = extended_features(features, aux)?;
    if design.nrows() != classifier.ncols() {
        return Err(SdlError::ShapeMismatch {
            what: "classifier columns",
            expected: design.nrows(),
            found: classifier.ncols(),
        });
    }
    Ok(predict_probabilities(classifier, design.view()).index_axis_move(Axis(0), 0))
}
