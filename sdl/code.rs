//! # Code Update
//!
//! Two ways of refreshing the code `H` (`r × n`) for a fixed dictionary:
//!
//! - [`ReconstructionCode`]: `H ← argmin ||X0 − W0 H||²` with the Gram pair
//!   `A = W0ᵗW0`, `B = W0ᵗX0`. Used by the filter schedule, and with the roles of
//!   data and code swapped by the feature-mode dictionary step.
//! - [`JointCode`]: reconstruction plus classification,
//!   `ξ·(A H − B) + W1[:,k+1]·(P − X1) + L1·sign(H) + L2·H` for row `k`. Used by the
//!   feature schedule and by the alt and exhaustive predictors. `P` is recomputed
//!   from the most recent `H` for every row, and each sweep may work on a random
//!   subset of the sample columns.

use crate::projection::{
    GradientOptions, RowObjective, project_onto_ball, projected_gradient_descent,
};
use crate::sparsity::project_to_sparseness;
use crate::state::{BlockInputs, RunContext};
use crate::types::{Penalty, SdlError, sigmoid};
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rand::Rng;
use rand::rngs::StdRng;

/// A strategy for refreshing the code block, selected once per run.
pub trait CodeUpdate {
    /// Returns the new code. `dictionary` is `d1 × r`; `classifier` is
    /// `1 × (1 + r + d3)`.
    fn update(
        &self,
        code: ArrayView2<f64>,
        dictionary: ArrayView2<f64>,
        classifier: ArrayView2<f64>,
        inputs: &BlockInputs,
        ctx: &mut RunContext,
    ) -> Result<Array2<f64>, SdlError>;
}

fn check_code_shape(
    code: ArrayView2<f64>,
    dictionary: ArrayView2<f64>,
    x0: ArrayView2<f64>,
) -> Result<(), SdlError> {
    if dictionary.nrows() != x0.nrows() {
        return Err(SdlError::ShapeMismatch {
            what: "dictionary rows",
            expected: x0.nrows(),
            found: dictionary.nrows(),
        });
    }
    if code.nrows() != dictionary.ncols() {
        return Err(SdlError::ShapeMismatch {
            what: "code rows",
            expected: dictionary.ncols(),
            found: code.nrows(),
        });
    }
    if code.ncols() != x0.ncols() {
        return Err(SdlError::ShapeMismatch {
            what: "code samples",
            expected: x0.ncols(),
            found: code.ncols(),
        });
    }
    Ok(())
}

/// `A[k,:] H − B[k,:] + penalty`, row by row.
struct ReconstructionObjective {
    gram: Array2<f64>,
    target: Array2<f64>,
    penalty: Penalty,
}

impl RowObjective for ReconstructionObjective {
    fn row_gradient(&self, current: ArrayView2<f64>, row: usize) -> Array1<f64> {
        let mut grad = self.gram.row(row).dot(&current) - self.target.row(row);
        self.penalty.add_gradient(&mut grad, current.row(row));
        grad
    }

    fn curvature(&self, row: usize) -> f64 {
        self.gram[[row, row]]
    }
}

/// One reconstruction-only projected gradient call: fits `initial` (`r × n`) so
/// that `basis · initial ≈ x`, with `basis` `d × r` and `x` `d × n`.
pub fn reconstruction_step(
    x: ArrayView2<f64>,
    basis: ArrayView2<f64>,
    initial: ArrayView2<f64>,
    penalty: Penalty,
    options: &GradientOptions,
) -> Result<Array2<f64>, SdlError> {
    check_code_shape(initial, basis, x)?;
    let mut objective = ReconstructionObjective {
        gram: basis.t().dot(&basis),
        target: basis.t().dot(&x),
        penalty,
    };
    projected_gradient_descent(initial, &mut objective, options)
}

/// Reconstruction-only code update of the filter schedule.
#[derive(Debug, Clone)]
pub struct ReconstructionCode {
    pub penalty: Penalty,
    pub sweeps: usize,
    /// Honour the relative-change stop. Off by default: the update always runs
    /// `sweeps` sweeps.
    pub check_stopping: bool,
    pub stopping_diff: f64,
    /// Rows whose per-sweep relative change falls below this are not revisited.
    pub skip_ratio: Option<f64>,
    /// Target Hoyer sparseness for every code row after the step.
    pub sparseness: Option<f64>,
}

impl ReconstructionCode {
    pub fn new(penalty: Penalty) -> Self {
        Self {
            penalty,
            sweeps: 2,
            check_stopping: false,
            stopping_diff: 1e-4,
            skip_ratio: Some(1e-6),
            sparseness: None,
        }
    }
}

impl CodeUpdate for ReconstructionCode {
    fn update(
        &self,
        code: ArrayView2<f64>,
        dictionary: ArrayView2<f64>,
        _: ArrayView2<f64>,
        inputs: &BlockInputs,
        _: &mut RunContext,
    ) -> Result<Array2<f64>, SdlError> {
        let options = GradientOptions::new("code", self.sweeps)
            .with_radius(inputs.radius)
            .with_nonnegativity(self.penalty.nonnegative)
            .with_stopping(self.check_stopping, self.stopping_diff)
            .with_skip_ratio(self.skip_ratio)
            .at_iteration(inputs.outer_iteration);
        let mut updated = reconstruction_step(inputs.x0, dictionary, code, self.penalty, &options)?;

        if let Some(target) = self.sparseness {
            for mut row in updated.axis_iter_mut(Axis(0)) {
                let projected = project_to_sparseness(row.view(), target);
                row.assign(&projected);
            }
            // The sparseness projection can leave the trust region; pull back and re-clamp.
            if let Some(radius) = inputs.radius {
                let mut centre = code.to_owned();
                if self.penalty.nonnegative {
                    centre.mapv_inplace(|v| v.max(0.0));
                }
                project_onto_ball(&mut updated, centre.view(), radius);
            }
            if self.penalty.nonnegative {
                updated.mapv_inplace(|v| v.max(0.0));
            }
        }
        Ok(updated)
    }
}

/// Reconstruction plus classification gradient for one row of `H`.
struct JointCodeObjective<'a> {
    gram: ArrayView2<'a, f64>,
    target: ArrayView2<'a, f64>,
    classifier: ArrayView2<'a, f64>,
    labels: ArrayView2<'a, f64>,
    aux: Option<ArrayView2<'a, f64>>,
    xi: f64,
    penalty: Penalty,
    rng: &'a mut StdRng,
    subsample: Option<usize>,
    columns: Vec<usize>,
}

impl JointCodeObjective<'_> {
    /// `σ(W1 · [1; H[:,j]; aux[:,j]]) − X1[:,j]` for every label row and sampled column.
    fn residual(&self, current: ArrayView2<f64>) -> Array2<f64> {
        let d2 = self.classifier.nrows();
        let r = current.nrows();
        let mut residual = Array2::<f64>::zeros((d2, self.columns.len()));
        for (pos, &j) in self.columns.iter().enumerate() {
            for i in 0..d2 {
                let w = self.classifier.row(i);
                let mut eta = w[0] + w.slice(s![1..=r]).dot(&current.column(j));
                if let Some(aux) = self.aux {
                    eta += w.slice(s![r + 1..]).dot(&aux.column(j));
                }
                residual[[i, pos]] = sigmoid(eta) - self.labels[[i, j]];
            }
        }
        residual
    }
}

impl RowObjective for JointCodeObjective<'_> {
    fn begin_sweep(&mut self, current: ArrayView2<f64>) -> Result<(), SdlError> {
        let n = current.ncols();
        self.columns = match self.subsample {
            Some(size) => (0..size).map(|_| self.rng.gen_range(0..n)).collect(),
            None => (0..n).collect(),
        };
        Ok(())
    }

    fn row_gradient(&self, current: ArrayView2<f64>, row: usize) -> Array1<f64> {
        let residual = self.residual(current);
        let mut grad = Array1::<f64>::zeros(current.ncols());
        for (pos, &j) in self.columns.iter().enumerate() {
            let reconstruction = self.gram.row(row).dot(&current.column(j)) - self.target[[row, j]];
            let classification: f64 = (0..self.classifier.nrows())
                .map(|i| self.classifier[[i, row + 1]] * residual[[i, pos]])
                .sum();
            grad[j] = self.xi * reconstruction + classification;
        }
        // Only sampled columns carry a penalty term; the rest stay put this sweep.
        let mut penalty = Array1::<f64>::zeros(current.ncols());
        self.penalty.add_gradient(&mut penalty, current.row(row));
        for &j in &self.columns {
            grad[j] += penalty[j];
        }
        grad
    }

    fn curvature(&self, row: usize) -> f64 {
        self.gram[[row, row]]
    }
}

/// Joint reconstruction + classification code update.
#[derive(Debug, Clone)]
pub struct JointCode {
    pub penalty: Penalty,
    pub sweeps: usize,
    pub stopping_diff: f64,
    /// Sample `n / ratio` columns (with replacement) per sweep.
    pub subsample_ratio: Option<usize>,
}

impl JointCode {
    pub fn new(penalty: Penalty, sweeps: usize) -> Self {
        Self {
            penalty,
            sweeps,
            stopping_diff: 1e-4,
            subsample_ratio: None,
        }
    }

    /// The update with a precomputed Gram pair `A = W0ᵗW0` and `B = W0ᵗX0`, for
    /// callers that solve many small problems against one dictionary.
    pub fn update_with_gram(
        &self,
        code: ArrayView2<f64>,
        gram: ArrayView2<f64>,
        target: ArrayView2<f64>,
        classifier: ArrayView2<f64>,
        inputs: &BlockInputs,
        rng: &mut StdRng,
    ) -> Result<Array2<f64>, SdlError> {
        let r = code.nrows();
        let d3 = inputs.x_aux.map_or(0, |a| a.nrows());
        if classifier.ncols() != r + 1 + d3 {
            return Err(SdlError::ShapeMismatch {
                what: "classifier columns",
                expected: r + 1 + d3,
                found: classifier.ncols(),
            });
        }
        if inputs.x1.ncols() != code.ncols() || target.dim() != code.dim() {
            return Err(SdlError::ShapeMismatch {
                what: "code samples",
                expected: code.ncols(),
                found: inputs.x1.ncols(),
            });
        }
        let n = code.ncols();
        let subsample = self
            .subsample_ratio
            .map(|ratio| (n / ratio.max(1)).max(1))
            .filter(|&size| size < n);
        let mut objective = JointCodeObjective {
            gram,
            target,
            classifier,
            labels: inputs.x1,
            aux: inputs.x_aux,
            xi: inputs.xi,
            penalty: self.penalty,
            rng,
            subsample,
            columns: Vec::new(),
        };
        let options = GradientOptions::new("code", self.sweeps)
            .with_radius(inputs.radius)
            .with_nonnegativity(self.penalty.nonnegative)
            .with_stopping(true, self.stopping_diff)
            .at_iteration(inputs.outer_iteration);
        projected_gradient_descent(code, &mut objective, &options)
    }
}

impl CodeUpdate for JointCode {
    fn update(
        &self,
        code: ArrayView2<f64>,
        dictionary: ArrayView2<f64>,
        classifier: ArrayView2<f64>,
        inputs: &BlockInputs,
        ctx: &mut RunContext,
    ) -> Result<Array2<f64>, SdlError> {
        check_code_shape(code, dictionary, inputs.x0)?;
        let gram = dictionary.t().dot(&dictionary);
        let target = dictionary.t().dot(&inputs.x0);
        self.update_with_gram(
            code,
            gram.view(),
            target.view(),
            classifier,
            inputs,
            &mut ctx.rng,
        )
    }
}

/// Uniform `[0, 1)` code, the starting point for code inference on unseen samples.
pub fn random_code(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
    Array2::from_shape_simple_fn((rows, cols), || rng.r#gen::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparsity::sparseness;
    use crate::types::{frobenius_norm, squared_distance};
    use ndarray::array;

    fn inputs<'a>(x0: &'a Array2<f64>, x1: &'a Array2<f64>, radius: Option<f64>) -> BlockInputs<'a> {
        BlockInputs {
            x0: x0.view(),
            x1: x1.view(),
            x_aux: None,
            xi: 1.0,
            radius,
            outer_iteration: 0,
        }
    }

    fn problem() -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let w = array![[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]];
        let h_true = array![[1.0, 0.0, 2.0, 0.5], [0.0, 1.5, 0.5, 1.0]];
        let x = w.dot(&h_true);
        (w, h_true, x)
    }

    #[test]
    fn reconstruction_update_reduces_error_and_stays_nonnegative() {
        let (w, _, x) = problem();
        let labels = Array2::<f64>::zeros((1, 4));
        let start = Array2::<f64>::from_elem((2, 4), 0.1);
        let mut ctx = RunContext::new(0);
        let updater = ReconstructionCode {
            sweeps: 30,
            ..ReconstructionCode::new(Penalty {
                nonnegative: true,
                ..Penalty::NONE
            })
        };
        let classifier = Array2::<f64>::zeros((1, 3));
        let h = updater
            .update(start.view(), w.view(), classifier.view(), &inputs(&x, &labels, None), &mut ctx)
            .unwrap();

        let before = squared_distance(w.dot(&start).view(), x.view());
        let after = squared_distance(w.dot(&h).view(), x.view());
        assert!(after < 0.1 * before, "{after} vs {before}");
        assert!(h.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn reconstruction_update_respects_the_trust_region() {
        let (w, _, x) = problem();
        let labels = Array2::<f64>::zeros((1, 4));
        let start = Array2::<f64>::from_elem((2, 4), 3.0);
        let mut ctx = RunContext::new(0);
        let updater = ReconstructionCode::new(Penalty {
            nonnegative: true,
            ..Penalty::NONE
        });
        let classifier = Array2::<f64>::zeros((1, 3));
        let h = updater
            .update(start.view(), w.view(), classifier.view(), &inputs(&x, &labels, Some(0.05)), &mut ctx)
            .unwrap();
        assert!(frobenius_norm(&(&h - &start)) <= 0.05 + 1e-10);
    }

    #[test]
    fn hoyer_option_sets_row_sparseness() {
        let (w, _, x) = problem();
        let labels = Array2::<f64>::zeros((1, 4));
        let start = Array2::<f64>::from_elem((2, 4), 0.5);
        let mut ctx = RunContext::new(0);
        let updater = ReconstructionCode {
            sparseness: Some(0.6),
            ..ReconstructionCode::new(Penalty {
                nonnegative: true,
                ..Penalty::NONE
            })
        };
        let classifier = Array2::<f64>::zeros((1, 3));
        let h = updater
            .update(start.view(), w.view(), classifier.view(), &inputs(&x, &labels, None), &mut ctx)
            .unwrap();
        for row in h.rows() {
            assert!((sparseness(row) - 0.6).abs() < 1e-6);
        }
    }

    #[test]
    fn hoyer_option_stays_inside_the_trust_region() {
        let w = array![[1.0], [1.0], [1.0], [1.0]];
        let x = array![[0.5, 0.6, 0.7, 0.8]];
        let x = w.dot(&x);
        let labels = Array2::<f64>::zeros((1, 4));
        let start = array![[0.5, 0.6, 0.7, 0.8]];
        let mut ctx = RunContext::new(0);
        let updater = ReconstructionCode {
            sparseness: Some(0.9),
            ..ReconstructionCode::new(Penalty {
                nonnegative: true,
                ..Penalty::NONE
            })
        };
        let classifier = Array2::<f64>::zeros((1, 2));
        let h = updater
            .update(start.view(), w.view(), classifier.view(), &inputs(&x, &labels, Some(0.01)), &mut ctx)
            .unwrap();
        assert!(frobenius_norm(&(&h - &start)) <= 0.01 + 1e-10);
        assert!(h.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn joint_update_pushes_codes_toward_their_labels() {
        let w = array![[1.0, 0.0], [0.0, 1.0]];
        let x = array![[1.0, 1.0], [1.0, 1.0]];
        let labels = array![[1.0, 0.0]];
        // Component 0 votes for the positive class.
        let classifier = array![[0.0, 4.0, 0.0]];
        let start = array![[1.0, 1.0], [1.0, 1.0]];
        let mut ctx = RunContext::new(3);
        let updater = JointCode::new(
            Penalty {
                nonnegative: true,
                ..Penalty::NONE
            },
            20,
        );
        let mut block_inputs = inputs(&x, &labels, None);
        block_inputs.xi = 0.1;
        let h = updater
            .update(start.view(), w.view(), classifier.view(), &block_inputs, &mut ctx)
            .unwrap();
        assert!(h[[0, 0]] > h[[0, 1]], "positive sample keeps more of component 0: {h:?}");
        assert!(h.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn subsampled_sweeps_only_touch_sampled_columns() {
        let (w, _, x) = problem();
        let labels = array![[1.0, 0.0, 1.0, 0.0]];
        let classifier = array![[0.1, 0.5, -0.5]];
        let start = Array2::<f64>::from_elem((2, 4), 0.7);
        let mut ctx = RunContext::new(11);
        let updater = JointCode {
            subsample_ratio: Some(4),
            ..JointCode::new(Penalty::NONE, 1)
        };
        let h = updater
            .update(start.view(), w.view(), classifier.view(), &inputs(&x, &labels, None), &mut ctx)
            .unwrap();
        let changed_columns = (0..4)
            .filter(|&j| h.column(j) != start.column(j))
            .count();
        assert_eq!(changed_columns, 1);
    }

    #[test]
    fn joint_update_is_reproducible_for_a_seed() {
        let (w, _, x) = problem();
        let labels = array![[1.0, 0.0, 1.0, 0.0]];
        let classifier = array![[0.1, 0.5, -0.5]];
        let start = Array2::<f64>::from_elem((2, 4), 0.7);
        let updater = JointCode {
            subsample_ratio: Some(2),
            ..JointCode::new(Penalty::NONE, 3)
        };
        let run = |seed| {
            let mut ctx = RunContext::new(seed);
            updater
                .update(start.view(), w.view(), classifier.view(), &inputs(&x, &labels, None), &mut ctx)
                .unwrap()
        };
        assert_eq!(run(5), run(5));
    }

    #[test]
    fn misaligned_classifier_is_a_shape_error() {
        let (w, _, x) = problem();
        let labels = Array2::<f64>::zeros((1, 4));
        let start = Array2::<f64>::zeros((2, 4));
        let mut ctx = RunContext::new(0);
        let classifier = Array2::<f64>::zeros((1, 5));
        assert!(matches!(
            JointCode::new(Penalty::NONE, 1).update(
                start.view(),
                w.view(),
                classifier.view(),
                &inputs(&x, &labels, None),
                &mut ctx
            ),
            Err(SdlError::ShapeMismatch { .. })
        ));
    }
}
