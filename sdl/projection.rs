//! # Projected Gradient Primitive
//!
//! Every block update in the crate (dictionary, code, classifier) is the same loop:
//! walk the rows of a matrix, take a gradient step on each row with an adaptive
//! step size, then project back onto the feasible set. What differs between the
//! blocks is only the gradient, which is supplied through [`RowObjective`].
//!
//! ## Step size
//!
//! At sweep `i` the step for row `k` is `1 / (sqrt(i + 10) · (A[k,k] + 1))`, where
//! `A[k,k]` is the matching diagonal entry of the block's Gram matrix. The sweep
//! counter can be warm-started (`history`) so that the step keeps shrinking across
//! repeated calls instead of resetting every outer iteration.
//!
//! ## Feasible set
//!
//! Two constraints are enforced after every single row step:
//!
//! 1. The trust region: the whole matrix is pulled back onto the Frobenius ball of
//!    radius `r` around the matrix the call started from,
//!    `M1 = M0 + (r / max(r, ||M1 − M0||)) · (M1 − M0)`. The centre is the value at
//!    the start of the call, not the previous row step, so the bound holds across
//!    the whole inner loop.
//! 2. Non-negativity, by clamping. Clamping onto the orthant never moves a matrix
//!    away from a non-negative centre, so both constraints hold together as long as
//!    the centre itself is non-negative; it is clamped on entry to guarantee that.
//!
//! ## Stopping
//!
//! The loop ends at `end_iter` or, when enabled, once the relative change of a
//! whole sweep `||M1 − M1_prev|| / ||M1_prev||` drops below `stopping_diff`. A
//! zero-norm previous iterate never triggers the stop.

use crate::types::{SdlError, all_finite};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Dimension, Zip};

/// The gradient side of one block update.
pub trait RowObjective {
    /// Called once before every sweep with the current iterate. Objectives whose
    /// gradient depends on the whole matrix (predicted probabilities, sampled
    /// columns) refresh that state here.
    fn begin_sweep(&mut self, current: ArrayView2<f64>) -> Result<(), SdlError> {
        let _ = current;
        Ok(())
    }

    /// Gradient of the objective with respect to row `row` of `current`.
    fn row_gradient(&self, current: ArrayView2<f64>, row: usize) -> Array1<f64>;

    /// Diagonal Gram entry that scales the step for `row`.
    fn curvature(&self, row: usize) -> f64;
}

/// Loop controls for [`projected_gradient_descent`].
#[derive(Debug, Clone)]
pub struct GradientOptions {
    /// Name of the block being updated, used in error reports.
    pub block: &'static str,
    /// Outer iteration the call belongs to, used in error reports.
    pub outer_iteration: usize,
    /// First sweep index. Warm starts pass the number of sweeps already taken.
    pub start_iter: usize,
    /// Sweeps run while the counter is below this value.
    pub end_iter: usize,
    pub stopping_diff: f64,
    pub check_stopping: bool,
    pub radius: Option<f64>,
    pub nonnegative: bool,
    /// Rows whose relative change in a sweep falls below this ratio are frozen for
    /// the rest of the call.
    pub skip_ratio: Option<f64>,
}

impl GradientOptions {
    pub fn new(block: &'static str, sweeps: usize) -> Self {
        Self {
            block,
            outer_iteration: 0,
            start_iter: 0,
            end_iter: sweeps,
            stopping_diff: 1e-4,
            check_stopping: true,
            radius: None,
            nonnegative: false,
            skip_ratio: None,
        }
    }

    /// Shifts the sweep window by `history` sweeps, keeping its length.
    pub fn with_history(mut self, history: usize) -> Self {
        let sweeps = self.end_iter - self.start_iter;
        self.start_iter = history;
        self.end_iter = history + sweeps;
        self
    }

    pub fn with_radius(mut self, radius: Option<f64>) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_nonnegativity(mut self, nonnegative: bool) -> Self {
        self.nonnegative = nonnegative;
        self
    }

    pub fn with_stopping(mut self, check_stopping: bool, stopping_diff: f64) -> Self {
        self.check_stopping = check_stopping;
        self.stopping_diff = stopping_diff;
        self
    }

    pub fn with_skip_ratio(mut self, ratio: Option<f64>) -> Self {
        self.skip_ratio = ratio;
        self
    }

    pub fn at_iteration(mut self, outer_iteration: usize) -> Self {
        self.outer_iteration = outer_iteration;
        self
    }
}

/// Step size for sweep `sweep` and diagonal Gram entry `diag`.
#[inline]
pub fn step_size(sweep: usize, diag: f64) -> f64 {
    1.0 / (((sweep + 10) as f64).sqrt() * (diag + 1.0))
}

/// `||new − old|| / ||old||`, or `None` when `old` has zero norm.
pub fn relative_change<S1, S2, D>(new: &ArrayBase<S1, D>, old: &ArrayBase<S2, D>) -> Option<f64>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    let old_norm = old.iter().map(|v| v * v).sum::<f64>().sqrt();
    if old_norm == 0.0 {
        return None;
    }
    let diff = Zip::from(new)
        .and(old)
        .fold(0.0, |acc, &a, &b| acc + (a - b) * (a - b))
        .sqrt();
    Some(diff / old_norm)
}

/// Pulls `matrix` back onto the Frobenius ball of radius `radius` around `centre`.
pub fn project_onto_ball(matrix: &mut Array2<f64>, centre: ArrayView2<f64>, radius: f64) {
    let distance = Zip::from(&*matrix)
        .and(&centre)
        .fold(0.0, |acc, &m, &c| acc + (m - c) * (m - c))
        .sqrt();
    if distance <= radius {
        return;
    }
    let scale = radius / distance;
    Zip::from(matrix)
        .and(&centre)
        .for_each(|m, &c| *m = c + scale * (*m - c));
}

/// Divides the matrix by its Frobenius norm. Leaves it untouched and reports
/// `DegenerateNorm` when the norm is zero.
pub fn normalize_frobenius(matrix: &mut Array2<f64>, what: &'static str) -> Result<(), SdlError> {
    let norm = crate::types::frobenius_norm(&*matrix);
    if norm == 0.0 || !norm.is_finite() {
        return Err(SdlError::DegenerateNorm(what));
    }
    matrix.mapv_inplace(|v| v / norm);
    Ok(())
}

/// Runs row-wise projected gradient descent from `initial` and returns the new matrix.
pub fn projected_gradient_descent<O>(
    initial: ArrayView2<f64>,
    objective: &mut O,
    options: &GradientOptions,
) -> Result<Array2<f64>, SdlError>
where
    O: RowObjective + ?Sized,
{
    let mut centre = initial.to_owned();
    if options.nonnegative {
        centre.mapv_inplace(|v| v.max(0.0));
    }
    let mut current = centre.clone();
    let mut active = vec![true; current.nrows()];

    for sweep in options.start_iter..options.end_iter {
        let previous = current.clone();
        objective.begin_sweep(current.view())?;

        for k in 0..current.nrows() {
            if !active[k] {
                continue;
            }
            let grad = objective.row_gradient(current.view(), k);
            let step = step_size(sweep, objective.curvature(k));
            current.row_mut(k).scaled_add(-step, &grad);

            if let Some(radius) = options.radius {
                project_onto_ball(&mut current, centre.view(), radius);
            }
            if options.nonnegative {
                current.mapv_inplace(|v| v.max(0.0));
            }
            if let Some(ratio) = options.skip_ratio {
                if relative_change(&current.row(k), &previous.row(k)).is_some_and(|c| c < ratio) {
                    active[k] = false;
                }
            }
        }

        if !all_finite(&current) {
            return Err(SdlError::NumericalInstability {
                block: options.block,
                iteration: options.outer_iteration,
            });
        }

        if options.check_stopping {
            if let Some(change) = relative_change(&current, &previous) {
                if change < options.stopping_diff {
                    log::debug!(
                        "{} update converged after {} sweeps (relative change {:.2e}).",
                        options.block,
                        sweep + 1 - options.start_iter,
                        change
                    );
                    break;
                }
            }
        }
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::frobenius_norm;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// `½ ||M − T||²`, with a configurable Gram diagonal and a sweep counter.
    struct Quadratic {
        target: Array2<f64>,
        diag: f64,
        sweeps: usize,
    }

    impl RowObjective for Quadratic {
        fn begin_sweep(&mut self, _: ArrayView2<f64>) -> Result<(), SdlError> {
            self.sweeps += 1;
            Ok(())
        }

        fn row_gradient(&self, current: ArrayView2<f64>, row: usize) -> Array1<f64> {
            &current.row(row) - &self.target.row(row)
        }

        fn curvature(&self, _: usize) -> f64 {
            self.diag
        }
    }

    fn quadratic(target: Array2<f64>) -> Quadratic {
        Quadratic {
            target,
            diag: 0.0,
            sweeps: 0,
        }
    }

    #[test]
    fn step_size_decays_with_sweeps_and_curvature() {
        assert_abs_diff_eq!(step_size(0, 0.0), 1.0 / 10f64.sqrt(), epsilon = 1e-15);
        assert!(step_size(5, 0.0) < step_size(0, 0.0));
        assert!(step_size(0, 3.0) < step_size(0, 0.0));
    }

    #[test]
    fn descends_toward_the_target() {
        let target = array![[1.0, 2.0], [3.0, -1.0]];
        let start = Array2::<f64>::zeros((2, 2));
        let mut objective = quadratic(target.clone());
        let options = GradientOptions::new("test", 200).with_stopping(false, 0.0);
        let result = projected_gradient_descent(start.view(), &mut objective, &options).unwrap();

        let before = frobenius_norm(&(&start - &target));
        let after = frobenius_norm(&(&result - &target));
        assert!(after < 0.1 * before, "distance {after} vs {before}");
        assert_eq!(objective.sweeps, 200);
    }

    #[test]
    fn nonnegativity_holds_after_the_first_call() {
        let target = array![[-5.0, 2.0], [3.0, -7.0]];
        let start = array![[1.0, 1.0], [1.0, 1.0]];
        let mut objective = quadratic(target);
        let options = GradientOptions::new("test", 50).with_nonnegativity(true);
        let result = projected_gradient_descent(start.view(), &mut objective, &options).unwrap();
        assert!(result.iter().all(|&v| v >= 0.0));
        assert!(result[[0, 0]] < 1e-12 && result[[1, 1]] < 1e-12);
    }

    #[test]
    fn trust_region_bounds_the_total_displacement() {
        let mut rng = StdRng::seed_from_u64(7);
        for radius in [1e-3, 0.1, 0.5, 2.0] {
            let start = Array2::from_shape_fn((4, 6), |_| rng.r#gen::<f64>());
            let target = Array2::from_shape_fn((4, 6), |_| 20.0 * rng.r#gen::<f64>() - 10.0);
            let mut objective = quadratic(target);
            let options = GradientOptions::new("test", 30)
                .with_radius(Some(radius))
                .with_nonnegativity(true);
            let result =
                projected_gradient_descent(start.view(), &mut objective, &options).unwrap();
            let moved = frobenius_norm(&(&result - &start));
            assert!(moved <= radius + 1e-10, "moved {moved} with radius {radius}");
            assert!(result.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn relative_change_guards_zero_norm() {
        let zero = Array2::<f64>::zeros((2, 2));
        let other = array![[1.0, 0.0], [0.0, 0.0]];
        assert_eq!(relative_change(&other, &zero), None);
        assert_abs_diff_eq!(relative_change(&zero, &other).unwrap(), 1.0);
    }

    #[test]
    fn zero_start_does_not_trigger_the_stopping_rule() {
        let target = array![[1.0, 1.0]];
        let start = Array2::<f64>::zeros((1, 2));
        let mut objective = quadratic(target);
        let options = GradientOptions::new("test", 5).with_stopping(true, 0.5);
        let result = projected_gradient_descent(start.view(), &mut objective, &options).unwrap();
        assert!(result.iter().all(|v| v.is_finite()));
        assert!(objective.sweeps >= 2);
    }

    #[test]
    fn stopping_rule_ends_the_loop_early() {
        let target = array![[1.0, 2.0, 3.0]];
        let mut objective = quadratic(target.clone());
        let options = GradientOptions::new("test", 100).with_stopping(true, 1e-3);
        projected_gradient_descent(target.view(), &mut objective, &options).unwrap();
        assert_eq!(objective.sweeps, 1, "already optimal, one sweep is enough");
    }

    #[test]
    fn history_shortens_the_first_step() {
        let target = array![[10.0]];
        let start = array![[0.0]];
        let options = GradientOptions::new("test", 1).with_stopping(false, 0.0);

        let fresh = projected_gradient_descent(start.view(), &mut quadratic(target.clone()), &options)
            .unwrap();
        let warm = projected_gradient_descent(
            start.view(),
            &mut quadratic(target),
            &options.clone().with_history(90),
        )
        .unwrap();
        assert_abs_diff_eq!(fresh[[0, 0]], 10.0 / 10f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(warm[[0, 0]], 10.0 / 100f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn non_finite_gradients_abort_with_instability() {
        struct Broken;
        impl RowObjective for Broken {
            fn row_gradient(&self, current: ArrayView2<f64>, _: usize) -> Array1<f64> {
                Array1::from_elem(current.ncols(), f64::NAN)
            }
            fn curvature(&self, _: usize) -> f64 {
                0.0
            }
        }
        let start = array![[1.0, 2.0]];
        let options = GradientOptions::new("classifier", 3).at_iteration(4);
        assert!(matches!(
            projected_gradient_descent(start.view(), &mut Broken, &options),
            Err(SdlError::NumericalInstability { block: "classifier", iteration: 4 })
        ));
    }

    #[test]
    fn normalization_refuses_zero_matrices() {
        let mut zero = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            normalize_frobenius(&mut zero, "dictionary"),
            Err(SdlError::DegenerateNorm("dictionary"))
        ));
        let mut m = array![[3.0, 0.0], [0.0, 4.0]];
        normalize_frobenius(&mut m, "dictionary").unwrap();
        assert_abs_diff_eq!(frobenius_norm(&m), 1.0, epsilon = 1e-12);
    }
}
