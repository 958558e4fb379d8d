//! # Dictionary Update
//!
//! The dictionary `W0` (`d1 × r`) is updated through its transpose `M = W0ᵗ`, so that
//! each row of the projected gradient loop is one dictionary atom. Two schedules
//! exist:
//!
//! - [`JointGradientDictionary`] (filter mode): the atoms are also the classifier's
//!   filters, so the gradient carries a classification term through the compressed
//!   features `W0ᵗX0`.
//! - [`CodeSpaceDictionary`] (feature mode): plain reconstruction, solved as the code
//!   problem with data and code swapped (`X0ᵗ ≈ Hᵗ W0ᵗ`).
//!
//! Either way the result is rescaled to unit Frobenius norm.

use crate::code::reconstruction_step;
use crate::projection::{
    GradientOptions, RowObjective, normalize_frobenius, projected_gradient_descent,
};
use crate::state::BlockInputs;
use crate::types::{Penalty, SdlError, extended_features, predict_probabilities};
use ndarray::{Array1, Array2, ArrayView2};

pub trait DictionaryUpdate {
    /// One round of projected gradient sweeps. Returns the new `W0` before
    /// normalization.
    fn step(
        &self,
        dictionary: ArrayView2<f64>,
        code: ArrayView2<f64>,
        classifier: ArrayView2<f64>,
        inputs: &BlockInputs,
    ) -> Result<Array2<f64>, SdlError>;

    /// [`step`](Self::step) followed by Frobenius normalization. A dictionary that
    /// collapses to zero is returned as is.
    fn update(
        &self,
        dictionary: ArrayView2<f64>,
        code: ArrayView2<f64>,
        classifier: ArrayView2<f64>,
        inputs: &BlockInputs,
    ) -> Result<Array2<f64>, SdlError> {
        let mut updated = self.step(dictionary, code, classifier, inputs)?;
        match normalize_frobenius(&mut updated, "dictionary") {
            Ok(()) => {}
            Err(SdlError::DegenerateNorm(what)) => {
                log::warn!(
                    "Iteration {}: {} has zero norm and was left unnormalized.",
                    inputs.outer_iteration,
                    what
                );
            }
            Err(e) => return Err(e),
        }
        Ok(updated)
    }
}

fn check_dictionary_shape(
    dictionary: ArrayView2<f64>,
    code: ArrayView2<f64>,
    inputs: &BlockInputs,
) -> Result<(), SdlError> {
    if dictionary.nrows() != inputs.x0.nrows() {
        return Err(SdlError::ShapeMismatch {
            what: "dictionary rows",
            expected: inputs.x0.nrows(),
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
    if code.ncols() != inputs.x0.ncols() {
        return Err(SdlError::ShapeMismatch {
            what: "code samples",
            expected: inputs.x0.ncols(),
            found: code.ncols(),
        });
    }
    Ok(())
}

/// Gradient of `ξ/2·||X0 − W0H||² + CE(W1·[1; W0ᵗX0; aux], X1)` with respect to
/// the rows of `M = W0ᵗ`.
struct JointDictionaryObjective<'a> {
    gram: Array2<f64>,
    code_data: Array2<f64>,
    classifier: ArrayView2<'a, f64>,
    x0: ArrayView2<'a, f64>,
    x1: ArrayView2<'a, f64>,
    aux: Option<ArrayView2<'a, f64>>,
    xi: f64,
    penalty: Penalty,
    /// `(P − X1) X0ᵗ`, refreshed every sweep.
    label_gradient: Array2<f64>,
}

impl RowObjective for JointDictionaryObjective<'_> {
    fn begin_sweep(&mut self, current: ArrayView2<f64>) -> Result<(), SdlError> {
        let compressed = current.dot(&self.x0);
        let design = extended_features(compressed.view(), self.aux)?;
        let residual = predict_probabilities(self.classifier, design.view()) - self.x1;
        self.label_gradient = residual.dot(&self.x0.t());
        Ok(())
    }

    fn row_gradient(&self, current: ArrayView2<f64>, row: usize) -> Array1<f64> {
        let mut grad = self.gram.row(row).dot(&current) - self.code_data.row(row);
        grad.mapv_inplace(|v| self.xi * v);
        for (j, label_row) in self.label_gradient.rows().into_iter().enumerate() {
            grad.scaled_add(self.classifier[[j, row + 1]], &label_row);
        }
        self.penalty.add_gradient(&mut grad, current.row(row));
        grad
    }

    fn curvature(&self, row: usize) -> f64 {
        self.gram[[row, row]]
    }
}

/// Filter-mode dictionary update: reconstruction and classification jointly.
#[derive(Debug, Clone)]
pub struct JointGradientDictionary {
    pub penalty: Penalty,
    pub sweeps: usize,
    pub stopping_diff: f64,
}

impl JointGradientDictionary {
    pub fn new(penalty: Penalty) -> Self {
        Self {
            penalty,
            sweeps: 5,
            stopping_diff: 1e-4,
        }
    }
}

impl DictionaryUpdate for JointGradientDictionary {
    fn step(
        &self,
        dictionary: ArrayView2<f64>,
        code: ArrayView2<f64>,
        classifier: ArrayView2<f64>,
        inputs: &BlockInputs,
    ) -> Result<Array2<f64>, SdlError> {
        check_dictionary_shape(dictionary, code, inputs)?;
        let d3 = inputs.x_aux.map_or(0, |a| a.nrows());
        if classifier.ncols() != dictionary.ncols() + 1 + d3 {
            return Err(SdlError::ShapeMismatch {
                what: "classifier columns",
                expected: dictionary.ncols() + 1 + d3,
                found: classifier.ncols(),
            });
        }
        let mut objective = JointDictionaryObjective {
            gram: code.dot(&code.t()),
            code_data: code.dot(&inputs.x0.t()),
            classifier,
            x0: inputs.x0,
            x1: inputs.x1,
            aux: inputs.x_aux,
            xi: inputs.xi,
            penalty: self.penalty,
            label_gradient: Array2::zeros((classifier.nrows(), inputs.x0.nrows())),
        };
        let options = GradientOptions::new("dictionary", self.sweeps)
            .with_radius(inputs.radius)
            .with_nonnegativity(self.penalty.nonnegative)
            .with_stopping(true, self.stopping_diff)
            .at_iteration(inputs.outer_iteration);
        let transposed = projected_gradient_descent(dictionary.t(), &mut objective, &options)?;
        Ok(transposed.reversed_axes())
    }
}

/// Feature-mode dictionary update: reconstruction only, in code space.
#[derive(Debug, Clone)]
pub struct CodeSpaceDictionary {
    pub penalty: Penalty,
    pub sweeps: usize,
    pub stopping_diff: f64,
}

impl CodeSpaceDictionary {
    pub fn new(penalty: Penalty) -> Self {
        Self {
            penalty,
            sweeps: 2,
            stopping_diff: 1e-4,
        }
    }
}

impl DictionaryUpdate for CodeSpaceDictionary {
    fn step(
        &self,
        dictionary: ArrayView2<f64>,
        code: ArrayView2<f64>,
        _: ArrayView2<f64>,
        inputs: &BlockInputs,
    ) -> Result<Array2<f64>, SdlError> {
        check_dictionary_shape(dictionary, code, inputs)?;
        let options = GradientOptions::new("dictionary", self.sweeps)
            .with_radius(inputs.radius)
            .with_nonnegativity(self.penalty.nonnegative)
            .with_stopping(true, self.stopping_diff)
            .at_iteration(inputs.outer_iteration);
        let transposed = reconstruction_step(
            inputs.x0.t(),
            code.t(),
            dictionary.t(),
            self.penalty,
            &options,
        )?;
        Ok(transposed.reversed_axes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{frobenius_norm, squared_distance};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn nonnegative() -> Penalty {
        Penalty {
            nonnegative: true,
            ..Penalty::NONE
        }
    }

    fn inputs<'a>(x0: &'a Array2<f64>, x1: &'a Array2<f64>, xi: f64) -> BlockInputs<'a> {
        BlockInputs {
            x0: x0.view(),
            x1: x1.view(),
            x_aux: None,
            xi,
            radius: None,
            outer_iteration: 0,
        }
    }

    fn factorization() -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let w = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let h = array![[1.0, 0.0, 2.0, 1.0], [0.0, 1.0, 1.0, 2.0]];
        let x = w.dot(&h);
        (w, h, x)
    }

    #[test]
    fn joint_update_ends_at_unit_norm_and_nonnegative() {
        let (_, h, x) = factorization();
        let labels = array![[1.0, 0.0, 1.0, 0.0]];
        let classifier = array![[0.0, 1.0, -1.0]];
        let start = Array2::<f64>::from_elem((3, 2), 0.5);
        let w = JointGradientDictionary::new(nonnegative())
            .update(start.view(), h.view(), classifier.view(), &inputs(&x, &labels, 1.0))
            .unwrap();
        assert_eq!(w.dim(), (3, 2));
        assert_abs_diff_eq!(frobenius_norm(&w), 1.0, epsilon = 1e-12);
        assert!(w.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn joint_gradient_without_labels_signal_fits_the_reconstruction() {
        let (w_true, h, x) = factorization();
        // Zero coefficients switch the classification term off.
        let classifier = array![[0.0, 0.0, 0.0]];
        let labels = array![[0.5, 0.5, 0.5, 0.5]];
        let start = Array2::<f64>::from_elem((3, 2), 0.3);
        let updater = JointGradientDictionary {
            sweeps: 200,
            stopping_diff: 0.0,
            ..JointGradientDictionary::new(nonnegative())
        };
        let w = updater
            .step(start.view(), h.view(), classifier.view(), &inputs(&x, &labels, 1.0))
            .unwrap();
        let before = squared_distance(start.view(), w_true.view());
        let after = squared_distance(w.view(), w_true.view());
        assert!(after < 0.05 * before, "{after} vs {before}");
    }

    #[test]
    fn classification_term_moves_filters_toward_the_positive_class() {
        // One feature only separates the classes; with reconstruction switched off the
        // atom should pick up weight on that feature.
        let x = array![[2.0, 0.0, 2.0, 0.0], [1.0, 1.0, 1.0, 1.0]];
        let labels = array![[1.0, 0.0, 1.0, 0.0]];
        let h = array![[1.0, 1.0, 1.0, 1.0]];
        let classifier = array![[0.0, 1.0]];
        let start = array![[0.5], [0.5]];
        let w = JointGradientDictionary::new(nonnegative())
            .step(start.view(), h.view(), classifier.view(), &inputs(&x, &labels, 0.0))
            .unwrap();
        // The discriminative feature gains weight, the constant one loses it.
        assert!(w[[0, 0]] > w[[1, 0]], "{w:?}");
    }

    #[test]
    fn code_space_update_reduces_reconstruction_error() {
        let (_, h, x) = factorization();
        let labels = Array2::<f64>::zeros((1, 4));
        let start = Array2::<f64>::from_elem((3, 2), 0.2);
        let updater = CodeSpaceDictionary {
            sweeps: 100,
            stopping_diff: 0.0,
            ..CodeSpaceDictionary::new(nonnegative())
        };
        let classifier = Array2::<f64>::zeros((1, 3));
        let w = updater
            .step(start.view(), h.view(), classifier.view(), &inputs(&x, &labels, 1.0))
            .unwrap();
        let before = squared_distance(start.dot(&h).view(), x.view());
        let after = squared_distance(w.dot(&h).view(), x.view());
        assert!(after < 0.05 * before, "{after} vs {before}");
    }

    #[test]
    fn trust_region_bounds_the_dictionary_step() {
        let (_, h, x) = factorization();
        let labels = array![[1.0, 0.0, 1.0, 0.0]];
        let classifier = array![[0.0, 1.0, -1.0]];
        let start = Array2::<f64>::from_elem((3, 2), 5.0);
        let mut block_inputs = inputs(&x, &labels, 1.0);
        block_inputs.radius = Some(0.01);
        let w = JointGradientDictionary::new(nonnegative())
            .step(start.view(), h.view(), classifier.view(), &block_inputs)
            .unwrap();
        assert!(frobenius_norm(&(&w - &start)) <= 0.01 + 1e-10);
    }

    #[test]
    fn collapsed_dictionary_is_left_unnormalized() {
        let (_, _, x) = factorization();
        let h = Array2::<f64>::zeros((2, 4));
        let labels = Array2::<f64>::zeros((1, 4));
        let classifier = Array2::<f64>::zeros((1, 3));
        // With an all-zero code only the L1 term acts, and it clamps every entry to zero.
        let updater = CodeSpaceDictionary::new(Penalty {
            l1: 1.0,
            l2: 0.0,
            nonnegative: true,
        });
        let start = Array2::<f64>::from_elem((3, 2), 0.1);
        let w = updater
            .update(start.view(), h.view(), classifier.view(), &inputs(&x, &labels, 1.0))
            .unwrap();
        assert!(w.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn mismatched_code_is_rejected() {
        let (w, _, x) = factorization();
        let labels = Array2::<f64>::zeros((1, 4));
        let classifier = Array2::<f64>::zeros((1, 3));
        let code = Array2::<f64>::zeros((3, 4));
        assert!(matches!(
            CodeSpaceDictionary::new(Penalty::NONE).update(
                w.view(),
                code.view(),
                classifier.view(),
                &inputs(&x, &labels, 1.0)
            ),
            Err(SdlError::ShapeMismatch { .. })
        ));
    }
}
