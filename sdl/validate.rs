//! Held-out scoring: classification metrics of a prediction plus the reconstruction
//! error of the test samples under the fitted dictionary.

use crate::data::HeldOut;
use crate::metrics::{ConfusionMatrix, RocCurve};
use crate::predict::{Prediction, Predictor};
use crate::sparse_code::SparseCoder;
use crate::state::{ResultState, RunContext, keys};
use crate::types::{SdlError, frobenius_norm};
use ndarray::ArrayView1;

/// Everything measured on one held-out pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub auc: f64,
    /// Youden threshold on the held-out probabilities.
    pub opt_threshold: f64,
    pub confusion: ConfusionMatrix,
    /// `||X_test − W0 H_test||` with a freshly sparse-coded test code.
    pub test_reconstruction_error: f64,
    pub test_relative_error: f64,
}

impl ValidationReport {
    pub fn accuracy(&self) -> f64 {
        self.confusion.accuracy()
    }

    /// Writes every metric into `results`, overwriting earlier passes.
    pub fn record(&self, results: &mut ResultState) {
        let m = &self.confusion;
        results.insert(keys::AUC, self.auc);
        results.insert(keys::OPT_THRESHOLD, self.opt_threshold);
        results.insert(keys::ACCURACY, m.accuracy());
        results.insert(keys::MISCLASSIFICATION, m.misclassification());
        results.insert(keys::PRECISION, m.precision());
        results.insert(keys::RECALL, m.recall());
        results.insert(keys::SENSITIVITY, m.recall());
        results.insert(keys::SPECIFICITY, m.specificity());
        results.insert(keys::FALL_OUT, m.fall_out());
        results.insert(keys::MISS_RATE, m.miss_rate());
        results.insert(keys::F1_SCORE, m.f1_score());
        results.insert(keys::TEST_RECONSTRUCTION_ERROR, self.test_reconstruction_error);
        results.insert(keys::TEST_RELATIVE_ERROR, self.test_relative_error);
    }
}

/// Scores `prediction` against the true labels. The reconstruction fields are zero;
/// [`validate`] fills them in.
pub fn score_prediction(labels: ArrayView1<f64>, prediction: &Prediction) -> ValidationReport {
    let roc = RocCurve::new(labels, prediction.p_pred.view());
    ValidationReport {
        auc: roc.auc(),
        opt_threshold: roc.youden_threshold(),
        confusion: ConfusionMatrix::new(labels, prediction.y_hat.view()),
        test_reconstruction_error: 0.0,
        test_relative_error: 0.0,
    }
}

/// Predicts the held-out samples with a calibrated predictor, scores the result and
/// merges the metrics into the run's results.
pub fn validate<C: SparseCoder>(
    predictor: &Predictor<C>,
    held_out: &HeldOut,
    ctx: &mut RunContext,
) -> Result<ValidationReport, SdlError> {
    let prediction = predictor.predict(held_out.x0.view(), held_out.x_aux.as_ref().map(|a| a.view()), ctx)?;
    let mut report = score_prediction(held_out.labels(), &prediction);

    if let Some(w0) = &predictor.loading().dictionary {
        let code = predictor.coder().encode(held_out.x0.view(), w0.view())?;
        let error = frobenius_norm(&(&held_out.x0 - &w0.dot(&code)));
        let norm = frobenius_norm(&held_out.x0);
        report.test_reconstruction_error = error;
        report.test_relative_error = if norm == 0.0 { 0.0 } else { error / norm };
    }

    report.record(&mut ctx.results);
    log::info!(
        "Validation ({}): AUC {:.3}, accuracy {:.3}, F1 {:.3}, relative test error {:.3}.",
        predictor.method(),
        report.auc,
        report.accuracy(),
        report.confusion.f1_score(),
        report.test_relative_error
    );
    Ok(report)
}
