//! # Prediction
//!
//! A fitted [`Loading`] scores unseen samples by first inferring their code and then
//! applying the classifier. The four [`PredictionMethod`]s differ only in how the code
//! is inferred:
//!
//! | method       | code for unseen `X`                                            |
//! |--------------|-----------------------------------------------------------------|
//! | `filter`     | `W0ᵗX`                                                          |
//! | `naive`      | sparse code of `X` against `W0`                                 |
//! | `alt`        | alternate joint code updates with soft-label refreshes          |
//! | `exhaustive` | per sample, code under each label; keep the lower total loss    |
//!
//! Hard labels come from thresholding the probabilities at an operating point chosen
//! on the training data (Youden's J), except for `exhaustive`, which decides the label
//! directly.

use crate::code::{JointCode, random_code};
use crate::config::{PredictionMethod, SdlConfig};
use crate::metrics::auc_and_threshold;
use crate::sparse_code::{CoordinateDescentLasso, SparseCoder};
use crate::state::{BlockInputs, Loading, ResultState, RunContext, keys};
use crate::types::{Penalty, SdlError, softplus, squared_distance, threshold_labels};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use rand::Rng;

/// Output of one prediction run.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Positive-class probabilities, one per sample.
    pub p_pred: Array1<f64>,
    /// Inferred code, `r × n`.
    pub code: Array2<f64>,
    /// Hard 0/1 labels.
    pub y_hat: Array1<f64>,
}

/// Read-only view of the fitted model handed to a [`PredictionStrategy`].
pub struct InferenceModel<'a> {
    pub loading: &'a Loading,
    pub xi: f64,
    pub code_penalty: Penalty,
    pub coder: &'a dyn SparseCoder,
}

impl InferenceModel<'_> {
    /// `W0`, or the identity of size `d1` in full-dimension mode.
    pub fn dictionary(&self, d1: usize) -> Array2<f64> {
        match &self.loading.dictionary {
            Some(w0) => w0.clone(),
            None => Array2::eye(d1),
        }
    }

    /// Sparse code of `x` against the dictionary. Full-dimension models pass `x` through.
    pub fn encode(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, SdlError> {
        match &self.loading.dictionary {
            Some(w0) => self.coder.encode(x, w0.view()),
            None => Ok(x.to_owned()),
        }
    }

    pub fn probabilities(
        &self,
        code: ArrayView2<f64>,
        aux: Option<ArrayView2<f64>>,
    ) -> Result<Array1<f64>, SdlError> {
        crate::classifier::probabilities(self.loading.classifier.view(), code, aux)
    }
}

/// Code inferred for unseen samples, plus labels when the strategy decides them itself.
#[derive(Debug, Clone)]
pub struct CodeInference {
    pub code: Array2<f64>,
    pub labels: Option<Array1<f64>>,
}

impl CodeInference {
    fn code_only(code: Array2<f64>) -> Self {
        Self { code, labels: None }
    }
}

pub trait PredictionStrategy {
    fn method(&self) -> PredictionMethod;

    fn infer(
        &self,
        model: &InferenceModel,
        x0: ArrayView2<f64>,
        x_aux: Option<ArrayView2<f64>>,
        ctx: &mut RunContext,
    ) -> Result<CodeInference, SdlError>;
}

pub struct FilterStrategy;

impl PredictionStrategy for FilterStrategy {
    fn method(&self) -> PredictionMethod {
        PredictionMethod::Filter
    }

    fn infer(
        &self,
        model: &InferenceModel,
        x0: ArrayView2<f64>,
        _: Option<ArrayView2<f64>>,
        _: &mut RunContext,
    ) -> Result<CodeInference, SdlError> {
        Ok(CodeInference::code_only(model.loading.compress(x0)))
    }
}

pub struct NaiveStrategy;

impl PredictionStrategy for NaiveStrategy {
    fn method(&self) -> PredictionMethod {
        PredictionMethod::Naive
    }

    fn infer(
        &self,
        model: &InferenceModel,
        x0: ArrayView2<f64>,
        _: Option<ArrayView2<f64>>,
        _: &mut RunContext,
    ) -> Result<CodeInference, SdlError> {
        Ok(CodeInference::code_only(model.encode(x0)?))
    }
}

/// Alternates between a joint code update against the current soft labels and a
/// refresh of those labels from the new code.
pub struct AltStrategy {
    pub rounds: usize,
    pub sweeps: usize,
    /// Round `k` searches within `radius_const / (k + 1)` of the previous code.
    pub radius_const: f64,
}

impl AltStrategy {
    pub fn new(rounds: usize) -> Self {
        Self {
            rounds,
            sweeps: 2,
            radius_const: 10.0,
        }
    }
}

impl PredictionStrategy for AltStrategy {
    fn method(&self) -> PredictionMethod {
        PredictionMethod::Alt
    }

    fn infer(
        &self,
        model: &InferenceModel,
        x0: ArrayView2<f64>,
        x_aux: Option<ArrayView2<f64>>,
        ctx: &mut RunContext,
    ) -> Result<CodeInference, SdlError> {
        let dictionary = model.dictionary(x0.nrows());
        let gram = dictionary.t().dot(&dictionary);
        let target = dictionary.t().dot(&x0);
        let n = x0.ncols();

        let mut code = random_code(dictionary.ncols(), n, &mut ctx.rng);
        let mut soft_labels = Array2::from_shape_simple_fn((1, n), || ctx.rng.r#gen::<f64>());
        let updater = JointCode::new(model.code_penalty, self.sweeps);

        for round in 0..self.rounds {
            let inputs = BlockInputs {
                x0,
                x1: soft_labels.view(),
                x_aux,
                xi: model.xi,
                radius: Some(self.radius_const / (round + 1) as f64),
                outer_iteration: round,
            };
            code = updater.update_with_gram(
                code.view(),
                gram.view(),
                target.view(),
                model.loading.classifier.view(),
                &inputs,
                &mut ctx.rng,
            )?;
            soft_labels = model
                .probabilities(code.view(), x_aux)?
                .insert_axis(Axis(0));
        }
        Ok(CodeInference::code_only(code))
    }
}

/// Tries both labels for every sample and keeps the one whose joint code attains the
/// lower loss `softplus(η) − y·η + ξ·||x − W0h||²`.
pub struct ExhaustiveStrategy {
    pub sweeps: usize,
    pub stopping_diff: f64,
}

impl ExhaustiveStrategy {
    pub fn new(sweeps: usize) -> Self {
        Self {
            sweeps,
            stopping_diff: 1e-3,
        }
    }
}

impl PredictionStrategy for ExhaustiveStrategy {
    fn method(&self) -> PredictionMethod {
        PredictionMethod::Exhaustive
    }

    fn infer(
        &self,
        model: &InferenceModel,
        x0: ArrayView2<f64>,
        x_aux: Option<ArrayView2<f64>>,
        ctx: &mut RunContext,
    ) -> Result<CodeInference, SdlError> {
        let dictionary = model.dictionary(x0.nrows());
        let gram = dictionary.t().dot(&dictionary);
        let r = dictionary.ncols();
        let n = x0.ncols();
        let classifier = model.loading.classifier.view();
        let updater = JointCode {
            stopping_diff: self.stopping_diff,
            ..JointCode::new(model.code_penalty, self.sweeps)
        };

        let mut code = Array2::<f64>::zeros((r, n));
        let mut labels = Array1::<f64>::zeros(n);
        for i in 0..n {
            let x = x0.slice(s![.., i..=i]);
            let aux = x_aux.map(|a| a.slice_move(s![.., i..=i]));
            let target = dictionary.t().dot(&x);

            let mut best: Option<(f64, f64, Array2<f64>)> = None;
            for guess in [0.0, 1.0] {
                let label = Array2::from_elem((1, 1), guess);
                let inputs = BlockInputs {
                    x0: x,
                    x1: label.view(),
                    x_aux: aux,
                    xi: model.xi,
                    radius: None,
                    outer_iteration: i,
                };
                let start = random_code(r, 1, &mut ctx.rng);
                let h = updater.update_with_gram(
                    start.view(),
                    gram.view(),
                    target.view(),
                    classifier,
                    &inputs,
                    &mut ctx.rng,
                )?;
                let eta = joint_logit(
                    classifier.row(0),
                    h.column(0),
                    aux.map(|a| a.index_axis_move(Axis(1), 0)),
                );
                let reconstruction = squared_distance(x, dictionary.dot(&h).view());
                let loss = softplus(eta) - guess * eta + model.xi * reconstruction;
                if best.as_ref().is_none_or(|(lowest, _, _)| loss < *lowest) {
                    best = Some((loss, guess, h));
                }
            }
            if let Some((_, guess, h)) = best {
                labels[i] = guess;
                code.column_mut(i).assign(&h.column(0));
            }
        }
        Ok(CodeInference {
            code,
            labels: Some(labels),
        })
    }
}

fn joint_logit(weights: ArrayView1<f64>, h: ArrayView1<f64>, aux: Option<ArrayView1<f64>>) -> f64 {
    let r = h.len();
    let mut eta = weights[0] + weights.slice(s![1..=r]).dot(&h);
    if let Some(aux) = aux {
        eta += weights.slice(s![r + 1..]).dot(&aux);
    }
    eta
}

/// The strategy for `method`, with round and sweep counts taken from `config`.
pub fn strategy_for(method: PredictionMethod, config: &SdlConfig) -> Box<dyn PredictionStrategy> {
    match method {
        PredictionMethod::Filter => Box::new(FilterStrategy),
        PredictionMethod::Naive => Box::new(NaiveStrategy),
        PredictionMethod::Alt => Box::new(AltStrategy::new(config.alt_rounds)),
        PredictionMethod::Exhaustive => Box::new(ExhaustiveStrategy::new(config.exhaustive_sweeps)),
    }
}

/// A fitted model bound to one prediction method and an operating threshold.
pub struct Predictor<C: SparseCoder = CoordinateDescentLasso> {
    loading: Loading,
    xi: f64,
    code_penalty: Penalty,
    coder: C,
    strategy: Box<dyn PredictionStrategy>,
    threshold: Option<f64>,
}

impl Predictor<CoordinateDescentLasso> {
    /// Builds a predictor whose sparse coder and code constraints follow `config`.
    pub fn new(loading: Loading, xi: f64, config: &SdlConfig, method: PredictionMethod) -> Self {
        let coder = CoordinateDescentLasso {
            positive: config.nonnegativity.code,
            ..CoordinateDescentLasso::new(config.sparse_code_alpha)
        };
        Self {
            loading,
            xi,
            code_penalty: config.code_penalty(),
            coder,
            strategy: strategy_for(method, config),
            threshold: None,
        }
    }

    /// Rebuilds a predictor from a saved run: loading, ξ and training threshold.
    pub fn from_results(
        results: &ResultState,
        config: &SdlConfig,
        method: PredictionMethod,
    ) -> Result<Self, SdlError> {
        let classifier = results
            .matrix(keys::CLASSIFIER)
            .ok_or_else(|| missing_entry(keys::CLASSIFIER))?
            .clone();
        let loading = Loading {
            dictionary: results.matrix(keys::DICTIONARY).cloned(),
            classifier,
        };
        let xi = results
            .scalar(keys::XI)
            .ok_or_else(|| missing_entry(keys::XI))?;
        let predictor = Self::new(loading, xi, config, method);
        Ok(match results.scalar(keys::TRAINING_THRESHOLD) {
            Some(threshold) => predictor.with_threshold(threshold),
            None => predictor,
        })
    }
}

fn missing_entry(key: &str) -> SdlError {
    SdlError::Configuration(format!("result file has no '{key}' entry"))
}

impl<C: SparseCoder> Predictor<C> {
    /// Replaces the sparse coder used by `naive` predictions and training calibration.
    pub fn with_coder<D: SparseCoder>(self, coder: D) -> Predictor<D> {
        Predictor {
            loading: self.loading,
            xi: self.xi,
            code_penalty: self.code_penalty,
            coder,
            strategy: self.strategy,
            threshold: self.threshold,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    pub fn method(&self) -> PredictionMethod {
        self.strategy.method()
    }

    pub fn loading(&self) -> &Loading {
        &self.loading
    }

    pub fn coder(&self) -> &C {
        &self.coder
    }

    fn model(&self) -> InferenceModel<'_> {
        InferenceModel {
            loading: &self.loading,
            xi: self.xi,
            code_penalty: self.code_penalty,
            coder: &self.coder,
        }
    }

    /// Scores the training set and sets the operating threshold to its Youden point.
    /// `filter` scores compressed features; every other method scores sparse codes.
    /// Returns the training AUC and the threshold.
    pub fn calibrate(
        &mut self,
        x0: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        x_aux: Option<ArrayView2<f64>>,
    ) -> Result<(f64, f64), SdlError> {
        let model = self.model();
        let features = match self.method() {
            PredictionMethod::Filter => self.loading.compress(x0),
            _ => model.encode(x0)?,
        };
        let scores = model.probabilities(features.view(), x_aux)?;
        let (auc, threshold) = auc_and_threshold(labels, scores.view());
        self.threshold = Some(threshold);
        Ok((auc, threshold))
    }

    /// Predicts labels for `x0` (`d1 × m`) and records `code_test`, `p_pred`, `y_hat`
    /// and the method in the run's results.
    pub fn predict(
        &self,
        x0: ArrayView2<f64>,
        x_aux: Option<ArrayView2<f64>>,
        ctx: &mut RunContext,
    ) -> Result<Prediction, SdlError> {
        // Exhaustive inference labels the samples itself.
        if self.threshold.is_none() && self.method() != PredictionMethod::Exhaustive {
            return Err(missing_threshold());
        }
        let d1 = self.loading.dictionary.as_ref().map_or(
            self.loading
                .classifier
                .ncols()
                .saturating_sub(1 + x_aux.map_or(0, |a| a.nrows())),
            |w0| w0.nrows(),
        );
        if x0.nrows() != d1 {
            return Err(SdlError::ShapeMismatch {
                what: "prediction feature rows",
                expected: d1,
                found: x0.nrows(),
            });
        }

        let model = self.model();
        let inference = self.strategy.infer(&model, x0, x_aux, ctx)?;
        let p_pred = model.probabilities(inference.code.view(), x_aux)?;
        let y_hat = match (inference.labels, self.threshold) {
            (Some(labels), _) => labels,
            (None, Some(threshold)) => threshold_labels(p_pred.view(), threshold),
            (None, None) => return Err(missing_threshold()),
        };
        log::info!(
            "Predicted {} samples with the '{}' method ({} positive).",
            p_pred.len(),
            self.method(),
            y_hat.iter().filter(|&&y| y > 0.5).count()
        );

        ctx.record(keys::CODE_TEST, inference.code.clone());
        ctx.record(keys::P_PRED, p_pred.clone());
        ctx.record(keys::Y_HAT, y_hat.clone());
        ctx.record(keys::PREDICTION_METHOD, self.method().as_str());
        Ok(Prediction {
            p_pred,
            code: inference.code,
            y_hat,
        })
    }
}

fn missing_threshold() -> SdlError {
    SdlError::Configuration(
        "no prediction threshold; calibrate on training data or supply one".to_string(),
    )
}
