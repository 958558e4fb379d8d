//! # Block Coordinate Descent
//!
//! [`SupervisedDictionaryLearner`] owns the data, the current blocks (dictionary,
//! code, classifier) and the run context, and drives the outer loop:
//!
//! ```text
//! for t in 0..iterations:
//!     radius = c · (t + 1)^(−β) / ln(t + 2)
//!     filter:    dictionary (every k-th t) → code (reconstruction) → classifier (closed form on W0ᵗX0)
//!     feature:   dictionary (every k-th t) → classifier (closed form on H) → code (joint, subsampled)
//!     full_dim:  classifier (one warm-started projected gradient sweep); H = X0
//!     ξ re-estimate (optional)
//!     every 10th t: training loss checkpoint, early stopping, held-out validation
//! ```
//!
//! After the loop the filter schedule refits its classifier on the final compressed
//! features, the training operating threshold is recorded and, when held-out data
//! exists, a final validation pass runs.

use crate::classifier::{
    BfgsLogisticRegression, ClosedFormClassifier, TrustRegionClassifier, classification_loss,
    probabilities,
};
use crate::code::{CodeUpdate, JointCode, ReconstructionCode, random_code};
use crate::config::{FitMode, PredictionMethod, SdlConfig};
use crate::data::DataSet;
use crate::dictionary::{CodeSpaceDictionary, DictionaryUpdate, JointGradientDictionary};
use crate::metrics::auc_and_threshold;
use crate::predict::{Prediction, Predictor};
use crate::state::{BlockInputs, Loading, ResultState, RunContext, keys};
use crate::types::{SdlError, squared_distance};
use crate::validate::{ValidationReport, validate};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{Array2, ArrayView2};
use rand::Rng;
use std::io::IsTerminal;
use std::time::Instant;

/// Outer iterations between training-loss checkpoints.
const CHECKPOINT_INTERVAL: usize = 10;
/// Held-out accuracy above which training stops.
const VALIDATION_ACCURACY_STOP: f64 = 0.99;

/// Why the outer loop ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Termination {
    MaxIterReached,
    /// The training loss rose at the checkpoint of this iteration.
    EarlyStopped { iteration: usize },
    /// Held-out accuracy crossed the stopping level at this iteration.
    ValidationStopped { iteration: usize, accuracy: f64 },
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::MaxIterReached => "max_iter_reached",
            Termination::EarlyStopped { .. } => "early_stopped",
            Termination::ValidationStopped { .. } => "validation_stopped",
        }
    }

    pub fn stopped_iteration(&self) -> Option<usize> {
        match self {
            Termination::MaxIterReached => None,
            Termination::EarlyStopped { iteration }
            | Termination::ValidationStopped { iteration, .. } => Some(*iteration),
        }
    }
}

/// Stops when a checkpoint's total loss exceeds the previous one by more than
/// `tolerance` (relative).
#[derive(Debug, Clone)]
struct EarlyStopping {
    previous: Option<f64>,
    tolerance: f64,
}

impl EarlyStopping {
    fn new() -> Self {
        Self {
            previous: None,
            tolerance: 1e-3,
        }
    }

    fn should_stop(&mut self, loss: f64) -> bool {
        if let Some(previous) = self.previous {
            if previous > 0.0 && loss > (1.0 + self.tolerance) * previous {
                return true;
            }
        }
        self.previous = Some(loss);
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Filter,
    Feature,
    FullDim,
}

impl Schedule {
    fn from_config(config: &SdlConfig) -> Self {
        match (config.full_dim, config.option) {
            (true, _) => Schedule::FullDim,
            (false, FitMode::Filter) => Schedule::Filter,
            (false, FitMode::Feature) => Schedule::Feature,
        }
    }
}

/// The update rule of every block, chosen once from the schedule.
struct UpdateRules {
    dictionary: Box<dyn DictionaryUpdate>,
    code: Box<dyn CodeUpdate>,
    closed_form: ClosedFormClassifier<BfgsLogisticRegression>,
    trust_region: TrustRegionClassifier,
}

impl UpdateRules {
    fn new(schedule: Schedule, config: &SdlConfig) -> Self {
        let (dictionary, code): (Box<dyn DictionaryUpdate>, Box<dyn CodeUpdate>) = match schedule {
            Schedule::Feature => (
                Box::new(CodeSpaceDictionary::new(config.dictionary_penalty())),
                Box::new(JointCode {
                    subsample_ratio: Some(config.subsample_ratio),
                    ..JointCode::new(config.code_penalty(), 2)
                }),
            ),
            Schedule::Filter | Schedule::FullDim => (
                Box::new(JointGradientDictionary::new(config.dictionary_penalty())),
                Box::new(ReconstructionCode {
                    check_stopping: config.code_stopping_check,
                    sparseness: config.code_sparseness,
                    ..ReconstructionCode::new(config.code_penalty())
                }),
            ),
        };
        Self {
            dictionary,
            code,
            closed_form: ClosedFormClassifier::new(BfgsLogisticRegression::default()),
            trust_region: TrustRegionClassifier {
                penalty: config.classifier_penalty(),
                sweeps: 1,
                stopping_diff: 1e-4,
            },
        }
    }
}

/// Losses measured at a checkpoint.
#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    data_error: f64,
    label_error: f64,
    total: f64,
}

fn block_inputs<'a>(
    data: &'a DataSet,
    xi: f64,
    radius: Option<f64>,
    outer_iteration: usize,
) -> BlockInputs<'a> {
    BlockInputs {
        x0: data.x0.view(),
        x1: data.x1.view(),
        x_aux: data.x_aux.as_ref().map(|a| a.view()),
        xi,
        radius,
        outer_iteration,
    }
}

fn missing_dictionary() -> SdlError {
    SdlError::Configuration("no dictionary outside full-dimension mode".to_string())
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    let draw_target = if visible && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message("BCD iterations");
    pb
}

/// Supervised dictionary learner: state plus the outer loop.
pub struct SupervisedDictionaryLearner {
    data: DataSet,
    config: SdlConfig,
    schedule: Schedule,
    rules: UpdateRules,
    loading: Loading,
    code: Array2<f64>,
    xi: f64,
    ctx: RunContext,
}

impl SupervisedDictionaryLearner {
    /// Validates the configuration and draws the initial blocks from the seeded RNG:
    /// code, then dictionary, then classifier.
    pub fn new(data: DataSet, config: SdlConfig) -> Result<Self, SdlError> {
        config.validate()?;
        let schedule = Schedule::from_config(&config);
        let mut ctx = RunContext::new(config.seed);
        let (d1, n, d3) = (data.n_features(), data.n_samples(), data.n_aux());

        let (code, loading) = if schedule == Schedule::FullDim {
            let classifier = random_code(1, d1 + 1 + d3, &mut ctx.rng);
            (
                data.x0.clone(),
                Loading {
                    dictionary: None,
                    classifier,
                },
            )
        } else {
            let r = config.n_components;
            let code = random_code(r, n, &mut ctx.rng);
            let dictionary = random_code(d1, r, &mut ctx.rng);
            let classifier =
                Array2::from_shape_simple_fn((1, r + 1 + d3), || 1.0 - 2.0 * ctx.rng.r#gen::<f64>());
            (
                code,
                Loading {
                    dictionary: Some(dictionary),
                    classifier,
                },
            )
        };

        let mut learner = Self {
            rules: UpdateRules::new(schedule, &config),
            xi: config.xi.unwrap_or(0.0),
            data,
            config,
            schedule,
            loading,
            code,
            ctx,
        };
        if learner.config.xi.is_none() {
            learner.xi = learner.estimate_xi();
        }
        Ok(learner)
    }

    /// Replaces the random initial code. Not available in full-dimension mode, where
    /// the code is the data.
    pub fn with_initial_code(mut self, code: Array2<f64>) -> Result<Self, SdlError> {
        if self.schedule == Schedule::FullDim {
            return Err(SdlError::Configuration(
                "the code is fixed to the data in full-dimension mode".to_string(),
            ));
        }
        if code.dim() != self.code.dim() {
            return Err(SdlError::ShapeMismatch {
                what: "initial code",
                expected: self.code.len(),
                found: code.len(),
            });
        }
        self.code = code;
        if self.config.xi.is_none() {
            self.xi = self.estimate_xi();
        }
        Ok(self)
    }

    /// Replaces the random initial dictionary and classifier.
    pub fn with_initial_loading(mut self, loading: Loading) -> Result<Self, SdlError> {
        match (&loading.dictionary, &self.loading.dictionary) {
            (Some(new), Some(old)) if new.dim() != old.dim() => {
                return Err(SdlError::ShapeMismatch {
                    what: "initial dictionary",
                    expected: old.len(),
                    found: new.len(),
                });
            }
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(SdlError::Configuration(
                    "a dictionary is required exactly when full_dim is off".to_string(),
                ));
            }
        }
        if loading.classifier.dim() != self.loading.classifier.dim() {
            return Err(SdlError::ShapeMismatch {
                what: "initial classifier columns",
                expected: self.loading.classifier.ncols(),
                found: loading.classifier.ncols(),
            });
        }
        self.loading = loading;
        if self.config.xi.is_none() {
            self.xi = self.estimate_xi();
        }
        Ok(self)
    }

    pub fn config(&self) -> &SdlConfig {
        &self.config
    }

    pub fn data(&self) -> &DataSet {
        &self.data
    }

    pub fn loading(&self) -> &Loading {
        &self.loading
    }

    pub fn code(&self) -> ArrayView2<'_, f64> {
        self.code.view()
    }

    pub fn xi(&self) -> f64 {
        self.xi
    }

    pub fn results(&self) -> &ResultState {
        &self.ctx.results
    }

    pub fn into_results(self) -> ResultState {
        self.ctx.results
    }

    /// Maximum-likelihood nuisance weight `||X0 − W0H||² / (2·r·n)`.
    fn estimate_xi(&self) -> f64 {
        let reconstruction = self.loading.reconstruct(self.code.view());
        let error = squared_distance(self.data.x0.view(), reconstruction.view());
        error / (2.0 * (self.code.nrows() * self.code.ncols()) as f64)
    }

    /// Runs the outer loop. On error the results gathered so far stay available
    /// through [`results`](Self::results).
    pub fn fit(&mut self) -> Result<Termination, SdlError> {
        let started = Instant::now();
        log::info!(
            "Fitting {:?} schedule: {} features, {} samples, {} auxiliary rows, rank {}, {} iterations.",
            self.schedule,
            self.data.n_features(),
            self.data.n_samples(),
            self.data.n_aux(),
            self.code.nrows(),
            self.config.iterations
        );
        self.record_metadata();

        let pb = progress_bar(self.config.iterations as u64, self.config.show_progress);
        let outcome = self.run_iterations(&pb);
        pb.finish_and_clear();
        let (termination, steps) = outcome?;

        match termination {
            Termination::MaxIterReached => log::info!("Reached the iteration budget ({steps})."),
            Termination::EarlyStopped { iteration } => {
                log::info!("Early stopping at iteration {iteration}: training loss increased.")
            }
            Termination::ValidationStopped {
                iteration,
                accuracy,
            } => log::info!(
                "Stopped at iteration {iteration}: held-out accuracy {accuracy:.3}."
            ),
        }

        if self.schedule == Schedule::Filter {
            let w0 = self.loading.dictionary.as_ref().ok_or_else(missing_dictionary)?;
            let compressed = w0.t().dot(&self.data.x0);
            self.loading.classifier = self.rules.closed_form.update(
                self.loading.classifier.view(),
                compressed.view(),
                self.data.x_aux.as_ref().map(|a| a.view()),
                self.data.labels(),
            )?;
            self.record_blocks();
        }

        let method = self.config.option.default_prediction();
        let mut predictor = Predictor::new(self.loading.clone(), self.xi, &self.config, method);
        let (auc, threshold) = predictor.calibrate(
            self.data.x0.view(),
            self.data.labels(),
            self.data.x_aux.as_ref().map(|a| a.view()),
        )?;
        self.ctx.record(keys::TRAINING_AUC, auc);
        self.ctx.record(keys::TRAINING_THRESHOLD, threshold);
        log::info!("Training: AUC {auc:.3}, threshold {threshold:.3}.");

        if let Some(held_out) = &self.data.held_out {
            validate(&predictor, held_out, &mut self.ctx)?;
        }

        self.ctx.record(keys::ITERATIONS, steps);
        self.ctx.record(keys::ELAPSED_SECONDS, started.elapsed().as_secs_f64());
        self.ctx.record(keys::TERMINATION, termination.as_str());
        if let Some(iteration) = termination.stopped_iteration() {
            self.ctx.record(keys::STOPPED_ITERATION, iteration);
        }
        Ok(termination)
    }

    /// The outer loop proper. Returns why it ended and how many iterations ran.
    fn run_iterations(&mut self, pb: &ProgressBar) -> Result<(Termination, usize), SdlError> {
        let mut monitor = EarlyStopping::new();
        let mut time_error: Vec<f64> = Vec::new();
        let mut elapsed = 0.0;

        for t in 0..self.config.iterations {
            let tick = Instant::now();
            let radius = self.config.search_radius(t);
            self.step(t, radius)?;
            if self.config.estimates_xi() {
                self.xi = self.estimate_xi();
                log::debug!("Iteration {t}: xi re-estimated as {:.4e}.", self.xi);
            }
            elapsed += tick.elapsed().as_secs_f64();
            self.record_blocks();
            pb.inc(1);

            if t % CHECKPOINT_INTERVAL != 0 {
                continue;
            }
            if self.config.track_training_loss {
                let checkpoint = self.checkpoint()?;
                time_error.extend([elapsed, checkpoint.data_error, checkpoint.label_error]);
                let rows = time_error.len() / 3;
                if let Ok(matrix) = Array2::from_shape_vec((rows, 3), time_error.clone()) {
                    self.ctx.record(keys::TIME_ERROR, matrix);
                }
                log::info!(
                    "Iteration {t}: training loss [data, label, total] = [{:.3}, {:.3}, {:.3}]",
                    checkpoint.data_error,
                    checkpoint.label_error,
                    checkpoint.total
                );
                if monitor.should_stop(checkpoint.total) {
                    return Ok((Termination::EarlyStopped { iteration: t }, t + 1));
                }
            }
            if self.config.if_validate && t > 1 {
                if let Some(report) = self.validate_held_out()? {
                    if report.accuracy() > VALIDATION_ACCURACY_STOP {
                        let termination = Termination::ValidationStopped {
                            iteration: t,
                            accuracy: report.accuracy(),
                        };
                        return Ok((termination, t + 1));
                    }
                }
            }
        }
        Ok((Termination::MaxIterReached, self.config.iterations))
    }

    /// One outer iteration of the schedule.
    fn step(&mut self, t: usize, radius: Option<f64>) -> Result<(), SdlError> {
        let inputs = block_inputs(&self.data, self.xi, radius, t);
        let aux = inputs.x_aux;
        let refresh_dictionary = t % self.config.dict_update_freq == 0;

        match self.schedule {
            Schedule::FullDim => {
                self.loading.classifier = self.rules.trust_region.update(
                    self.loading.classifier.view(),
                    self.code.view(),
                    aux,
                    inputs.x1,
                    None,
                    t,
                    t,
                )?;
            }
            Schedule::Filter => {
                if refresh_dictionary {
                    let w0 = self.loading.dictionary.as_ref().ok_or_else(missing_dictionary)?;
                    let updated = self.rules.dictionary.update(
                        w0.view(),
                        self.code.view(),
                        self.loading.classifier.view(),
                        &inputs,
                    )?;
                    self.loading.dictionary = Some(updated);
                }
                let w0 = self.loading.dictionary.as_ref().ok_or_else(missing_dictionary)?;
                self.code = self.rules.code.update(
                    self.code.view(),
                    w0.view(),
                    self.loading.classifier.view(),
                    &inputs,
                    &mut self.ctx,
                )?;
                let compressed = w0.t().dot(&inputs.x0);
                self.loading.classifier = self.rules.closed_form.update(
                    self.loading.classifier.view(),
                    compressed.view(),
                    aux,
                    self.data.labels(),
                )?;
            }
            Schedule::Feature => {
                if refresh_dictionary {
                    let w0 = self.loading.dictionary.as_ref().ok_or_else(missing_dictionary)?;
                    let updated = self.rules.dictionary.update(
                        w0.view(),
                        self.code.view(),
                        self.loading.classifier.view(),
                        &inputs,
                    )?;
                    self.loading.dictionary = Some(updated);
                }
                self.loading.classifier = self.rules.closed_form.update(
                    self.loading.classifier.view(),
                    self.code.view(),
                    aux,
                    self.data.labels(),
                )?;
                let w0 = self.loading.dictionary.as_ref().ok_or_else(missing_dictionary)?;
                self.code = self.rules.code.update(
                    self.code.view(),
                    w0.view(),
                    self.loading.classifier.view(),
                    &inputs,
                    &mut self.ctx,
                )?;
            }
        }
        Ok(())
    }

    /// Features the classifier is trained on: `H` in feature mode, `W0ᵗX0` otherwise.
    fn classifier_features(&self) -> Array2<f64> {
        match self.schedule {
            Schedule::Feature => self.code.clone(),
            Schedule::Filter | Schedule::FullDim => self.loading.compress(self.data.x0.view()),
        }
    }

    fn checkpoint(&mut self) -> Result<Checkpoint, SdlError> {
        let x0 = self.data.x0.view();
        let aux = self.data.x_aux.as_ref().map(|a| a.view());
        let reconstruction = self.loading.reconstruct(self.code.view());
        let data_error = squared_distance(x0, reconstruction.view());
        let data_norm = x0.iter().map(|v| v * v).sum::<f64>();
        let relative_error = if data_norm == 0.0 { 0.0 } else { data_error / data_norm };

        let features = self.classifier_features();
        let classifier = self.loading.classifier.view();
        let label_error = classification_loss(classifier, features.view(), aux, self.data.labels())?;
        let scores = probabilities(classifier, features.view(), aux)?;
        let (auc, threshold) = auc_and_threshold(self.data.labels(), scores.view());
        let total = label_error + self.xi * data_error;

        self.ctx.record(keys::TRAINING_THRESHOLD, threshold);
        self.ctx.record(keys::TRAINING_AUC, auc);
        self.ctx.record(keys::RELATIVE_RECONSTRUCTION_ERROR, relative_error);
        self.ctx.record(keys::CLASSIFICATION_LOSS, label_error);
        self.ctx.results.push(keys::TRAINING_LOSS, total);
        log::debug!("Training: AUC {auc:.3}, threshold {threshold:.3}.");
        Ok(Checkpoint {
            data_error,
            label_error,
            total,
        })
    }

    fn validate_held_out(&mut self) -> Result<Option<ValidationReport>, SdlError> {
        let Some(held_out) = &self.data.held_out else {
            return Ok(None);
        };
        let method = self.config.option.default_prediction();
        let mut predictor = Predictor::new(self.loading.clone(), self.xi, &self.config, method);
        predictor.calibrate(
            self.data.x0.view(),
            self.data.labels(),
            self.data.x_aux.as_ref().map(|a| a.view()),
        )?;
        validate(&predictor, held_out, &mut self.ctx).map(Some)
    }

    fn record_metadata(&mut self) {
        let config = &self.config;
        let results = &mut self.ctx.results;
        results.insert(keys::L1_REG, Vec::from(config.l1_reg));
        results.insert(keys::L2_REG, Vec::from(config.l2_reg));
        results.insert(keys::NONNEGATIVITY, Vec::from(config.nonnegativity));
        results.insert(keys::N_COMPONENTS, self.code.nrows());
        results.insert(keys::DICT_UPDATE_FREQ, config.dict_update_freq);
        results.insert(keys::XI, self.xi);
    }

    fn record_blocks(&mut self) {
        if let Some(w0) = &self.loading.dictionary {
            self.ctx.record(keys::DICTIONARY, w0.clone());
        }
        self.ctx.record(keys::CLASSIFIER, self.loading.classifier.clone());
        self.ctx.record(keys::CODE, self.code.clone());
        self.ctx.record(keys::XI, self.xi);
    }

    /// A predictor for the current blocks, calibrated on the training data.
    pub fn predictor(&self, method: PredictionMethod) -> Result<Predictor, SdlError> {
        let mut predictor = Predictor::new(self.loading.clone(), self.xi, &self.config, method);
        predictor.calibrate(
            self.data.x0.view(),
            self.data.labels(),
            self.data.x_aux.as_ref().map(|a| a.view()),
        )?;
        Ok(predictor)
    }

    /// Predicts unseen samples with the current blocks; the prediction is recorded in
    /// this learner's results.
    pub fn predict(
        &mut self,
        x0: ArrayView2<f64>,
        x_aux: Option<ArrayView2<f64>>,
        method: PredictionMethod,
    ) -> Result<Prediction, SdlError> {
        let predictor = self.predictor(method)?;
        predictor.predict(x0, x_aux, &mut self.ctx)
    }
}
