//! Learner state shared across update steps: the loading pair, the run's result
//! store, and the explicit run context that owns the random source.

use ndarray::{Array1, Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Failures while reading or writing TOML artifacts (configuration files and results).
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read or write artifact file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML artifact: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize artifact to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Result-store keys. Every value a run or a prediction records lives under one of these.
pub mod keys {
    pub const DICTIONARY: &str = "dictionary";
    pub const CLASSIFIER: &str = "classifier";
    pub const CODE: &str = "code";
    pub const XI: &str = "xi";
    pub const L1_REG: &str = "l1_reg";
    pub const L2_REG: &str = "l2_reg";
    pub const NONNEGATIVITY: &str = "nonnegativity";
    pub const N_COMPONENTS: &str = "n_components";
    pub const DICT_UPDATE_FREQ: &str = "dict_update_freq";
    pub const ITERATIONS: &str = "iterations";
    pub const ELAPSED_SECONDS: &str = "elapsed_seconds";
    pub const TERMINATION: &str = "termination";
    pub const STOPPED_ITERATION: &str = "stopped_iteration";
    pub const TRAINING_LOSS: &str = "training_loss";
    pub const CLASSIFICATION_LOSS: &str = "classification_loss";
    pub const RELATIVE_RECONSTRUCTION_ERROR: &str = "relative_reconstruction_error";
    pub const TIME_ERROR: &str = "time_error";
    pub const TRAINING_THRESHOLD: &str = "training_threshold";
    pub const TRAINING_AUC: &str = "training_auc";
    pub const CODE_TEST: &str = "code_test";
    pub const P_PRED: &str = "p_pred";
    pub const Y_HAT: &str = "y_hat";
    pub const PREDICTION_METHOD: &str = "prediction_method";
    pub const OPT_THRESHOLD: &str = "opt_threshold";
    pub const AUC: &str = "auc";
    pub const ACCURACY: &str = "accuracy";
    pub const MISCLASSIFICATION: &str = "misclassification";
    pub const PRECISION: &str = "precision";
    pub const RECALL: &str = "recall";
    pub const SENSITIVITY: &str = "sensitivity";
    pub const SPECIFICITY: &str = "specificity";
    pub const FALL_OUT: &str = "fall_out";
    pub const MISS_RATE: &str = "miss_rate";
    pub const F1_SCORE: &str = "f1_score";
    pub const TEST_RECONSTRUCTION_ERROR: &str = "test_reconstruction_error";
    pub const TEST_RELATIVE_ERROR: &str = "test_relative_error";
}

/// The pair of learned blocks: dictionary `W0` and classifier weights `W1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loading {
    /// `d1 × r`. `None` in full-dimension mode, where the dictionary is the identity.
    pub dictionary: Option<Array2<f64>>,
    /// `1 × (1 + r + d3)`: intercept, code coefficients, auxiliary coefficients.
    pub classifier: Array2<f64>,
}

impl Loading {
    /// Projects samples onto the dictionary (`W0ᵗ X`), or passes them through in
    /// full-dimension mode.
    pub fn compress(&self, x: ArrayView2<f64>) -> Array2<f64> {
        match &self.dictionary {
            Some(w0) => w0.t().dot(&x),
            None => x.to_owned(),
        }
    }

    /// Reconstruction `W0 H` of a code matrix (the code itself in full-dimension mode).
    pub fn reconstruct(&self, code: ArrayView2<f64>) -> Array2<f64> {
        match &self.dictionary {
            Some(w0) => w0.dot(&code),
            None => code.to_owned(),
        }
    }
}

/// Everything a block update reads besides the blocks themselves: the samples the
/// update is fitted to, the trade-off weight and the trust region of this outer
/// iteration.
#[derive(Debug, Clone, Copy)]
pub struct BlockInputs<'a> {
    /// Samples, `d1 × n`.
    pub x0: ArrayView2<'a, f64>,
    /// Labels (or soft labels at prediction time), `1 × n`.
    pub x1: ArrayView2<'a, f64>,
    pub x_aux: Option<ArrayView2<'a, f64>>,
    pub xi: f64,
    pub radius: Option<f64>,
    pub outer_iteration: usize,
}

/// One entry of the result store.
///
/// Untagged: loading tries the variants in order, so an empty array comes back as
/// `Vector`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Integer(i64),
    Scalar(f64),
    Text(String),
    Vector(Vec<f64>),
    Flags(Vec<bool>),
    Matrix(Array2<f64>),
}

impl From<f64> for ResultValue {
    fn from(v: f64) -> Self {
        ResultValue::Scalar(v)
    }
}

impl From<usize> for ResultValue {
    fn from(v: usize) -> Self {
        ResultValue::Integer(v as i64)
    }
}

impl From<&str> for ResultValue {
    fn from(v: &str) -> Self {
        ResultValue::Text(v.to_string())
    }
}

impl From<String> for ResultValue {
    fn from(v: String) -> Self {
        ResultValue::Text(v)
    }
}

impl From<Vec<bool>> for ResultValue {
    fn from(v: Vec<bool>) -> Self {
        ResultValue::Flags(v)
    }
}

impl From<Vec<f64>> for ResultValue {
    fn from(v: Vec<f64>) -> Self {
        ResultValue::Vector(v)
    }
}

impl From<Array1<f64>> for ResultValue {
    fn from(v: Array1<f64>) -> Self {
        ResultValue::Vector(v.to_vec())
    }
}

impl From<Array2<f64>> for ResultValue {
    fn from(v: Array2<f64>) -> Self {
        ResultValue::Matrix(v)
    }
}

/// Key → value store accumulated over a run. Entries are inserted or overwritten,
/// never removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultState {
    entries: BTreeMap<String, ResultValue>,
}

impl ResultState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ResultValue>) {
        self.entries.insert(key.to_string(), value.into());
    }

    /// Appends a value to a vector entry, creating it on first use.
    pub fn push(&mut self, key: &str, value: f64) {
        match self.entries.get_mut(key) {
            Some(ResultValue::Vector(values)) => values.push(value),
            _ => self.insert(key, vec![value]),
        }
    }

    pub fn merge(&mut self, other: ResultState) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, key: &str) -> Option<&ResultValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Numeric entries read as `f64`, whether stored as integer or scalar.
    pub fn scalar(&self, key: &str) -> Option<f64> {
        match self.entries.get(key)? {
            ResultValue::Scalar(v) => Some(*v),
            ResultValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.entries.get(key)? {
            ResultValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.entries.get(key)? {
            ResultValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn vector(&self, key: &str) -> Option<&[f64]> {
        match self.entries.get(key)? {
            ResultValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn matrix(&self, key: &str) -> Option<&Array2<f64>> {
        match self.entries.get(key)? {
            ResultValue::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResultValue)> {
        self.entries.iter()
    }

    /// Writes the store to a TOML file.
    pub fn save(&self, path: &str) -> Result<(), ArtifactError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: &str) -> Result<Self, ArtifactError> {
        let toml_string = fs::read_to_string(path)?;
        let state = toml::from_str(&toml_string)?;
        Ok(state)
    }
}

/// Everything a run mutates besides the learned blocks: the result accumulator and
/// the seeded random source. Passed explicitly to every component that needs either.
#[derive(Debug)]
pub struct RunContext {
    pub results: ResultState,
    pub rng: StdRng,
}

impl RunContext {
    pub fn new(seed: u64) -> Self {
        Self {
            results: ResultState::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn record(&mut self, key: &str, value: impl Into<ResultValue>) {
        self.results.insert(key, value);
    }
}
