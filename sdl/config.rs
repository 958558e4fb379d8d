//! # Run Configuration
//!
//! Every hyperparameter of a supervised dictionary learning run lives in
//! [`SdlConfig`]. The configuration is plain data: it can be written to and read
//! from TOML, overridden from the command line, and is checked once by
//! [`SdlConfig::validate`] before any optimization work begins. Invalid
//! combinations fail fast there instead of surfacing halfway through a fit.

use crate::state::ArtifactError;
use crate::types::{Penalty, SdlError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::str::FromStr;

/// Alternation schedule of the outer loop. Parsed through [`FromStr`] in every
/// entry point, configuration files included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FitMode {
    /// The classifier sees the dictionary-compressed data `W0ᵗ X0`.
    Filter,
    /// The classifier sees the jointly optimized code `H`.
    Feature,
}

impl FitMode {
    /// The prediction strategy that matches the features the classifier was trained on.
    pub fn default_prediction(self) -> PredictionMethod {
        match self {
            FitMode::Filter => PredictionMethod::Filter,
            FitMode::Feature => PredictionMethod::Naive,
        }
    }
}

impl FromStr for FitMode {
    type Err = SdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filter" => Ok(FitMode::Filter),
            "feature" => Ok(FitMode::Feature),
            other => Err(SdlError::Configuration(format!(
                "unrecognized option '{other}'; expected 'filter' or 'feature'"
            ))),
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitMode::Filter => write!(f, "filter"),
            FitMode::Feature => write!(f, "feature"),
        }
    }
}

impl TryFrom<String> for FitMode {
    type Error = SdlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FitMode> for String {
    fn from(mode: FitMode) -> Self {
        mode.to_string()
    }
}

/// How labels are inferred for unseen samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PredictionMethod {
    Filter,
    Naive,
    Alt,
    Exhaustive,
}

impl PredictionMethod {
    pub const ALL: [PredictionMethod; 4] = [
        PredictionMethod::Filter,
        PredictionMethod::Naive,
        PredictionMethod::Alt,
        PredictionMethod::Exhaustive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PredictionMethod::Filter => "filter",
            PredictionMethod::Naive => "naive",
            PredictionMethod::Alt => "alt",
            PredictionMethod::Exhaustive => "exhaustive",
        }
    }
}

impl FromStr for PredictionMethod {
    type Err = SdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        PredictionMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| {
                SdlError::Configuration(format!(
                    "unrecognized prediction method '{wanted}'; expected filter, naive, alt or exhaustive"
                ))
            })
    }
}

impl fmt::Display for PredictionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for PredictionMethod {
    type Error = SdlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PredictionMethod> for String {
    fn from(method: PredictionMethod) -> Self {
        method.as_str().to_string()
    }
}

/// One setting per optimized block, in the fixed order `[code, dictionary, classifier]`.
///
/// Serialized as a three-element array; any other length is rejected when the
/// configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "Vec<T>",
    into = "Vec<T>",
    bound(serialize = "T: Serialize + Clone", deserialize = "T: Deserialize<'de>")
)]
pub struct BlockTriple<T> {
    pub code: T,
    pub dictionary: T,
    pub classifier: T,
}

impl<T> BlockTriple<T> {
    pub fn new(code: T, dictionary: T, classifier: T) -> Self {
        Self {
            code,
            dictionary,
            classifier,
        }
    }
}

impl<T: Clone> BlockTriple<T> {
    pub fn uniform(value: T) -> Self {
        Self::new(value.clone(), value.clone(), value)
    }

    /// Builds a triple from a slice, e.g. a comma-separated command-line value.
    pub fn from_slice(values: &[T]) -> Result<Self, SdlError> {
        Self::try_from(values.to_vec()).map_err(SdlError::Configuration)
    }
}

impl<T> TryFrom<Vec<T>> for BlockTriple<T> {
    type Error = String;

    fn try_from(values: Vec<T>) -> Result<Self, Self::Error> {
        let len = values.len();
        let mut iter = values.into_iter();
        match (iter.next(), iter.next(), iter.next(), iter.next()) {
            (Some(code), Some(dictionary), Some(classifier), None) => {
                Ok(BlockTriple::new(code, dictionary, classifier))
            }
            _ => Err(format!(
                "expected 3 entries [code, dictionary, classifier], found {len}"
            )),
        }
    }
}

impl<T> From<BlockTriple<T>> for Vec<T> {
    fn from(triple: BlockTriple<T>) -> Self {
        vec![triple.code, triple.dictionary, triple.classifier]
    }
}

/// The complete set of hyperparameters for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdlConfig {
    /// Latent rank `r`, the number of dictionary atoms. Ignored in full-dimension mode.
    pub n_components: usize,
    /// Outer-loop budget.
    pub iterations: usize,
    /// Reconstruction/classification trade-off. `None` estimates it from the
    /// residual variance every outer iteration.
    pub xi: Option<f64>,
    pub l1_reg: BlockTriple<f64>,
    pub l2_reg: BlockTriple<f64>,
    pub nonnegativity: BlockTriple<bool>,
    /// Skip compression entirely: the code is the raw data.
    pub full_dim: bool,
    pub option: FitMode,
    pub dict_update_freq: usize,
    pub search_radius_const: f64,
    /// Decay exponent of the trust-region radius; `None` disables the trust region.
    pub beta: Option<f64>,
    pub update_nuisance_param: bool,
    pub if_validate: bool,
    /// Record losses every 10th outer iteration and stop when they rise.
    pub track_training_loss: bool,
    /// Honour the relative-change stop inside the reconstruction-only code update.
    pub code_stopping_check: bool,
    /// The joint code update samples `n / subsample_ratio` columns per sweep.
    pub subsample_ratio: usize,
    /// L1 weight of the sparse coder used at prediction and validation time.
    pub sparse_code_alpha: f64,
    /// Target Hoyer sparseness for each code row after the reconstruction update.
    pub code_sparseness: Option<f64>,
    pub alt_rounds: usize,
    pub exhaustive_sweeps: usize,
    pub seed: u64,
    pub show_progress: bool,
}

impl Default for SdlConfig {
    fn default() -> Self {
        Self {
            n_components: 100,
            iterations: 100,
            xi: None,
            l1_reg: BlockTriple::uniform(0.0),
            l2_reg: BlockTriple::uniform(0.0),
            nonnegativity: BlockTriple::new(true, true, false),
            full_dim: false,
            option: FitMode::Filter,
            dict_update_freq: 1,
            search_radius_const: 1000.0,
            beta: Some(1.0),
            update_nuisance_param: false,
            if_validate: false,
            track_training_loss: true,
            code_stopping_check: false,
            subsample_ratio: 10,
            sparse_code_alpha: 0.0,
            code_sparseness: None,
            alt_rounds: 200,
            exhaustive_sweeps: 40,
            seed: 0,
            show_progress: false,
        }
    }
}

impl SdlConfig {
    /// Rejects inconsistent settings before a learner is built.
    pub fn validate(&self) -> Result<(), SdlError> {
        let fail = |msg: String| Err(SdlError::Configuration(msg));

        if self.full_dim && self.option == FitMode::Feature {
            return fail(
                "full_dim cannot be combined with option = \"feature\"; the code is the raw data in full-dimension mode"
                    .to_string(),
            );
        }
        if !self.full_dim && self.n_components == 0 {
            return fail("n_components must be at least 1".to_string());
        }
        if self.dict_update_freq == 0 {
            return fail("dict_update_freq must be at least 1".to_string());
        }
        if self.subsample_ratio == 0 {
            return fail("subsample_ratio must be at least 1".to_string());
        }
        if self.exhaustive_sweeps == 0 {
            return fail("exhaustive_sweeps must be at least 1".to_string());
        }
        if let Some(xi) = self.xi {
            if !xi.is_finite() || xi < 0.0 {
                return fail(format!("xi must be a finite non-negative number, got {xi}"));
            }
        }
        for (name, triple) in [("l1_reg", &self.l1_reg), ("l2_reg", &self.l2_reg)] {
            for value in [triple.code, triple.dictionary, triple.classifier] {
                if !value.is_finite() || value < 0.0 {
                    return fail(format!(
                        "{name} entries must be finite and non-negative, got {value}"
                    ));
                }
            }
        }
        if !self.search_radius_const.is_finite() || self.search_radius_const <= 0.0 {
            return fail(format!(
                "search_radius_const must be positive, got {}",
                self.search_radius_const
            ));
        }
        if let Some(beta) = self.beta {
            if !beta.is_finite() {
                return fail(format!("beta must be finite, got {beta}"));
            }
        }
        if !self.sparse_code_alpha.is_finite() || self.sparse_code_alpha < 0.0 {
            return fail(format!(
                "sparse_code_alpha must be non-negative, got {}",
                self.sparse_code_alpha
            ));
        }
        if let Some(s) = self.code_sparseness {
            if !(0.0..=1.0).contains(&s) {
                return fail(format!("code_sparseness must lie in [0, 1], got {s}"));
            }
        }
        Ok(())
    }

    pub fn code_penalty(&self) -> Penalty {
        Penalty {
            l1: self.l1_reg.code,
            l2: self.l2_reg.code,
            nonnegative: self.nonnegativity.code,
        }
    }

    pub fn dictionary_penalty(&self) -> Penalty {
        Penalty {
            l1: self.l1_reg.dictionary,
            l2: self.l2_reg.dictionary,
            nonnegative: self.nonnegativity.dictionary,
        }
    }

    pub fn classifier_penalty(&self) -> Penalty {
        Penalty {
            l1: self.l1_reg.classifier,
            l2: self.l2_reg.classifier,
            nonnegative: self.nonnegativity.classifier,
        }
    }

    /// Whether ξ is re-estimated from the residual after every outer iteration.
    pub fn estimates_xi(&self) -> bool {
        self.xi.is_none() || self.update_nuisance_param
    }

    /// Trust-region radius for outer iteration `step` (counted from zero):
    /// `c · (step + 1)^(−β) / ln(step + 2)`.
    pub fn search_radius(&self, step: usize) -> Option<f64> {
        if self.full_dim {
            return None;
        }
        self.beta.map(|beta| {
            let t = step as f64;
            self.search_radius_const * (t + 1.0).powf(-beta) / (t + 2.0).ln()
        })
    }

    /// Reads a configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: &str) -> Result<Self, ArtifactError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ArtifactError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }
}
