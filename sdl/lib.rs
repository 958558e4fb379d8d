#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Supervised dictionary learning by block coordinate descent.
//!
//! A data matrix `X0` (features × samples) is factored as `W0 · H` while a logistic
//! classifier `W1` is trained on the low-rank representation, so that the reduced
//! features are good at both reconstruction and prediction. The blocks are updated in
//! turn with projected gradient steps inside shrinking trust regions.

pub mod classifier;
pub mod code;
pub mod config;
pub mod data;
pub mod dictionary;
pub mod fit;
pub mod predict;
pub mod projection;
pub mod sparse_code;
pub mod sparsity;
pub mod state;
pub mod types;
pub mod validate;

#[path = "../metrics/mod.rs"]
pub mod metrics;

#[cfg(test)]
mod test_fixtures;

pub use config::{BlockTriple, FitMode, PredictionMethod, SdlConfig};
pub use data::{DataSet, HeldOut};
pub use fit::{SupervisedDictionaryLearner, Termination};
pub use predict::{Prediction, Predictor};
pub use state::{Loading, ResultState, ResultValue, RunContext};
pub use types::SdlError;
