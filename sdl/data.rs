//! # Data Loading and Validation
//!
//! Training and held-out matrices enter the crate here, either directly as
//! `ndarray` matrices through [`DataSet::new`] or from tab-separated files.
//!
//! - Orientation: the core works with one column per sample (`X0` is `d1 × n`).
//!   Files are the other way round, one sample per row, and are transposed on load.
//! - Strict Schema: the label column is named `label`; columns whose name starts
//!   with `aux_` are auxiliary covariates; every other column is a feature.
//! - User-Centric Errors: failures while reading a file are assumed to be input
//!   errors and are reported through [`DataError`] with the offending column and row.

use crate::types::{SdlError, all_finite};
use ndarray::{Array1, Array2, ArrayView1};
use std::path::Path;
use thiserror::Error;

pub const LABEL_COLUMN: &str = "label";
pub const AUX_PREFIX: &str = "aux_";

/// Held-out counterparts of the training matrices, scored after fitting.
#[derive(Debug, Clone)]
pub struct HeldOut {
    pub x0: Array2<f64>,
    pub x1: Array2<f64>,
    pub x_aux: Option<Array2<f64>>,
}

impl HeldOut {
    pub fn labels(&self) -> ArrayView1<'_, f64> {
        self.x1.row(0)
    }
}

/// The immutable inputs of a run.
#[derive(Debug, Clone)]
pub struct DataSet {
    /// Primary features, `d1 × n`.
    pub x0: Array2<f64>,
    /// Binary label row, `1 × n`.
    pub x1: Array2<f64>,
    /// Auxiliary covariates, `d3 × n`.
    pub x_aux: Option<Array2<f64>>,
    pub held_out: Option<HeldOut>,
}

impl DataSet {
    /// Validates the sample axis, label values and held-out dimensions.
    pub fn new(
        x0: Array2<f64>,
        x1: Array2<f64>,
        x_aux: Option<Array2<f64>>,
        held_out: Option<HeldOut>,
    ) -> Result<Self, SdlError> {
        let n = x0.ncols();
        if n == 0 || x0.nrows() == 0 {
            return Err(SdlError::ShapeMismatch {
                what: "training samples and features (at least one of each)",
                expected: 1,
                found: 0,
            });
        }
        check_sample_axis(&x0, &x1, x_aux.as_ref(), "training")?;
        check_finite(&x0, "X0")?;
        if let Some(aux) = &x_aux {
            check_finite(aux, "X_aux")?;
        }
        check_binary_labels(x1.row(0))?;

        if let Some(test) = &held_out {
            if test.x0.nrows() != x0.nrows() {
                return Err(SdlError::ShapeMismatch {
                    what: "held-out feature rows",
                    expected: x0.nrows(),
                    found: test.x0.nrows(),
                });
            }
            let d3 = x_aux.as_ref().map_or(0, |a| a.nrows());
            let test_d3 = test.x_aux.as_ref().map_or(0, |a| a.nrows());
            if d3 != test_d3 {
                return Err(SdlError::ShapeMismatch {
                    what: "held-out auxiliary rows",
                    expected: d3,
                    found: test_d3,
                });
            }
            check_sample_axis(&test.x0, &test.x1, test.x_aux.as_ref(), "held-out")?;
            check_finite(&test.x0, "held-out X0")?;
            if let Some(aux) = &test.x_aux {
                check_finite(aux, "held-out X_aux")?;
            }
            check_binary_labels(test.x1.row(0))?;
        }

        Ok(Self {
            x0,
            x1,
            x_aux,
            held_out,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.x0.ncols()
    }

    pub fn n_features(&self) -> usize {
        self.x0.nrows()
    }

    pub fn n_aux(&self) -> usize {
        self.x_aux.as_ref().map_or(0, |a| a.nrows())
    }

    pub fn labels(&self) -> ArrayView1<'_, f64> {
        self.x1.row(0)
    }
}

fn check_finite(matrix: &Array2<f64>, name: &str) -> Result<(), SdlError> {
    if all_finite(matrix) {
        Ok(())
    } else {
        Err(SdlError::Configuration(format!("{name} contains non-finite values")))
    }
}

fn check_sample_axis(
    x0: &Array2<f64>,
    x1: &Array2<f64>,
    x_aux: Option<&Array2<f64>>,
    which: &'static str,
) -> Result<(), SdlError> {
    if x1.nrows() != 1 {
        return Err(SdlError::ShapeMismatch {
            what: "label rows (binary labels only)",
            expected: 1,
            found: x1.nrows(),
        });
    }
    if x1.ncols() != x0.ncols() {
        return Err(SdlError::ShapeMismatch {
            what: if which == "training" {
                "training label samples"
            } else {
                "held-out label samples"
            },
            expected: x0.ncols(),
            found: x1.ncols(),
        });
    }
    if let Some(aux) = x_aux {
        if aux.ncols() != x0.ncols() {
            return Err(SdlError::ShapeMismatch {
                what: if which == "training" {
                    "training auxiliary samples"
                } else {
                    "held-out auxiliary samples"
                },
                expected: x0.ncols(),
                found: aux.ncols(),
            });
        }
    }
    Ok(())
}

/// Labels must be exactly 0 or 1.
pub fn check_binary_labels(labels: ArrayView1<f64>) -> Result<(), SdlError> {
    match labels
        .iter()
        .enumerate()
        .find(|&(_, &y)| y != 0.0 && y != 1.0)
    {
        Some((index, &value)) => Err(SdlError::InvalidLabels { index, value }),
        None => Ok(()),
    }
}

/// A comprehensive error type for all file loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse the tab-separated input: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Column '{column_name}' has an empty value at data row {row}.")]
    MissingValue { column_name: String, row: usize },
    #[error("Column '{column_name}' contains the non-numeric value '{value}' at data row {row}.")]
    NonNumericValue {
        column_name: String,
        row: usize,
        value: String,
    },
    #[error("Non-finite values (NaN or infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("The input file contains no data rows.")]
    NoDataRows,
    #[error("The input file has no feature columns besides 'label' and 'aux_*'.")]
    NoFeatureColumns,
    #[error("The loaded data is inconsistent: {0}")]
    Invalid(#[from] SdlError),
}

/// One parsed file, already transposed to one column per sample.
#[derive(Debug)]
pub struct LabeledTable {
    pub feature_names: Vec<String>,
    pub aux_names: Vec<String>,
    /// `d1 × n`
    pub features: Array2<f64>,
    pub labels: Option<Array1<f64>>,
    /// `d3 × n`, absent when the file has no `aux_` columns.
    pub aux: Option<Array2<f64>>,
}

impl LabeledTable {
    pub fn n_samples(&self) -> usize {
        self.features.ncols()
    }

    fn label_row(&self) -> Result<Array2<f64>, DataError> {
        let labels = self
            .labels
            .as_ref()
            .ok_or_else(|| DataError::ColumnNotFound(LABEL_COLUMN.to_string()))?;
        Ok(labels.clone().insert_axis(ndarray::Axis(0)))
    }
}

/// Reads a tab-separated file. The `label` column is required when `require_label` is set.
pub fn load_table(path: impl AsRef<Path>, require_label: bool) -> Result<LabeledTable, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path.as_ref())?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (col, field) in record.iter().enumerate() {
            let column_name = &headers[col];
            let field = field.trim();
            if field.is_empty() {
                return Err(DataError::MissingValue {
                    column_name: column_name.clone(),
                    row: row + 1,
                });
            }
            let value: f64 = field.parse().map_err(|_| DataError::NonNumericValue {
                column_name: column_name.clone(),
                row: row + 1,
                value: field.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFiniteValuesFound(column_name.clone()));
            }
            columns[col].push(value);
        }
    }

    let n = columns.first().map_or(0, Vec::len);
    if n == 0 {
        return Err(DataError::NoDataRows);
    }

    let mut feature_idx = Vec::new();
    let mut aux_idx = Vec::new();
    let mut label_idx = None;
    for (i, name) in headers.iter().enumerate() {
        if name == LABEL_COLUMN {
            label_idx = Some(i);
        } else if name.starts_with(AUX_PREFIX) {
            aux_idx.push(i);
        } else {
            feature_idx.push(i);
        }
    }
    if require_label && label_idx.is_none() {
        return Err(DataError::ColumnNotFound(LABEL_COLUMN.to_string()));
    }
    if feature_idx.is_empty() {
        return Err(DataError::NoFeatureColumns);
    }

    let gather = |idx: &[usize]| Array2::from_shape_fn((idx.len(), n), |(i, j)| columns[idx[i]][j]);
    let labels = label_idx.map(|i| Array1::from_vec(columns[i].clone()));
    if let Some(labels) = &labels {
        check_binary_labels(labels.view())?;
    }

    log::info!(
        "Loaded {} samples with {} features and {} auxiliary covariates.",
        n,
        feature_idx.len(),
        aux_idx.len()
    );

    Ok(LabeledTable {
        feature_names: feature_idx.iter().map(|&i| headers[i].clone()).collect(),
        aux_names: aux_idx.iter().map(|&i| headers[i].clone()).collect(),
        features: gather(&feature_idx),
        labels,
        aux: (!aux_idx.is_empty()).then(|| gather(&aux_idx)),
    })
}

/// Loads a training file and an optional held-out file into a validated [`DataSet`].
pub fn load_training_data(
    train_path: impl AsRef<Path>,
    test_path: Option<&Path>,
) -> Result<DataSet, DataError> {
    let train = load_table(train_path, true)?;
    let held_out = match test_path {
        Some(path) => {
            let test = load_table(path, true)?;
            if test.feature_names != train.feature_names {
                return Err(DataError::Invalid(SdlError::Configuration(format!(
                    "held-out feature columns {:?} do not match training columns {:?}",
                    test.feature_names, train.feature_names
                ))));
            }
            let x1 = test.label_row()?;
            Some(HeldOut {
                x0: test.features,
                x1,
                x_aux: test.aux,
            })
        }
        None => None,
    };
    let x1 = train.label_row()?;
    Ok(DataSet::new(train.features, x1, train.aux, held_out)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    fn write_tsv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".tsv").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn tsv_is_transposed_and_split_by_column_role() {
        let file = write_tsv("g1\tlabel\tg2\taux_age\n1.0\t0\t2.0\t30\n3.0\t1\t4.0\t40\n5.0\t1\t6.0\t50\n");
        let table = load_table(file.path(), true).unwrap();

        assert_eq!(table.feature_names, vec!["g1", "g2"]);
        assert_eq!(table.aux_names, vec!["aux_age"]);
        assert_eq!(table.features, array![[1.0, 3.0, 5.0], [2.0, 4.0, 6.0]]);
        assert_eq!(table.labels, Some(array![0.0, 1.0, 1.0]));
        assert_eq!(table.aux, Some(array![[30.0, 40.0, 50.0]]));
    }

    #[test]
    fn missing_label_column_is_reported() {
        let file = write_tsv("g1\tg2\n1.0\t2.0\n");
        assert!(matches!(
            load_table(file.path(), true),
            Err(DataError::ColumnNotFound(name)) if name == "label"
        ));
        assert!(load_table(file.path(), false).unwrap().labels.is_none());
    }

    #[test]
    fn non_numeric_values_name_column_and_row() {
        let file = write_tsv("g1\tlabel\n1.0\t0\nabc\t1\n");
        match load_table(file.path(), true) {
            Err(DataError::NonNumericValue {
                column_name, row, ..
            }) => {
                assert_eq!(column_name, "g1");
                assert_eq!(row, 2);
            }
            other => panic!("expected NonNumericValue, got {other:?}"),
        }
    }

    #[test]
    fn non_binary_labels_are_rejected() {
        let file = write_tsv("g1\tlabel\n1.0\t0\n2.0\t2\n");
        assert!(matches!(
            load_table(file.path(), true),
            Err(DataError::Invalid(SdlError::InvalidLabels { index: 1, .. }))
        ));
    }

    #[test]
    fn dataset_rejects_misaligned_sample_axes() {
        let x0 = Array2::<f64>::ones((3, 4));
        let x1 = Array2::<f64>::zeros((1, 3));
        assert!(matches!(
            DataSet::new(x0.clone(), x1, None, None),
            Err(SdlError::ShapeMismatch { expected: 4, found: 3, .. })
        ));

        let x1 = Array2::<f64>::zeros((1, 4));
        let aux = Array2::<f64>::zeros((2, 5));
        assert!(DataSet::new(x0.clone(), x1.clone(), Some(aux), None).is_err());

        let held_out = HeldOut {
            x0: Array2::ones((2, 2)),
            x1: Array2::zeros((1, 2)),
            x_aux: None,
        };
        assert!(matches!(
            DataSet::new(x0, x1, None, Some(held_out)),
            Err(SdlError::ShapeMismatch { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn dataset_rejects_non_finite_covariates() {
        let x0 = Array2::<f64>::ones((3, 4));
        let x1 = array![[0.0, 1.0, 0.0, 1.0]];
        let aux = array![[1.0, f64::NAN, 0.5, 0.2]];
        assert!(matches!(
            DataSet::new(x0.clone(), x1.clone(), Some(aux), None),
            Err(SdlError::Configuration(message)) if message.contains("X_aux")
        ));

        let held_out = HeldOut {
            x0: array![[1.0, f64::INFINITY], [1.0, 1.0], [1.0, 1.0]],
            x1: array![[0.0, 1.0]],
            x_aux: None,
        };
        assert!(matches!(
            DataSet::new(x0.clone(), x1.clone(), None, Some(held_out)),
            Err(SdlError::Configuration(message)) if message.contains("held-out X0")
        ));

        let held_out = HeldOut {
            x0: Array2::ones((3, 2)),
            x1: array![[0.0, 1.0]],
            x_aux: Some(array![[f64::NAN, 0.0]]),
        };
        let aux = Array2::<f64>::zeros((1, 4));
        assert!(matches!(
            DataSet::new(x0, x1, Some(aux), Some(held_out)),
            Err(SdlError::Configuration(message)) if message.contains("held-out X_aux")
        ));
    }

    #[test]
    fn held_out_files_must_share_feature_columns() {
        let train = write_tsv("g1\tg2\tlabel\n1\t2\t0\n3\t4\t1\n");
        let test = write_tsv("g1\tg3\tlabel\n1\t2\t0\n");
        assert!(load_training_data(train.path(), Some(test.path())).is_err());

        let test = write_tsv("g1\tg2\tlabel\n1\t2\t1\n");
        let data = load_training_data(train.path(), Some(test.path())).unwrap();
        assert_eq!(data.n_samples(), 2);
        assert_eq!(data.held_out.unwrap().x0.dim(), (2, 1));
    }
}
