//! # Fitted Artifacts
//!
//! Pre-trained, immutable inference artifacts: the claim-occurrence
//! classifier, the severity and premium regressors, and the categorical
//! encoder and scaler the claim pipeline depends on. Training happens in a
//! separate system; this module only loads the fitted results from
//! human-readable TOML files and evaluates them.
//!
//! Every artifact publishes a fixed expected input width. Artifacts are
//! loaded once at startup and shared read-only for the life of the
//! process, so evaluation requires no locking.

use crate::contract::{ContractError, SchemaContract};
use crate::reconcile::ReconciledBatch;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use polars::prelude::PolarsError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Post-repair width disagreement between a feature matrix and the
/// scaler it must pass through. Indicates a corrupted or incompatible
/// artifact and is fatal to the request that hit it.
#[derive(Error, Debug)]
#[error("Feature matrix has {actual} columns but the scaler was fitted on {expected}.")]
pub struct ScaleDimensionError {
    pub expected: usize,
    pub actual: usize,
}

/// Errors raised while loading or evaluating fitted artifacts.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read artifact file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse artifact file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize artifact: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(transparent)]
    ContractError(#[from] ContractError),
    #[error("Error from the underlying DataFrame library: {0}")]
    FrameError(#[from] PolarsError),
    #[error("{artifact} expects {expected} input features, got {found}.")]
    WidthMismatch {
        artifact: &'static str,
        expected: usize,
        found: usize,
    },
    #[error(
        "Encoder was fitted on columns {fitted:?} but the contract orders its categorical columns as {contract:?}."
    )]
    EncoderColumnMismatch {
        fitted: Vec<String>,
        contract: Vec<String>,
    },
    #[error("Malformed tree in regression forest: {0}")]
    MalformedForest(String),
    #[error("Scaler means ({means}) and scales ({scales}) disagree in length.")]
    MalformedScaler { means: usize, scales: usize },
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let text = fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ArtifactError> {
    let text = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(text.as_bytes())?;
    Ok(())
}

// --- Claim-occurrence classifier ---

/// A fitted logistic model over the scaled claim feature matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearClassifier {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LinearClassifier {
    pub fn expected_width(&self) -> usize {
        self.coefficients.len()
    }

    /// Claim-occurrence probability per row: `sigmoid(X . w + b)`.
    ///
    /// The linear predictor is clamped to ±700 before exponentiation to
    /// keep `exp` inside f64 range.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ArtifactError> {
        if x.ncols() != self.coefficients.len() {
            return Err(ArtifactError::WidthMismatch {
                artifact: "Claim classifier",
                expected: self.coefficients.len(),
                found: x.ncols(),
            });
        }
        let weights = Array1::from_vec(self.coefficients.clone());
        let eta = x.dot(&weights) + self.intercept;
        let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
        Ok(eta_clamped.mapv(|e| 1.0 / (1.0 + f64::exp(-e))))
    }
}

// --- Regression forest ---

/// One decision tree in the flat array encoding produced by the training
/// pipeline: node `i` splits on `feature[i]` at `threshold[i]` and sends
/// rows with `x <= threshold` to `left[i]`, the rest to `right[i]`.
/// A negative `feature` marks a leaf carrying `value[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    pub left: Vec<i64>,
    pub right: Vec<i64>,
    pub value: Vec<f64>,
}

impl DecisionTree {
    /// Child indices must point strictly forward, which both bounds the
    /// walk and rules out cycles in a corrupted artifact.
    fn validate(&self, index: usize, n_features: usize) -> Result<(), ArtifactError> {
        let len = self.feature.len();
        let malformed = |detail: String| {
            Err(ArtifactError::MalformedForest(format!(
                "tree {index}: {detail}"
            )))
        };
        if len == 0 {
            return malformed("no nodes".to_string());
        }
        if [
            self.threshold.len(),
            self.left.len(),
            self.right.len(),
            self.value.len(),
        ]
        .iter()
        .any(|&l| l != len)
        {
            return malformed("node arrays disagree in length".to_string());
        }
        for node in 0..len {
            let feature = self.feature[node];
            if feature < 0 {
                continue;
            }
            if feature as usize >= n_features {
                return malformed(format!(
                    "node {node} splits on feature {feature}, model has {n_features}"
                ));
            }
            for child in [self.left[node], self.right[node]] {
                if child <= node as i64 || child as usize >= len {
                    return malformed(format!("node {node} has out-of-range child {child}"));
                }
            }
        }
        Ok(())
    }

    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut node = 0usize;
        while self.feature[node] >= 0 {
            let x = row
                .get(self.feature[node] as usize)
                .copied()
                .unwrap_or(0.0);
            node = if x <= self.threshold[node] {
                self.left[node] as usize
            } else {
                self.right[node] as usize
            };
        }
        self.value[node]
    }
}

/// A fitted ensemble of decision trees; prediction is the mean of the
/// per-tree outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestRegressor {
    pub n_features: usize,
    pub trees: Vec<DecisionTree>,
}

impl ForestRegressor {
    pub fn expected_width(&self) -> usize {
        self.n_features
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.trees.is_empty() {
            return Err(ArtifactError::MalformedForest("forest has no trees".into()));
        }
        for (index, tree) in self.trees.iter().enumerate() {
            tree.validate(index, self.n_features)?;
        }
        Ok(())
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ArtifactError> {
        if x.ncols() != self.n_features {
            return Err(ArtifactError::WidthMismatch {
                artifact: "Regression forest",
                expected: self.n_features,
                found: x.ncols(),
            });
        }
        let scale = 1.0 / self.trees.len() as f64;
        let predictions = x
            .rows()
            .into_iter()
            .map(|row| {
                self.trees
                    .iter()
                    .map(|tree| tree.predict_row(row))
                    .sum::<f64>()
                    * scale
            })
            .collect();
        Ok(Array1::from_vec(predictions))
    }
}

// --- Categorical encoder ---

/// The fitted vocabulary of one categorical column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderColumn {
    pub name: String,
    pub categories: Vec<String>,
}

/// A fitted one-hot encoder over the claim contract's categorical columns.
///
/// Each input row becomes one sparse row with a single 1.0 per column at
/// the fitted category's index; categories unseen at fit time (including
/// the `"__NA__"` sentinel when it was not fitted) contribute nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneHotEncoder {
    pub columns: Vec<EncoderColumn>,
}

impl OneHotEncoder {
    /// Total encoded width: the sum of all fitted vocabulary sizes.
    pub fn output_width(&self) -> usize {
        self.columns.iter().map(|c| c.categories.len()).sum()
    }

    /// Verifies the encoder was fitted on exactly the contract's
    /// categorical columns, in the contract's order. Encoded column
    /// positions are meaningful only under that alignment.
    pub fn check_alignment(&self, categorical: &[String]) -> Result<(), ArtifactError> {
        let fitted: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        if fitted != categorical {
            return Err(ArtifactError::EncoderColumnMismatch {
                fitted,
                contract: categorical.to_vec(),
            });
        }
        Ok(())
    }

    /// Maps each row's categorical cells to the global encoded column
    /// slots that carry a 1.0. Slots are offset by the widths of the
    /// preceding fitted columns, so the result indexes directly into a
    /// block of width [`Self::output_width`]. Unseen categories yield no
    /// slot at all.
    pub fn encode(&self, batch: &ReconciledBatch) -> Result<Vec<Vec<usize>>, ArtifactError> {
        let height = batch.height();
        let mut hot_slots: Vec<Vec<usize>> = vec![Vec::with_capacity(self.columns.len()); height];
        let mut offset = 0usize;
        for column in &self.columns {
            let index: HashMap<&str, usize> = column
                .categories
                .iter()
                .enumerate()
                .map(|(i, category)| (category.as_str(), offset + i))
                .collect();
            let chunked = batch.frame().column(column.name.as_str())?.str()?;
            for (row, cell) in chunked.into_iter().enumerate() {
                if let Some(&slot) = cell.and_then(|value| index.get(value)) {
                    hot_slots[row].push(slot);
                }
            }
            offset += column.categories.len();
        }
        Ok(hot_slots)
    }
}

// --- Scaler ---

/// A fitted column-wise standardizer: `(x - mean) / scale` per column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl StandardScaler {
    pub fn expected_width(&self) -> usize {
        self.scales.len()
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.means.len() != self.scales.len() {
            return Err(ArtifactError::MalformedScaler {
                means: self.means.len(),
                scales: self.scales.len(),
            });
        }
        Ok(())
    }

    /// Standardizes `matrix` column-wise. Columns fitted with zero scale
    /// are centered only.
    pub fn transform(&self, mut matrix: Array2<f64>) -> Result<Array2<f64>, ScaleDimensionError> {
        if matrix.ncols() != self.scales.len() {
            return Err(ScaleDimensionError {
                expected: self.scales.len(),
                actual: matrix.ncols(),
            });
        }
        for (j, mut column) in matrix.columns_mut().into_iter().enumerate() {
            let mean = self.means[j];
            let scale = self.scales[j];
            if scale != 0.0 {
                column.mapv_inplace(|x| (x - mean) / scale);
            } else {
                column.mapv_inplace(|x| x - mean);
            }
        }
        Ok(matrix)
    }
}

// --- The full complement ---

const CLAIM_MODEL_FILE: &str = "claim_model.toml";
const CLAIM_SCALER_FILE: &str = "claim_scaler.toml";
const CLAIM_ENCODER_FILE: &str = "claim_encoder.toml";
const SEVERITY_MODEL_FILE: &str = "severity_model.toml";
const PREMIUM_MODEL_FILE: &str = "premium_model.toml";
const CLAIM_CONTRACT_FILE: &str = "claim_contract.toml";
const SEVERITY_CONTRACT_FILE: &str = "severity_contract.toml";
const PREMIUM_CONTRACT_FILE: &str = "premium_contract.toml";

/// Every fitted artifact and schema contract the ensemble needs, loaded
/// from one directory and validated for internal consistency.
#[derive(Debug)]
pub struct ArtifactSet {
    pub claim_model: LinearClassifier,
    pub claim_scaler: StandardScaler,
    pub claim_encoder: OneHotEncoder,
    pub severity_model: ForestRegressor,
    pub premium_model: ForestRegressor,
    pub claim_contract: SchemaContract,
    pub severity_contract: SchemaContract,
    pub premium_contract: SchemaContract,
}

impl ArtifactSet {
    pub fn load(dir: &Path) -> Result<Self, ArtifactError> {
        let set = Self {
            claim_model: load_toml(&dir.join(CLAIM_MODEL_FILE))?,
            claim_scaler: load_toml(&dir.join(CLAIM_SCALER_FILE))?,
            claim_encoder: load_toml(&dir.join(CLAIM_ENCODER_FILE))?,
            severity_model: load_toml(&dir.join(SEVERITY_MODEL_FILE))?,
            premium_model: load_toml(&dir.join(PREMIUM_MODEL_FILE))?,
            claim_contract: SchemaContract::load(&dir.join(CLAIM_CONTRACT_FILE))?,
            severity_contract: SchemaContract::load(&dir.join(SEVERITY_CONTRACT_FILE))?,
            premium_contract: SchemaContract::load(&dir.join(PREMIUM_CONTRACT_FILE))?,
        };
        set.claim_scaler.validate()?;
        set.severity_model.validate()?;
        set.premium_model.validate()?;
        set.claim_encoder
            .check_alignment(&set.claim_contract.categorical)?;
        Ok(set)
    }

    /// Writes the full complement back to `dir`, one TOML file per
    /// artifact. Used by export tooling and test fixtures.
    pub fn save(&self, dir: &Path) -> Result<(), ArtifactError> {
        fs::create_dir_all(dir)?;
        save_toml(&self.claim_model, &dir.join(CLAIM_MODEL_FILE))?;
        save_toml(&self.claim_scaler, &dir.join(CLAIM_SCALER_FILE))?;
        save_toml(&self.claim_encoder, &dir.join(CLAIM_ENCODER_FILE))?;
        save_toml(&self.severity_model, &dir.join(SEVERITY_MODEL_FILE))?;
        save_toml(&self.premium_model, &dir.join(PREMIUM_MODEL_FILE))?;
        save_toml(&self.claim_contract, &dir.join(CLAIM_CONTRACT_FILE))?;
        save_toml(&self.severity_contract, &dir.join(SEVERITY_CONTRACT_FILE))?;
        save_toml(&self.premium_contract, &dir.join(PREMIUM_CONTRACT_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn classifier_probability_is_sigmoid_of_linear_predictor() {
        let model = LinearClassifier {
            coefficients: vec![1.0, -2.0],
            intercept: 0.5,
        };
        let x = array![[1.0, 0.25], [0.0, 0.0]];
        let probs = model.predict_proba(x.view()).unwrap();
        // eta = [1.0 - 0.5 + 0.5, 0.5] = [1.0, 0.5]
        assert_abs_diff_eq!(probs[0], 1.0 / (1.0 + (-1.0f64).exp()), epsilon = 1e-12);
        assert_abs_diff_eq!(probs[1], 1.0 / (1.0 + (-0.5f64).exp()), epsilon = 1e-12);
    }

    #[test]
    fn classifier_rejects_wrong_width() {
        let model = LinearClassifier {
            coefficients: vec![1.0, -2.0, 3.0],
            intercept: 0.0,
        };
        let x = array![[1.0, 2.0]];
        let err = model.predict_proba(x.view()).unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::WidthMismatch {
                expected: 3,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn classifier_survives_extreme_linear_predictors() {
        let model = LinearClassifier {
            coefficients: vec![1e6],
            intercept: 0.0,
        };
        let x = array![[1e6], [-1e6]];
        let probs = model.predict_proba(x.view()).unwrap();
        assert!(probs[0] > 0.999999);
        assert!(probs[1] < 0.000001);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    fn stump(feature: i64, threshold: f64, low: f64, high: f64) -> DecisionTree {
        DecisionTree {
            feature: vec![feature, -1, -1],
            threshold: vec![threshold, 0.0, 0.0],
            left: vec![1, -1, -1],
            right: vec![2, -1, -1],
            value: vec![0.0, low, high],
        }
    }

    #[test]
    fn forest_averages_tree_outputs() {
        let forest = ForestRegressor {
            n_features: 2,
            trees: vec![stump(0, 1.5, 10.0, 20.0), stump(1, 0.0, 30.0, 50.0)],
        };
        forest.validate().unwrap();
        let x = array![[1.0, 1.0], [2.0, -1.0]];
        let out = forest.predict(x.view()).unwrap();
        // Row 0: tree0 -> 10 (1.0 <= 1.5), tree1 -> 50 (1.0 > 0.0); mean 30.
        assert_abs_diff_eq!(out[0], 30.0, epsilon = 1e-12);
        // Row 1: tree0 -> 20, tree1 -> 30; mean 25.
        assert_abs_diff_eq!(out[1], 25.0, epsilon = 1e-12);
    }

    #[test]
    fn forest_validation_catches_backward_children() {
        let mut tree = stump(0, 1.5, 10.0, 20.0);
        tree.left[0] = 0;
        let forest = ForestRegressor {
            n_features: 1,
            trees: vec![tree],
        };
        assert!(matches!(
            forest.validate().unwrap_err(),
            ArtifactError::MalformedForest(_)
        ));
    }

    #[test]
    fn forest_validation_catches_feature_out_of_range() {
        let forest = ForestRegressor {
            n_features: 1,
            trees: vec![stump(3, 1.5, 10.0, 20.0)],
        };
        assert!(matches!(
            forest.validate().unwrap_err(),
            ArtifactError::MalformedForest(_)
        ));
    }

    #[test]
    fn scaler_standardizes_columnwise() {
        let scaler = StandardScaler {
            means: vec![1.0, 10.0],
            scales: vec![2.0, 0.0],
        };
        let out = scaler.transform(array![[3.0, 12.0], [1.0, 10.0]]).unwrap();
        assert_abs_diff_eq!(out[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[[1, 0]], 0.0, epsilon = 1e-12);
        // Zero-scale column is centered only.
        assert_abs_diff_eq!(out[[0, 1]], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn scaler_rejects_width_mismatch() {
        let scaler = StandardScaler {
            means: vec![0.0; 3],
            scales: vec![1.0; 3],
        };
        let err = scaler.transform(array![[1.0, 2.0]]).unwrap_err();
        assert_eq!(err.expected, 3);
        assert_eq!(err.actual, 2);
    }

    #[test]
    fn encoder_maps_fitted_categories_and_ignores_unseen() {
        use crate::contract::SchemaContract;
        use crate::reconcile::reconcile;
        use polars::prelude::*;
        use std::collections::BTreeSet;

        let encoder = OneHotEncoder {
            columns: vec![
                EncoderColumn {
                    name: "Gender".into(),
                    categories: vec!["F".into(), "M".into()],
                },
                EncoderColumn {
                    name: "Province".into(),
                    categories: vec!["Gauteng".into(), "Limpopo".into(), "Free State".into()],
                },
            ],
        };
        let contract = SchemaContract {
            numeric: vec![],
            categorical: vec!["Gender".to_string(), "Province".to_string()],
            drop: BTreeSet::new(),
        };
        let df = DataFrame::new(vec![
            Column::new("Gender".into(), &[Some("M"), None, Some("X")]),
            Column::new("Province".into(), &["Limpopo", "Gauteng", "Unknown"]),
        ])
        .unwrap();
        let batch = reconcile(&df, &contract).unwrap();
        let slots = encoder.encode(&batch).unwrap();
        assert_eq!(slots[0], vec![1, 3]); // M, Limpopo
        assert_eq!(slots[1], vec![2]); // __NA__ unseen, Gauteng
        assert_eq!(slots[2], Vec::<usize>::new()); // both unseen
        assert_eq!(encoder.output_width(), 5);
    }

    #[test]
    fn encoder_alignment_is_order_sensitive() {
        let encoder = OneHotEncoder {
            columns: vec![
                EncoderColumn {
                    name: "Gender".into(),
                    categories: vec!["F".into(), "M".into()],
                },
                EncoderColumn {
                    name: "Province".into(),
                    categories: vec!["Gauteng".into()],
                },
            ],
        };
        encoder
            .check_alignment(&["Gender".to_string(), "Province".to_string()])
            .unwrap();
        let err = encoder
            .check_alignment(&["Province".to_string(), "Gender".to_string()])
            .unwrap_err();
        assert!(matches!(err, ArtifactError::EncoderColumnMismatch { .. }));
    }
}
