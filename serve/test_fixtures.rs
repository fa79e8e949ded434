//! Shared in-memory artifact fixtures for unit tests.

use crate::artifact::{
    ArtifactSet, DecisionTree, EncoderColumn, ForestRegressor, LinearClassifier, OneHotEncoder,
    StandardScaler,
};
use crate::contract::SchemaContract;
use std::collections::BTreeSet;

/// A single-split tree over `feature`, yielding `low` at or below the
/// threshold and `high` above it.
pub fn stump(feature: i64, threshold: f64, low: f64, high: f64) -> DecisionTree {
    DecisionTree {
        feature: vec![feature, -1, -1],
        threshold: vec![threshold, 0.0, 0.0],
        left: vec![1, -1, -1],
        right: vec![2, -1, -1],
        value: vec![0.0, low, high],
    }
}

/// A small but complete artifact set with transparent behavior:
///
/// - claim: numeric [kilowatts, cubiccapacity] + Gender in {F, M},
///   identity scaler of width 4, classifier weights [1, 0, 0, 0], so
///   claim probability is `sigmoid(kilowatts)`;
/// - severity: forest of one stump splitting kilowatts at 100 into
///   1000 / 5000;
/// - premium: forest of one stump splitting kilowatts at 100 into
///   200 / 400.
pub fn tiny_artifact_set() -> ArtifactSet {
    let claim_contract = SchemaContract {
        numeric: vec!["kilowatts".to_string(), "cubiccapacity".to_string()],
        categorical: vec!["Gender".to_string()],
        drop: BTreeSet::from(["RecordID".to_string(), "PolicyID".to_string()]),
    };
    let severity_contract = SchemaContract {
        numeric: vec!["kilowatts".to_string(), "cubiccapacity".to_string()],
        categorical: vec![],
        drop: BTreeSet::from(["RecordID".to_string(), "TotalClaims".to_string()]),
    };
    let premium_contract = SchemaContract {
        numeric: vec!["kilowatts".to_string()],
        categorical: vec![],
        drop: BTreeSet::from(["RecordID".to_string()]),
    };

    ArtifactSet {
        claim_model: LinearClassifier {
            coefficients: vec![1.0, 0.0, 0.0, 0.0],
            intercept: 0.0,
        },
        claim_scaler: StandardScaler {
            means: vec![0.0; 4],
            scales: vec![1.0; 4],
        },
        claim_encoder: OneHotEncoder {
            columns: vec![EncoderColumn {
                name: "Gender".into(),
                categories: vec!["F".into(), "M".into()],
            }],
        },
        severity_model: ForestRegressor {
            n_features: 2,
            trees: vec![stump(0, 100.0, 1000.0, 5000.0)],
        },
        premium_model: ForestRegressor {
            n_features: 1,
            trees: vec![stump(0, 100.0, 200.0, 400.0)],
        },
        claim_contract,
        severity_contract,
        premium_contract,
    }
}
