//! # Ensemble Dispatch
//!
//! Runs the three frozen models over one uploaded batch and merges their
//! outputs by row position. Each model has its own contract, so each
//! pipeline reconciles and assembles independently:
//!
//! 1. claim occurrence: reconcile → sparse assembly → scaled logistic
//!    classifier (probability plus a thresholded class label);
//! 2. claim severity: reconcile → dense numeric matrix → regression
//!    forest;
//! 3. premium: reconcile → dense numeric matrix → regression forest.
//!
//! The pipelines are independent and evaluate concurrently, but the
//! dispatcher waits for all three before merging: a batch either yields
//! a complete ensemble for every row or fails as a whole, carrying the
//! identity of the pipeline that broke.
//!
//! Row order is preserved end-to-end; row `i` of the output corresponds
//! to row `i` of the input batch.

use crate::artifact::{ArtifactError, ArtifactSet, ForestRegressor};
use crate::assemble::{self, AssembleError, RepairPolicy};
use crate::contract::SchemaContract;
use crate::reconcile::reconcile;
use ndarray::Array1;
use polars::prelude::*;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Probability at or above which the claim classifier reports class 1.
pub const CLASS_THRESHOLD: f64 = 0.5;

/// Identifies which of the three model pipelines an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Pipeline {
    Claim,
    Severity,
    Premium,
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pipeline::Claim => write!(f, "claim"),
            Pipeline::Severity => write!(f, "severity"),
            Pipeline::Premium => write!(f, "premium"),
        }
    }
}

/// A failure inside one pipeline's reconcile/assemble/predict chain.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Error from the underlying DataFrame library: {0}")]
    FrameError(#[from] PolarsError),
    #[error(transparent)]
    AssembleError(#[from] AssembleError),
    #[error(transparent)]
    ArtifactError(#[from] ArtifactError),
}

/// A whole-batch prediction failure: one pipeline broke, so no rows are
/// returned for any model.
#[derive(Error, Debug)]
#[error("{pipeline} pipeline failed: {source}")]
pub struct PredictionError {
    pub pipeline: Pipeline,
    #[source]
    pub source: PipelineError,
}

impl PredictionError {
    /// True when the underlying cause is a post-repair width mismatch,
    /// which callers report distinctly from other pipeline failures.
    pub fn is_scale_dimension(&self) -> bool {
        matches!(
            &self.source,
            PipelineError::AssembleError(AssembleError::ScaleDimension(_))
        )
    }
}

/// One fully-ensembled output row: the identifying columns of the input
/// row (absent columns serve as nulls) plus all three model outputs.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionRow {
    #[serde(rename = "RecordID")]
    pub record_id: Option<i64>,
    #[serde(rename = "UnderwrittenCoverID")]
    pub underwritten_cover_id: Option<i64>,
    #[serde(rename = "PolicyID")]
    pub policy_id: Option<i64>,
    #[serde(rename = "TransactionMonth")]
    pub transaction_month: Option<String>,
    #[serde(rename = "ClaimProbability")]
    pub claim_probability: f64,
    #[serde(rename = "ClaimClass")]
    pub claim_class: u8,
    #[serde(rename = "ClaimSeverity")]
    pub claim_severity: f64,
    #[serde(rename = "PremiumPrediction")]
    pub premium_prediction: f64,
}

/// Owns the fitted artifacts and drives the three pipelines per batch.
///
/// Artifacts are immutable after construction, so a dispatcher is safely
/// shared across threads without locking.
#[derive(Debug)]
pub struct EnsembleDispatcher {
    artifacts: ArtifactSet,
    repair: RepairPolicy,
}

impl EnsembleDispatcher {
    pub fn new(artifacts: ArtifactSet, repair: RepairPolicy) -> Self {
        Self { artifacts, repair }
    }

    pub fn artifacts(&self) -> &ArtifactSet {
        &self.artifacts
    }

    /// Predicts all three targets for every row of `df`.
    ///
    /// An empty batch returns an empty result without touching any
    /// model.
    pub fn predict(&self, df: &DataFrame) -> Result<Vec<PredictionRow>, PredictionError> {
        let height = df.height();
        if height == 0 {
            return Ok(Vec::new());
        }

        let (claim, (severity, premium)) = rayon::join(
            || self.claim_pipeline(df),
            || {
                rayon::join(
                    || {
                        self.regressor_pipeline(
                            df,
                            &self.artifacts.severity_contract,
                            &self.artifacts.severity_model,
                            Pipeline::Severity,
                        )
                    },
                    || {
                        self.regressor_pipeline(
                            df,
                            &self.artifacts.premium_contract,
                            &self.artifacts.premium_model,
                            Pipeline::Premium,
                        )
                    },
                )
            },
        );
        let claim = claim?;
        let severity = severity?;
        let premium = premium?;

        let record_ids = optional_ints(df, "RecordID", height);
        let cover_ids = optional_ints(df, "UnderwrittenCoverID", height);
        let policy_ids = optional_ints(df, "PolicyID", height);
        let months = optional_strings(df, "TransactionMonth", height);

        let rows = (0..height)
            .map(|i| PredictionRow {
                record_id: record_ids[i],
                underwritten_cover_id: cover_ids[i],
                policy_id: policy_ids[i],
                transaction_month: months[i].clone(),
                claim_probability: claim[i],
                claim_class: u8::from(claim[i] >= CLASS_THRESHOLD),
                claim_severity: severity[i],
                premium_prediction: premium[i],
            })
            .collect();
        Ok(rows)
    }

    fn claim_pipeline(&self, df: &DataFrame) -> Result<Array1<f64>, PredictionError> {
        self.claim_inner(df).map_err(|source| PredictionError {
            pipeline: Pipeline::Claim,
            source,
        })
    }

    fn claim_inner(&self, df: &DataFrame) -> Result<Array1<f64>, PipelineError> {
        let batch = reconcile(df, &self.artifacts.claim_contract)?;
        let matrix = assemble::assemble(
            &batch,
            &self.artifacts.claim_contract,
            &self.artifacts.claim_encoder,
            &self.artifacts.claim_scaler,
            self.repair,
        )?;
        Ok(self.artifacts.claim_model.predict_proba(matrix.view())?)
    }

    fn regressor_pipeline(
        &self,
        df: &DataFrame,
        contract: &SchemaContract,
        model: &ForestRegressor,
        pipeline: Pipeline,
    ) -> Result<Array1<f64>, PredictionError> {
        let inner = || -> Result<Array1<f64>, PipelineError> {
            let batch = reconcile(df, contract)?;
            let matrix = assemble::numeric_block(&batch, contract)?;
            Ok(model.predict(matrix.view())?)
        };
        inner().map_err(|source| PredictionError { pipeline, source })
    }
}

/// Pulls an identifier column as nullable integers; a missing column or
/// an uncastable one serves as nulls rather than failing the batch.
fn optional_ints(df: &DataFrame, name: &str, height: usize) -> Vec<Option<i64>> {
    df.column(name)
        .ok()
        .and_then(|column| column.cast(&DataType::Int64).ok())
        .and_then(|casted| casted.i64().map(|chunked| chunked.into_iter().collect()).ok())
        .unwrap_or_else(|| vec![None; height])
}

fn optional_strings(df: &DataFrame, name: &str, height: usize) -> Vec<Option<String>> {
    df.column(name)
        .ok()
        .and_then(|column| column.cast(&DataType::String).ok())
        .and_then(|casted| {
            casted
                .str()
                .map(|chunked| {
                    chunked
                        .into_iter()
                        .map(|cell| cell.map(str::to_string))
                        .collect()
                })
                .ok()
        })
        .unwrap_or_else(|| vec![None; height])
}
