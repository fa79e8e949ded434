//! # Inference Service
//!
//! The surface handed to the transport layer: upload a dataset, page
//! through it with predictions, or score one row. The service wires the
//! session store, the EDA preview and the ensemble dispatcher together
//! and folds every subsystem failure into a single [`ServeError`] with a
//! machine-readable kind, so callers can render
//! `{ "error_kind": ..., "message": ... }` without inspecting Rust
//! types.
//!
//! No retry policy lives here; a request runs to completion or fails
//! outright, and nothing below this layer crashes the process.

use crate::artifact::{ArtifactError, ArtifactSet};
use crate::assemble::RepairPolicy;
use crate::contract::ContractError;
use crate::eda::{self, EdaPreview};
use crate::ensemble::{EnsembleDispatcher, PredictionError, PredictionRow};
use crate::session::{Dataset, PAGE_SIZE, SessionError, SessionId, SessionStore};
use polars::prelude::*;
use serde::Serialize;
use serde_json::{Value, json};
use std::io::Cursor;
use thiserror::Error;

/// Request-level failures, each with a stable machine-readable kind.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("Error from the underlying DataFrame library: {0}")]
    Frame(#[from] PolarsError),
}

impl ServeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedInput(_) => "malformed_input",
            Self::Session(SessionError::NoDataset(_)) => "no_dataset",
            Self::Prediction(err) if err.is_scale_dimension() => "scale_dimension",
            Self::Prediction(_) => "prediction_failed",
            Self::Artifact(_) => "artifact",
            Self::Contract(ContractError::SchemaUndiscoverable) => "schema_undiscoverable",
            Self::Contract(_) => "contract",
            Self::Frame(_) => "internal",
        }
    }

    /// The wire shape of an error response.
    pub fn to_wire(&self) -> Value {
        json!({
            "error_kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

/// Response to a dataset upload: the total row count, the first page
/// fully ensembled, and a preview computed over a bounded sample of the
/// whole dataset.
#[derive(Debug, Serialize)]
pub struct UploadReceipt {
    pub total_rows: usize,
    pub preview: Vec<PredictionRow>,
    pub eda_preview: EdaPreview,
    pub page: usize,
}

/// One retrieved page: its rows fully ensembled, plus a preview of
/// exactly this slice.
#[derive(Debug, Serialize)]
pub struct PageResult {
    pub rows: Vec<PredictionRow>,
    pub eda_preview: EdaPreview,
    pub page: usize,
}

/// The three model outputs for a single scored row.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinglePrediction {
    pub claim_probability: f64,
    pub claim_class: u8,
    pub claim_severity: f64,
    pub premium_prediction: f64,
}

/// The inference-serving entry point: one dispatcher over frozen
/// artifacts, one session store for uploaded data.
#[derive(Debug)]
pub struct InferenceService {
    dispatcher: EnsembleDispatcher,
    store: SessionStore,
}

impl InferenceService {
    pub fn new(artifacts: ArtifactSet, repair: RepairPolicy) -> Self {
        Self {
            dispatcher: EnsembleDispatcher::new(artifacts, repair),
            store: SessionStore::new(),
        }
    }

    pub fn dispatcher(&self) -> &EnsembleDispatcher {
        &self.dispatcher
    }

    /// Parses a CSV payload, ensembles its first page, previews a
    /// bounded sample, and atomically publishes the dataset for
    /// `session`, replacing any previous upload.
    pub fn upload(&self, session: &SessionId, bytes: &[u8]) -> Result<UploadReceipt, ServeError> {
        if bytes.is_empty() {
            return Err(ServeError::MalformedInput("empty upload payload".into()));
        }
        let df = CsvReadOptions::default()
            .with_infer_schema_length(Some(1000))
            .with_has_header(true)
            .into_reader_with_file_handle(Cursor::new(bytes))
            .finish()
            .map_err(|e| ServeError::MalformedInput(e.to_string()))?;
        log::info!(
            "Uploaded dataset for session '{session}': {} rows, columns {:?}",
            df.height(),
            df.get_column_names()
        );

        let preview = self.dispatcher.predict(&df.head(Some(PAGE_SIZE)))?;
        let eda_preview = eda::preview(&eda::bounded_sample(&df)?)?;
        let total_rows = df.height();
        self.store.publish(session, Dataset::new(df));
        Ok(UploadReceipt {
            total_rows,
            preview,
            eda_preview,
            page: 0,
        })
    }

    /// Serves page `index` of the session's dataset, each row ensembled,
    /// with a preview of exactly that slice.
    pub fn page(&self, session: &SessionId, index: usize) -> Result<PageResult, ServeError> {
        let dataset = self.store.dataset(session)?;
        let slice = dataset.page_slice(index);
        let rows = self.dispatcher.predict(&slice)?;
        let eda_preview = eda::preview(&slice)?;
        Ok(PageResult {
            rows,
            eda_preview,
            page: index,
        })
    }

    /// Scores a single row supplied as a JSON object of scalar column
    /// values. Columns the contracts need but the payload omits are
    /// filled by reconciliation, exactly as for batch uploads.
    pub fn predict_single(&self, payload: &Value) -> Result<SinglePrediction, ServeError> {
        let object = payload.as_object().ok_or_else(|| {
            ServeError::MalformedInput("expected a JSON object of column values".into())
        })?;

        let mut columns = Vec::with_capacity(object.len());
        for (name, value) in object {
            let column = match value {
                Value::Number(number) => {
                    let cell = number.as_f64().ok_or_else(|| {
                        ServeError::MalformedInput(format!(
                            "column '{name}' holds a number outside the f64 range"
                        ))
                    })?;
                    Column::new(name.as_str().into(), &[cell])
                }
                Value::String(text) => Column::new(name.as_str().into(), &[text.as_str()]),
                Value::Bool(flag) => Column::new(name.as_str().into(), &[*flag]),
                Value::Null => continue,
                Value::Array(_) | Value::Object(_) => {
                    return Err(ServeError::MalformedInput(format!(
                        "column '{name}' must be a scalar value"
                    )));
                }
            };
            columns.push(column);
        }
        if columns.is_empty() {
            return Err(ServeError::MalformedInput(
                "payload contains no scalar column values".into(),
            ));
        }

        let df = DataFrame::new(columns)?;
        let row = self
            .dispatcher
            .predict(&df)?
            .into_iter()
            .next()
            .ok_or_else(|| ServeError::MalformedInput("payload produced no rows".into()))?;
        Ok(SinglePrediction {
            claim_probability: row.claim_probability,
            claim_class: row.claim_class,
            claim_severity: row.claim_severity,
            premium_prediction: row.premium_prediction,
        })
    }
}
