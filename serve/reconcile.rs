//! # Feature Reconciliation
//!
//! Converts an arbitrary uploaded batch into a batch that satisfies one
//! model's [`SchemaContract`] exactly. Reconciliation is total over column
//! shape: missing columns are inserted with fill values, extra columns are
//! left behind, and every cell is coerced to the contract's type, so the
//! output is fully populated before matrix assembly ever sees it.
//!
//! The fill rules mirror the training pipeline:
//! - a missing or null numeric cell becomes `0.0`;
//! - a missing or null categorical cell becomes the `"__NA__"` sentinel
//!   the encoder was fitted with.

use crate::contract::SchemaContract;
use polars::prelude::*;
use std::ops::Deref;

/// Sentinel the categorical encoder was fitted with for absent values.
pub const NA_SENTINEL: &str = "__NA__";

/// A batch certified to conform to a [`SchemaContract`].
///
/// Construction goes through [`reconcile`] only, so holding a value of
/// this type is proof that every contract column is present, typed and
/// fully populated, laid out numeric-first in contract order.
#[repr(transparent)]
#[derive(Debug, Clone)]
pub struct ReconciledBatch(DataFrame);

impl ReconciledBatch {
    pub fn frame(&self) -> &DataFrame {
        &self.0
    }

    pub fn height(&self) -> usize {
        self.0.height()
    }

    pub fn is_empty(&self) -> bool {
        self.0.height() == 0
    }
}

impl Deref for ReconciledBatch {
    type Target = DataFrame;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Reconciles `df` against `contract`.
///
/// Never fails on missing or extra columns. An empty input batch yields an
/// empty (zero-row) `ReconciledBatch`; callers short-circuit before any
/// model runs on it.
pub fn reconcile(df: &DataFrame, contract: &SchemaContract) -> PolarsResult<ReconciledBatch> {
    let height = df.height();
    let mut columns = Vec::with_capacity(contract.column_count());

    for name in &contract.numeric {
        let values = match df.column(name.as_str()) {
            Ok(column) => numeric_values(column)?,
            Err(_) => vec![0.0; height],
        };
        columns.push(Column::new(name.as_str().into(), values));
    }

    for name in &contract.categorical {
        let values = match df.column(name.as_str()) {
            Ok(column) => categorical_values(column)?,
            Err(_) => vec![NA_SENTINEL.to_string(); height],
        };
        columns.push(Column::new(name.as_str().into(), values));
    }

    Ok(ReconciledBatch(DataFrame::new(columns)?))
}

/// Coerces one column to fully-populated `f64` values.
///
/// Text cells are parsed individually so that a single stray value cannot
/// poison the column: unparseable text degrades to `0.0`, the same fill a
/// missing cell receives.
fn numeric_values(column: &Column) -> PolarsResult<Vec<f64>> {
    match column.dtype() {
        DataType::String => {
            let chunked = column.str()?;
            Ok(chunked
                .into_iter()
                .map(|cell| {
                    cell.and_then(|text| text.trim().parse::<f64>().ok())
                        .unwrap_or(0.0)
                })
                .collect())
        }
        _ => {
            let casted = column.cast(&DataType::Float64)?;
            let chunked = casted.f64()?;
            Ok(chunked
                .into_iter()
                .map(|cell| cell.unwrap_or(0.0))
                .collect())
        }
    }
}

/// Coerces one column to fully-populated string values, substituting the
/// `"__NA__"` sentinel for nulls.
fn categorical_values(column: &Column) -> PolarsResult<Vec<String>> {
    let casted = column.cast(&DataType::String)?;
    let chunked = casted.str()?;
    Ok(chunked
        .into_iter()
        .map(|cell| match cell {
            Some(text) => text.to_string(),
            None => NA_SENTINEL.to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::collections::BTreeSet;

    fn contract() -> SchemaContract {
        SchemaContract {
            numeric: vec!["kilowatts".to_string(), "cubiccapacity".to_string()],
            categorical: vec!["Gender".to_string()],
            drop: BTreeSet::from(["RecordID".to_string()]),
        }
    }

    fn column_f64(batch: &ReconciledBatch, name: &str) -> Vec<f64> {
        batch
            .frame()
            .column(name)
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect()
    }

    fn column_str(batch: &ReconciledBatch, name: &str) -> Vec<String> {
        batch
            .frame()
            .column(name)
            .unwrap()
            .str()
            .unwrap()
            .into_no_null_iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn missing_numeric_column_fills_with_zero() {
        let df = DataFrame::new(vec![
            Column::new("cubiccapacity".into(), &[1398.0f64, 1597.0]),
            Column::new("Gender".into(), &["F", "M"]),
        ])
        .unwrap();
        let batch = reconcile(&df, &contract()).unwrap();
        assert_eq!(column_f64(&batch, "kilowatts"), vec![0.0, 0.0]);
        assert_eq!(column_f64(&batch, "cubiccapacity"), vec![1398.0, 1597.0]);
    }

    #[test]
    fn missing_categorical_column_fills_with_sentinel() {
        let df = DataFrame::new(vec![Column::new(
            "kilowatts".into(),
            &[75.0f64, 90.0, 111.0],
        )])
        .unwrap();
        let batch = reconcile(&df, &contract()).unwrap();
        assert_eq!(
            column_str(&batch, "Gender"),
            vec![NA_SENTINEL, NA_SENTINEL, NA_SENTINEL]
        );
    }

    #[test]
    fn drop_and_unknown_columns_do_not_propagate() {
        let df = DataFrame::new(vec![
            Column::new("kilowatts".into(), &[75.0f64]),
            Column::new("cubiccapacity".into(), &[1398.0f64]),
            Column::new("Gender".into(), &["F"]),
            Column::new("RecordID".into(), &[17i64]),
            Column::new("UnexpectedExtra".into(), &["x"]),
        ])
        .unwrap();
        let batch = reconcile(&df, &contract()).unwrap();
        let names: Vec<&str> = batch
            .frame()
            .get_column_names()
            .iter()
            .map(|n| n.as_str())
            .collect();
        assert_eq!(names, vec!["kilowatts", "cubiccapacity", "Gender"]);
    }

    #[test]
    fn null_cells_are_filled_not_propagated() {
        let df = DataFrame::new(vec![
            Column::new("kilowatts".into(), &[Some(75.0f64), None]),
            Column::new("cubiccapacity".into(), &[None, Some(1597.0f64)]),
            Column::new("Gender".into(), &[Some("F"), None]),
        ])
        .unwrap();
        let batch = reconcile(&df, &contract()).unwrap();
        assert_eq!(column_f64(&batch, "kilowatts"), vec![75.0, 0.0]);
        assert_eq!(column_f64(&batch, "cubiccapacity"), vec![0.0, 1597.0]);
        assert_eq!(column_str(&batch, "Gender"), vec!["F", NA_SENTINEL]);
    }

    #[test]
    fn stray_text_in_numeric_column_degrades_to_zero() {
        let df = DataFrame::new(vec![Column::new(
            "kilowatts".into(),
            &["75.5", "not a number", ""],
        )])
        .unwrap();
        let batch = reconcile(&df, &contract()).unwrap();
        let values = column_f64(&batch, "kilowatts");
        assert_abs_diff_eq!(values[0], 75.5, epsilon = 1e-12);
        assert_abs_diff_eq!(values[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(values[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn boolean_categoricals_are_stringified() {
        let df =
            DataFrame::new(vec![Column::new("TrackingDevice".into(), &[true, false])]).unwrap();
        let contract = SchemaContract {
            numeric: vec![],
            categorical: vec!["TrackingDevice".to_string()],
            drop: BTreeSet::new(),
        };
        let batch = reconcile(&df, &contract).unwrap();
        assert_eq!(column_str(&batch, "TrackingDevice"), vec!["true", "false"]);
    }

    #[test]
    fn empty_batch_reconciles_to_empty() {
        let df = DataFrame::new(vec![
            Column::new("kilowatts".into(), Vec::<f64>::new()),
            Column::new("Gender".into(), Vec::<String>::new()),
        ])
        .unwrap();
        let batch = reconcile(&df, &contract()).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.frame().width(), 3);
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let df = DataFrame::new(vec![
            Column::new("cubiccapacity".into(), &[Some(1398.0f64), None]),
            Column::new("Gender".into(), &[Some("F"), None]),
            Column::new("UnexpectedExtra".into(), &[1i64, 2]),
        ])
        .unwrap();
        let c = contract();
        let once = reconcile(&df, &c).unwrap();
        let twice = reconcile(once.frame(), &c).unwrap();
        assert!(once.frame().equals(twice.frame()));
    }
}
