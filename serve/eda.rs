//! # Exploratory Preview
//!
//! Lightweight descriptive statistics over a slice of the uploaded
//! dataset: a per-column numeric summary (count, mean, std, min,
//! quartiles, max) and the most frequent values of each categorical
//! column. Columns are classified by their uploaded value type, not by
//! any model contract: the preview describes the data as the caller
//! sent it.
//!
//! Upload-time previews are computed over a bounded uniform sample so an
//! arbitrarily large dataset cannot stall the response; page-time
//! previews cover exactly the requested slice.

use itertools::Itertools;
use polars::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Largest slice the upload-time preview will describe. Bigger datasets
/// are sampled uniformly down to this many rows.
pub const EDA_SAMPLE_CAP: usize = 1000;

/// How many of each categorical column's values the preview reports.
const TOP_VALUES: usize = 5;

/// Describe-style statistics of one numeric column. Moments are absent
/// when the column has no usable values (std additionally requires two).
#[derive(Debug, Clone, Serialize)]
pub struct NumericSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub q25: Option<f64>,
    pub q50: Option<f64>,
    pub q75: Option<f64>,
    pub max: Option<f64>,
}

/// One categorical value and how often it occurs in the slice.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CategoryCount {
    pub value: String,
    pub count: u32,
}

/// The statistical preview returned alongside uploads and pages.
#[derive(Debug, Clone, Serialize)]
pub struct EdaPreview {
    pub numeric_summary: BTreeMap<String, NumericSummary>,
    pub top_categories: BTreeMap<String, Vec<CategoryCount>>,
}

/// Computes the preview for exactly the rows of `df`.
pub fn preview(df: &DataFrame) -> PolarsResult<EdaPreview> {
    let mut numeric_summary = BTreeMap::new();
    let mut top_categories = BTreeMap::new();
    for column in df.get_columns() {
        let name = column.name().to_string();
        match column.dtype() {
            dtype if is_numeric(dtype) => {
                numeric_summary.insert(name, summarize_numeric(column)?);
            }
            DataType::String | DataType::Boolean => {
                top_categories.insert(name, top_values(column)?);
            }
            _ => {}
        }
    }
    Ok(EdaPreview {
        numeric_summary,
        top_categories,
    })
}

/// Uniformly samples `df` down to [`EDA_SAMPLE_CAP`] rows (without
/// replacement, original row order preserved); smaller frames pass
/// through untouched.
pub fn bounded_sample(df: &DataFrame) -> PolarsResult<DataFrame> {
    let height = df.height();
    if height <= EDA_SAMPLE_CAP {
        return Ok(df.clone());
    }
    let mut rng = rand::thread_rng();
    let mut indices: Vec<IdxSize> = rand::seq::index::sample(&mut rng, height, EDA_SAMPLE_CAP)
        .into_iter()
        .map(|i| i as IdxSize)
        .collect();
    indices.sort_unstable();
    df.take(&IdxCa::from_vec("sample".into(), indices))
}

fn is_numeric(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Float64
            | DataType::Float32
            | DataType::Int64
            | DataType::Int32
            | DataType::Int16
            | DataType::Int8
            | DataType::UInt64
            | DataType::UInt32
            | DataType::UInt16
            | DataType::UInt8
    )
}

fn summarize_numeric(column: &Column) -> PolarsResult<NumericSummary> {
    let casted = column.cast(&DataType::Float64)?;
    let mut values: Vec<f64> = casted
        .f64()?
        .into_iter()
        .flatten()
        .filter(|v| !v.is_nan())
        .collect();
    values.sort_unstable_by(f64::total_cmp);

    let count = values.len();
    if count == 0 {
        return Ok(NumericSummary {
            count,
            mean: None,
            std: None,
            min: None,
            q25: None,
            q50: None,
            q75: None,
            max: None,
        });
    }

    let mean = values.iter().sum::<f64>() / count as f64;
    let std = if count > 1 {
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count as f64 - 1.0);
        Some(variance.sqrt())
    } else {
        None
    };

    Ok(NumericSummary {
        count,
        mean: Some(mean),
        std,
        min: Some(values[0]),
        q25: Some(quantile(&values, 0.25)),
        q50: Some(quantile(&values, 0.50)),
        q75: Some(quantile(&values, 0.75)),
        max: Some(values[count - 1]),
    })
}

/// Linear-interpolated quantile over an ascending slice, matching the
/// describe semantics of the training-side tooling.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

fn top_values(column: &Column) -> PolarsResult<Vec<CategoryCount>> {
    let casted = column.cast(&DataType::String)?;
    let mut counts: HashMap<String, u32> = HashMap::new();
    for cell in casted.str()?.into_iter().flatten() {
        *counts.entry(cell.to_string()).or_insert(0) += 1;
    }
    Ok(counts
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .take(TOP_VALUES)
        .map(|(value, count)| CategoryCount { value, count })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn numeric_summary_matches_describe_semantics() {
        let df = DataFrame::new(vec![Column::new(
            "kilowatts".into(),
            &[Some(1.0f64), Some(2.0), Some(3.0), Some(4.0), None],
        )])
        .unwrap();
        let out = preview(&df).unwrap();
        let summary = &out.numeric_summary["kilowatts"];
        assert_eq!(summary.count, 4);
        assert_abs_diff_eq!(summary.mean.unwrap(), 2.5, epsilon = 1e-12);
        // Sample standard deviation of 1..4.
        assert_abs_diff_eq!(
            summary.std.unwrap(),
            (5.0f64 / 3.0).sqrt(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(summary.min.unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.q25.unwrap(), 1.75, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.q50.unwrap(), 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.q75.unwrap(), 3.25, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.max.unwrap(), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn all_null_numeric_column_reports_zero_count() {
        let df = DataFrame::new(vec![Column::new(
            "kilowatts".into(),
            &[None::<f64>, None, None],
        )])
        .unwrap();
        let out = preview(&df).unwrap();
        let summary = &out.numeric_summary["kilowatts"];
        assert_eq!(summary.count, 0);
        assert!(summary.mean.is_none());
        assert!(summary.max.is_none());
    }

    #[test]
    fn top_categories_are_ranked_with_deterministic_ties() {
        let values = ["B", "A", "B", "C", "A", "D", "E", "F", "B"];
        let df = DataFrame::new(vec![Column::new("Province".into(), &values)]).unwrap();
        let out = preview(&df).unwrap();
        let top = &out.top_categories["Province"];
        assert_eq!(top.len(), 5);
        assert_eq!(top[0].value, "B");
        assert_eq!(top[0].count, 3);
        assert_eq!(top[1].value, "A");
        assert_eq!(top[1].count, 2);
        // The singletons tie; value order breaks the tie.
        assert_eq!(top[2].value, "C");
        assert_eq!(top[3].value, "D");
        assert_eq!(top[4].value, "E");
    }

    #[test]
    fn single_value_column_has_no_std() {
        let df = DataFrame::new(vec![Column::new("kilowatts".into(), &[42.0f64])]).unwrap();
        let out = preview(&df).unwrap();
        let summary = &out.numeric_summary["kilowatts"];
        assert_eq!(summary.count, 1);
        assert!(summary.std.is_none());
        assert_abs_diff_eq!(summary.q50.unwrap(), 42.0, epsilon = 1e-12);
    }

    #[test]
    fn small_frames_are_not_sampled() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let df = DataFrame::new(vec![Column::new("x".into(), values)]).unwrap();
        let sampled = bounded_sample(&df).unwrap();
        assert_eq!(sampled.height(), 100);
        assert!(df.equals(&sampled));
    }

    #[test]
    fn large_frames_sample_to_the_cap_preserving_order() {
        let values: Vec<f64> = (0..2500).map(|i| i as f64).collect();
        let df = DataFrame::new(vec![Column::new("x".into(), values)]).unwrap();
        let sampled = bounded_sample(&df).unwrap();
        assert_eq!(sampled.height(), EDA_SAMPLE_CAP);
        let xs: Vec<f64> = sampled
            .column("x")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!(xs.windows(2).all(|w| w[0] < w[1]));
    }
}
