//! # Feature Matrix Assembly
//!
//! Turns a reconciled batch into the exact numeric layout one model
//! expects: a dense block built from the contract's numeric columns in
//! contract order, and, for the claim pipeline, a sparse one-hot block
//! appended to it.
//!
//! The assembled width and the fitted scaler's width can disagree when
//! the encoder saw a different category universe at serving time than at
//! fit time. The **dimension repair** step reconciles them by index:
//!
//! - narrower than expected: the categorical block is right-padded with
//!   zero columns, keeping the scaler's column statistics aligned;
//! - wider than expected: the categorical block is truncated to the
//!   width the scaler leaves for it, a lossy best-effort repair.
//!
//! Both repairs log at warn level and are invisible to the caller. How
//! much drift is repairable is an explicit [`RepairPolicy`]; beyond its
//! tolerance the assembler fails closed with [`ScaleDimensionError`].

use crate::artifact::{ArtifactError, OneHotEncoder, ScaleDimensionError, StandardScaler};
use crate::contract::SchemaContract;
use crate::reconcile::ReconciledBatch;
use ndarray::{Array2, s};
use polars::prelude::{Float64Type, IndexOrder, PolarsError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("Error from the underlying DataFrame library: {0}")]
    FrameError(#[from] PolarsError),
    #[error(transparent)]
    ScaleDimension(#[from] ScaleDimensionError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// How far the assembled width may drift from the scaler's expectation
/// before repair gives way to failing closed.
///
/// The default is unbounded leniency: any drift is repaired. A bounded
/// tolerance turns excessive drift into [`ScaleDimensionError`] instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairPolicy {
    tolerance: Option<usize>,
}

impl RepairPolicy {
    pub fn lenient() -> Self {
        Self { tolerance: None }
    }

    pub fn with_tolerance(columns: usize) -> Self {
        Self {
            tolerance: Some(columns),
        }
    }

    fn permits(&self, drift: usize) -> bool {
        self.tolerance.is_none_or(|limit| drift <= limit)
    }
}

/// A compressed sparse row block holding the encoded categorical
/// features. Kept sparse through repair and densified only once, when
/// the full matrix is laid out for scaling.
#[derive(Debug, Clone)]
pub struct SparseBlock {
    ncols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
}

impl SparseBlock {
    pub fn new(ncols: usize) -> Self {
        Self {
            ncols,
            row_offsets: vec![0],
            col_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.row_offsets.len() - 1
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Appends an entry to the row currently under construction.
    pub fn push(&mut self, col: usize, value: f64) {
        debug_assert!(col < self.ncols);
        self.col_indices.push(col);
        self.values.push(value);
    }

    /// Closes the row under construction.
    pub fn finish_row(&mut self) {
        self.row_offsets.push(self.col_indices.len());
    }

    /// Widens the block with all-zero columns on the right. No entries
    /// change, only the declared width.
    pub fn pad_right(&mut self, extra: usize) {
        self.ncols += extra;
    }

    /// Narrows the block to its first `keep` columns, discarding every
    /// entry beyond them.
    pub fn truncate_columns(&mut self, keep: usize) {
        let mut row_offsets = Vec::with_capacity(self.row_offsets.len());
        let mut col_indices = Vec::with_capacity(self.col_indices.len());
        let mut values = Vec::with_capacity(self.values.len());
        row_offsets.push(0);
        for row in 0..self.nrows() {
            for idx in self.row_offsets[row]..self.row_offsets[row + 1] {
                if self.col_indices[idx] < keep {
                    col_indices.push(self.col_indices[idx]);
                    values.push(self.values[idx]);
                }
            }
            row_offsets.push(col_indices.len());
        }
        self.row_offsets = row_offsets;
        self.col_indices = col_indices;
        self.values = values;
        self.ncols = keep;
    }

    /// Writes the block's entries into `dense`, shifted right by
    /// `col_offset`.
    pub fn scatter_into(&self, dense: &mut Array2<f64>, col_offset: usize) {
        for row in 0..self.nrows() {
            for idx in self.row_offsets[row]..self.row_offsets[row + 1] {
                dense[[row, col_offset + self.col_indices[idx]]] = self.values[idx];
            }
        }
    }
}

/// Builds the dense numeric block: one column per contract numeric
/// column, contract order, row-major. This alone is the feature matrix
/// for the dense regressor pipelines.
pub fn numeric_block(
    batch: &ReconciledBatch,
    contract: &SchemaContract,
) -> Result<Array2<f64>, AssembleError> {
    if contract.numeric.is_empty() {
        return Ok(Array2::zeros((batch.height(), 0)));
    }
    let sub = batch
        .frame()
        .select(contract.numeric.iter().map(String::as_str))?;
    Ok(sub.to_ndarray::<Float64Type>(IndexOrder::C)?)
}

/// Assembles the scaled claim feature matrix: numeric block, encoded
/// categorical block, dimension repair, then the fitted scaler.
pub fn assemble(
    batch: &ReconciledBatch,
    contract: &SchemaContract,
    encoder: &OneHotEncoder,
    scaler: &StandardScaler,
    policy: RepairPolicy,
) -> Result<Array2<f64>, AssembleError> {
    let numeric = numeric_block(batch, contract)?;

    if contract.categorical.is_empty() {
        return Ok(scaler.transform(numeric)?);
    }

    let mut categorical = encoded_block(batch, encoder)?;
    let expected = scaler.expected_width();
    let actual = numeric.ncols() + categorical.ncols();
    if actual != expected {
        let drift = actual.abs_diff(expected);
        if !policy.permits(drift) {
            return Err(ScaleDimensionError { expected, actual }.into());
        }
        if actual < expected {
            log::warn!(
                "Feature width mismatch: scaler expects {expected}, assembled {actual}; \
                 padding categorical block with {drift} zero columns"
            );
            categorical.pad_right(drift);
        } else {
            let keep = expected.saturating_sub(numeric.ncols());
            log::warn!(
                "Feature width mismatch: scaler expects {expected}, assembled {actual}; \
                 truncating categorical block to {keep} columns"
            );
            categorical.truncate_columns(keep);
        }
    }

    let width = numeric.ncols() + categorical.ncols();
    let mut full = Array2::zeros((batch.height(), width));
    full.slice_mut(s![.., ..numeric.ncols()]).assign(&numeric);
    categorical.scatter_into(&mut full, numeric.ncols());
    Ok(scaler.transform(full)?)
}

fn encoded_block(
    batch: &ReconciledBatch,
    encoder: &OneHotEncoder,
) -> Result<SparseBlock, AssembleError> {
    let hot_slots = encoder.encode(batch)?;
    let mut block = SparseBlock::new(encoder.output_width());
    for row_slots in &hot_slots {
        for &slot in row_slots {
            block.push(slot, 1.0);
        }
        block.finish_row();
    }
    Ok(block)
}
