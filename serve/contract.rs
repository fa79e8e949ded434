//! # Schema Contracts
//!
//! A `SchemaContract` is the frozen description of the columns one model
//! expects: which are numeric, which are categorical, and which must be
//! removed before inference. Every model in the ensemble carries its own
//! contract, and downstream reconciliation is defined entirely in terms of
//! it.
//!
//! Contracts are explicit values produced once at startup and passed into
//! every reconcile call. They come from one of two constructors:
//!
//! - [`SchemaContract::load`] reads a training-time manifest (TOML). This
//!   is the intended production path: the column partition is whatever the
//!   training run recorded, independent of live traffic.
//! - [`SchemaContract::discover`] partitions the columns of a concrete
//!   batch by value type, minus a drop-list. This covers deployments that
//!   ship models without a manifest and score a known dataset.
//!
//! Once constructed a contract is immutable; later batches conform to it
//! or are reconciled into conformance, they never redefine it.

use polars::prelude::{DataFrame, DataType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

/// Identifier and leakage-prone columns removed ahead of
/// claim-occurrence inference.
pub const CLAIM_DROP_COLUMNS: &[&str] = &[
    "RecordID",
    "UnderwrittenCoverID",
    "PolicyID",
    "TransactionMonth",
    "VehicleIntroDate",
    "CalculatedPremiumPerTerm",
    "TotalPremium",
    "SumInsured",
    "CapitalOutstanding",
];

/// The severity regressor works on a dense numeric frame: identifiers,
/// every categorical column, and its own training target are removed.
pub const SEVERITY_DROP_COLUMNS: &[&str] = &[
    "RecordID",
    "UnderwrittenCoverID",
    "PolicyID",
    "TransactionMonth",
    "Title",
    "Bank",
    "AccountType",
    "Gender",
    "Country",
    "Province",
    "PostalCode",
    "MainCrestaZone",
    "SubCrestaZone",
    "ItemType",
    "mmcode",
    "VehicleType",
    "make",
    "Model",
    "bodytype",
    "VehicleIntroDate",
    "AlarmImmobiliser",
    "TrackingDevice",
    "CapitalOutstanding",
    "SumInsured",
    "TotalPremium",
    "TotalClaims",
];

/// The premium regressor drops only the row identifiers.
pub const PREMIUM_DROP_COLUMNS: &[&str] = &[
    "RecordID",
    "UnderwrittenCoverID",
    "PolicyID",
    "TransactionMonth",
];

/// Errors arising while constructing or validating a schema contract.
#[derive(Error, Debug)]
pub enum ContractError {
    #[error("Failed to read contract manifest: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse contract manifest: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error(
        "No feature columns remain after applying the drop-list. The contract cannot describe an empty schema."
    )]
    SchemaUndiscoverable,
    #[error("Column '{0}' appears in more than one contract set. The numeric, categorical and drop sets must be disjoint.")]
    OverlappingSets(String),
    #[error("Column '{0}' is listed twice within the same contract set.")]
    DuplicateColumn(String),
}

/// The frozen column partition a single model expects.
///
/// `numeric` and `categorical` keep their declared order: feature-matrix
/// assembly lays columns out in exactly this order, so reordering a
/// contract is a breaking change to the model it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaContract {
    pub numeric: Vec<String>,
    pub categorical: Vec<String>,
    pub drop: BTreeSet<String>,
}

impl SchemaContract {
    /// Loads a contract from a training-time TOML manifest and validates
    /// that the three sets are pairwise disjoint and duplicate-free.
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        let text = std::fs::read_to_string(path)?;
        let contract: SchemaContract = toml::from_str(&text)?;
        contract.validate()?;
        Ok(contract)
    }

    /// Derives a contract from a concrete batch: columns on `drop_list`
    /// are excluded, the remainder is partitioned by value type. Columns
    /// of neither numeric nor text/boolean type (dates, nested values)
    /// fall into no set and are therefore dropped by reconciliation.
    pub fn discover(df: &DataFrame, drop_list: &[&str]) -> Result<Self, ContractError> {
        let drop: BTreeSet<String> = drop_list.iter().map(|s| (*s).to_string()).collect();
        let mut numeric = Vec::new();
        let mut categorical = Vec::new();
        for column in df.get_columns() {
            let name = column.name().as_str();
            if drop.contains(name) {
                continue;
            }
            match column.dtype() {
                DataType::Float64
                | DataType::Float32
                | DataType::Int64
                | DataType::Int32
                | DataType::Int16
                | DataType::Int8
                | DataType::UInt64
                | DataType::UInt32
                | DataType::UInt16
                | DataType::UInt8 => numeric.push(name.to_string()),
                DataType::String | DataType::Boolean => categorical.push(name.to_string()),
                _ => {}
            }
        }
        if numeric.is_empty() && categorical.is_empty() {
            return Err(ContractError::SchemaUndiscoverable);
        }
        Ok(Self {
            numeric,
            categorical,
            drop,
        })
    }

    /// Total width of the contract's feature surface before encoding.
    pub fn column_count(&self) -> usize {
        self.numeric.len() + self.categorical.len()
    }

    fn validate(&self) -> Result<(), ContractError> {
        if self.numeric.is_empty() && self.categorical.is_empty() {
            return Err(ContractError::SchemaUndiscoverable);
        }
        let mut seen = BTreeSet::new();
        for name in self.numeric.iter().chain(self.categorical.iter()) {
            if !seen.insert(name.as_str()) {
                return Err(ContractError::DuplicateColumn(name.clone()));
            }
        }
        for name in self.numeric.iter().chain(self.categorical.iter()) {
            if self.drop.contains(name) {
                return Err(ContractError::OverlappingSets(name.clone()));
            }
        }
        Ok(())
    }
}
