//! # Session Store
//!
//! Custody of uploaded datasets. Each session, identified by a
//! caller-provided handle, owns at most one dataset at a time; a new
//! upload replaces the previous dataset wholesale. Publication is
//! atomic from the readers' point of view: a reader either sees the old
//! dataset or the fully-committed new one, never a partial write,
//! because the store only ever swaps a completed [`Dataset`] behind the
//! lock.
//!
//! Datasets live only as long as their session; nothing here persists
//! across process restarts.

use polars::prelude::DataFrame;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Rows per retrieval page.
pub const PAGE_SIZE: usize = 10;

/// Caller-provided handle scoping one uploaded dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No dataset has been uploaded for session '{0}'.")]
    NoDataset(SessionId),
}

/// One fully-committed uploaded dataset.
#[derive(Debug)]
pub struct Dataset {
    frame: DataFrame,
}

impl Dataset {
    pub fn new(frame: DataFrame) -> Self {
        Self { frame }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn total_rows(&self) -> usize {
        self.frame.height()
    }

    /// Rows `[index * PAGE_SIZE, index * PAGE_SIZE + PAGE_SIZE)`,
    /// clamped to the dataset's bounds. A page past the end is an empty
    /// slice with the dataset's schema, not an error.
    pub fn page_slice(&self, index: usize) -> DataFrame {
        let start = index.saturating_mul(PAGE_SIZE);
        if start >= self.frame.height() {
            return self.frame.clear();
        }
        self.frame.slice(start as i64, PAGE_SIZE)
    }
}

/// Shared, session-scoped dataset custody.
#[derive(Debug, Default)]
pub struct SessionStore {
    datasets: RwLock<HashMap<SessionId, Arc<Dataset>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a fully-constructed dataset for `session`, replacing
    /// whatever was there. Readers holding the previous `Arc` keep a
    /// consistent view of the old dataset until they drop it.
    pub fn publish(&self, session: &SessionId, dataset: Dataset) -> Arc<Dataset> {
        let dataset = Arc::new(dataset);
        let mut guard = self
            .datasets
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.insert(session.clone(), Arc::clone(&dataset));
        dataset
    }

    /// The current dataset for `session`, or [`SessionError::NoDataset`]
    /// if nothing has been uploaded yet.
    pub fn dataset(&self, session: &SessionId) -> Result<Arc<Dataset>, SessionError> {
        let guard = self.datasets.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .get(session)
            .cloned()
            .ok_or_else(|| SessionError::NoDataset(session.clone()))
    }

    /// Ends a session, dropping its dataset. Returns whether a dataset
    /// existed.
    pub fn discard(&self, session: &SessionId) -> bool {
        let mut guard = self
            .datasets
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.remove(session).is_some()
    }
}
