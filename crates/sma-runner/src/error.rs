use sma_core::{AdapterError, ManifestError, RunDataError, StateError, TemplateError};
use thiserror::Error;

use crate::collect::CollectReport;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("connect failed: {0}")]
    Connection(#[source] AdapterError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    RunData(#[from] RunDataError),
    #[error("report template rejected: {0}")]
    Template(#[from] TemplateError),
    #[error("run metadata could not be persisted: {0}")]
    Persistence(#[from] ManifestError),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("trigger failed: {0}")]
    Trigger(String),
    #[error("collection timed out waiting for {}", .report.timed_out.join(", "))]
    CollectionTimeout { report: Box<CollectReport> },
}

impl AgentError {
    /// Partial results carried by a timed-out collection.
    pub fn partial_report(&self) -> Option<&CollectReport> {
        match self {
            AgentError::CollectionTimeout { report } => Some(report),
            _ => None,
        }
    }
}
