use std::path::PathBuf;

use thiserror::Error;

use crate::types::AgentState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunDataError {
    #[error("invalid run state: {0}")]
    InvalidState(String),
    #[error("run {run_id} is finalized; cannot {operation}")]
    Immutable { run_id: String, operation: &'static str },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unresolved variable `{variable}` in template `{template}`")]
    Unresolved { variable: String, template: String },
    #[error("invalid filename template `{template}`: {reason}")]
    InvalidFilename { template: String, reason: String },
    #[error("filename template `{template}` must reference `${{{variable}}}` exactly once (found {occurrences})")]
    MissingRequiredVariable {
        variable: String,
        template: String,
        occurrences: usize,
    },
    #[error("template `{template}` is empty")]
    Empty { template: String },
    #[error("malformed placeholder at byte {position} in template `{template}`")]
    Malformed { template: String, position: usize },
    #[error("unsafe report location `{location}`: {reason}")]
    UnsafeLocation { location: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("run manifest not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("run manifest {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("run {run_id} cannot be persisted: {reason}")]
    Incomplete { run_id: String, reason: String },
    #[error("run manifest io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("adapter {adapter} unreachable: {reason}")]
    Connection { adapter: String, reason: String },
    #[error("adapter {adapter} failed to start: {reason}")]
    Start { adapter: String, reason: String },
    #[error("adapter {adapter} failed to stop: {reason}")]
    Stop { adapter: String, reason: String },
    #[error("adapter {adapter} failed to collect: {reason}")]
    Collection { adapter: String, reason: String },
}

impl AdapterError {
    pub fn adapter(&self) -> &str {
        match self {
            AdapterError::Connection { adapter, .. }
            | AdapterError::Start { adapter, .. }
            | AdapterError::Stop { adapter, .. }
            | AdapterError::Collection { adapter, .. } => adapter,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error("no run in progress (state: {state})")]
    NotRunning { state: AgentState },
    #[error("cannot {operation} while {state}")]
    InvalidTransition { operation: &'static str, state: AgentState },
    #[error("agent is torn down; create a new agent")]
    TornDown,
}
