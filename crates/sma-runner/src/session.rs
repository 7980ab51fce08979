use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sma_core::{AgentState, Metadata, RunSummary};
use sma_report::write_atomic;

/// Agent state carried between CLI invocations (`start`, `stop` and
/// `collect` run as separate processes).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionFile {
    pub state: AgentState,
    #[serde(default)]
    pub run: Option<RunSummary>,
    #[serde(default)]
    pub location_metadata: Metadata,
    #[serde(default)]
    pub file_metadata: Metadata,
    pub saved_at: DateTime<Utc>,
}

impl SessionFile {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let session = serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(session))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn clear(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}
