use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sma_core::{Metadata, RunSummary};

/// Well-known manifest file at the root of a run's rendered location.
pub const MANIFEST_FILE: &str = "run_metadata.json";

pub const MANIFEST_SCHEMA: &str = "sma_run_manifest_v1";

/// Persisted record of one run: identifiers, timestamps, and the location
/// metadata (`run_extras`) needed to rebuild template variables offline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: String,
    #[serde(flatten)]
    pub run: RunSummary,
    pub run_extras: Metadata,
    pub written_at: DateTime<Utc>,
}

impl RunManifest {
    pub fn new(run: RunSummary, run_extras: Metadata) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA.to_string(),
            run,
            run_extras,
            written_at: Utc::now(),
        }
    }
}
