use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sma_core::AdapterError;

/// Time span a collection covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ObservationWindow {
    /// Inclusive at both ends.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// One named series from one adapter; becomes one report artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub samples: Vec<Sample>,
}

impl Measurement {
    /// Tag every sample with `column = "true"` inside `span`, `"false"`
    /// outside it.
    pub fn label_span(&mut self, span: &ObservationWindow, column: &str) {
        for sample in &mut self.samples {
            let inside = span.contains(sample.timestamp);
            sample.labels.insert(column.to_string(), inside.to_string());
        }
    }
}

/// Uniform capability set over one measurement backend.
///
/// Methods take `&self` so the agent can fan calls out to worker threads;
/// implementations keep any session state behind their own locks.
pub trait MeasurementAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn connect(&self) -> Result<(), AdapterError>;

    fn start(&self) -> Result<(), AdapterError>;

    fn stop(&self) -> Result<(), AdapterError>;

    fn collect(&self, window: &ObservationWindow, timeout: Duration) -> Result<Vec<Measurement>, AdapterError>;

    fn disconnect(&self) -> Result<(), AdapterError>;
}
