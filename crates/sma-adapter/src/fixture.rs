use std::path::{Path, PathBuf};
use std::time::Duration;

use sma_core::AdapterError;
use tracing::debug;

use crate::types::{Measurement, MeasurementAdapter, ObservationWindow};

/// Replays measurements from a JSON file (`[{"name": .., "samples": [..]}]`).
/// Useful offline and for dry runs of a report layout. Only samples inside
/// the requested window are returned.
#[derive(Clone, Debug)]
pub struct FixtureAdapter {
    pub id: String,
    pub path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { id: id.into(), path: path.into() }
    }

    fn read(&self, path: &Path) -> Result<Vec<Measurement>, AdapterError> {
        let bytes = std::fs::read(path).map_err(|e| AdapterError::Collection {
            adapter: self.id.clone(),
            reason: format!("read {}: {}", path.display(), e),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| AdapterError::Collection {
            adapter: self.id.clone(),
            reason: format!("parse {}: {}", path.display(), e),
        })
    }
}

impl MeasurementAdapter for FixtureAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&self) -> Result<(), AdapterError> {
        if !self.path.is_file() {
            return Err(AdapterError::Connection {
                adapter: self.id.clone(),
                reason: format!("fixture {} not found", self.path.display()),
            });
        }
        Ok(())
    }

    fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn collect(&self, window: &ObservationWindow, _timeout: Duration) -> Result<Vec<Measurement>, AdapterError> {
        debug!(adapter = %self.id, start = %window.start, end = %window.end, "replaying fixture");
        let mut measurements = self.read(&self.path)?;
        for m in &mut measurements {
            m.samples.retain(|s| window.contains(s.timestamp));
        }
        Ok(measurements)
    }

    fn disconnect(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn jan_first(secs: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    #[test]
    fn missing_fixture_fails_connect() {
        let dir = tempdir().unwrap();
        let a = FixtureAdapter::new("f", dir.path().join("nope.json"));
        let err = a.connect().unwrap_err();
        assert!(matches!(err, AdapterError::Connection { .. }));
        assert_eq!(err.adapter(), "f");
    }

    #[test]
    fn replays_measurements() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(
            &path,
            r#"[{"name":"cpu","unit":"W","samples":[{"timestamp":"2024-01-01T00:00:00Z","value":1.5,"labels":{"node":"a"}}]}]"#,
        )
        .unwrap();
        let a = FixtureAdapter::new("f", &path);
        a.connect().unwrap();
        let window = ObservationWindow {
            start: jan_first(0),
            end: jan_first(30),
        };
        let m = a.collect(&window, Duration::from_secs(1)).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].name, "cpu");
        assert_eq!(m[0].samples[0].labels["node"], "a");
    }

    #[test]
    fn samples_outside_window_are_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(
            &path,
            r#"[{"name":"cpu","samples":[
                {"timestamp":"2024-01-01T00:00:05Z","value":1.0},
                {"timestamp":"2024-01-01T00:00:10Z","value":2.0},
                {"timestamp":"2024-01-01T00:00:20Z","value":3.0},
                {"timestamp":"2024-01-01T00:00:25Z","value":4.0}
            ]}]"#,
        )
        .unwrap();
        let a = FixtureAdapter::new("f", &path);
        let window = ObservationWindow {
            start: jan_first(10),
            end: jan_first(20),
        };
        let m = a.collect(&window, Duration::from_secs(1)).unwrap();
        let values: Vec<f64> = m[0].samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);

        let later = ObservationWindow {
            start: jan_first(40),
            end: jan_first(50),
        };
        let m = a.collect(&later, Duration::from_secs(1)).unwrap();
        assert_eq!(m[0].name, "cpu");
        assert!(m[0].samples.is_empty());
    }

    #[test]
    fn corrupt_fixture_is_collection_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(&path, "{not json").unwrap();
        let a = FixtureAdapter::new("f", &path);
        let now = Utc::now();
        let err = a
            .collect(&ObservationWindow { start: now, end: now }, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Collection { .. }));
    }
}
