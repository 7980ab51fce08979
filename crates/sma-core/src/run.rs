use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{error::RunDataError, ids::RunId};

/// Identifying and timing record for one measurement run.
///
/// Created when a run begins. Before finalization the start time and the
/// treatment window may be recorded once each; `complete` sets the end time
/// exactly once, after which every mutator fails with `Immutable`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunData {
    run_id: RunId,
    run_hash: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    treatment_start: Option<DateTime<Utc>>,
    treatment_end: Option<DateTime<Utc>>,
    experiment_label: Option<String>,
}

/// Persistable view of a run, also what a manifest load hands back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub run_hash: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub treatment_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub treatment_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub experiment_label: Option<String>,
}

/// First 8 hex chars of sha256(run_id).
pub fn make_run_hash(run_id: &RunId) -> String {
    let digest = Sha256::digest(run_id.as_str().as_bytes());
    hex::encode(digest)[..8].to_string()
}

impl RunData {
    pub fn new(run_id: RunId, experiment_label: Option<String>) -> Self {
        let run_hash = make_run_hash(&run_id);
        Self {
            run_id,
            run_hash,
            start_time: None,
            end_time: None,
            treatment_start: None,
            treatment_end: None,
            experiment_label,
        }
    }

    /// New run with a fresh id, started at `start_time`.
    pub fn started(start_time: DateTime<Utc>, experiment_label: Option<String>) -> Self {
        let mut run = Self::new(RunId::new(), experiment_label);
        run.start_time = Some(start_time);
        run
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn run_hash(&self) -> &str {
        &self.run_hash
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn treatment_start(&self) -> Option<DateTime<Utc>> {
        self.treatment_start
    }

    pub fn treatment_end(&self) -> Option<DateTime<Utc>> {
        self.treatment_end
    }

    pub fn experiment_label(&self) -> Option<&str> {
        self.experiment_label.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        Some(span_secs(self.start_time?, self.end_time?))
    }

    pub fn treatment_duration_secs(&self) -> Option<f64> {
        Some(span_secs(self.treatment_start?, self.treatment_end?))
    }

    pub fn begin(&mut self, start_time: DateTime<Utc>) -> Result<(), RunDataError> {
        self.ensure_mutable("begin")?;
        if self.start_time.is_some() {
            return Err(RunDataError::InvalidState(format!("run {} already started", self.run_id)));
        }
        self.start_time = Some(start_time);
        Ok(())
    }

    /// Record the workload bracket around the trigger call.
    pub fn record_treatment(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), RunDataError> {
        self.ensure_mutable("record treatment")?;
        if end < start {
            return Err(RunDataError::InvalidState("treatment ends before it starts".to_string()));
        }
        self.treatment_start = Some(start);
        self.treatment_end = Some(end);
        Ok(())
    }

    pub fn complete(&mut self, end_time: DateTime<Utc>) -> Result<(), RunDataError> {
        self.ensure_mutable("complete")?;
        let Some(start) = self.start_time else {
            return Err(RunDataError::InvalidState(format!("run {} has no start time", self.run_id)));
        };
        if end_time < start {
            return Err(RunDataError::InvalidState(format!(
                "end time {} precedes start time {}",
                end_time, start
            )));
        }
        self.end_time = Some(end_time);
        Ok(())
    }

    fn ensure_mutable(&self, operation: &'static str) -> Result<(), RunDataError> {
        if self.end_time.is_some() {
            return Err(RunDataError::Immutable {
                run_id: self.run_id.to_string(),
                operation,
            });
        }
        Ok(())
    }

    /// Fails for a run that never began; a manifest without a start time
    /// could not be rediscovered by its location.
    pub fn summary(&self) -> Result<RunSummary, RunDataError> {
        let start_time = self
            .start_time
            .ok_or_else(|| RunDataError::InvalidState(format!("run {} has no start time", self.run_id)))?;
        Ok(RunSummary {
            run_id: self.run_id.clone(),
            run_hash: self.run_hash.clone(),
            start_time,
            end_time: self.end_time,
            treatment_start: self.treatment_start,
            treatment_end: self.treatment_end,
            experiment_label: self.experiment_label.clone(),
        })
    }

    /// Rebuild a run from its persisted summary (CLI session restore).
    pub fn from_summary(summary: RunSummary) -> Self {
        Self {
            run_id: summary.run_id,
            run_hash: summary.run_hash,
            start_time: Some(summary.start_time),
            end_time: summary.end_time,
            treatment_start: summary.treatment_start,
            treatment_end: summary.treatment_end,
            experiment_label: summary.experiment_label,
        }
    }
}

fn span_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn complete_sets_end_time_once() {
        let mut run = RunData::started(t0(), None);
        let end = t0() + Duration::seconds(30);
        run.complete(end).unwrap();
        assert_eq!(run.end_time(), Some(end));
        let err = run.complete(end + Duration::seconds(1)).unwrap_err();
        assert!(matches!(err, RunDataError::Immutable { .. }));
        assert_eq!(run.end_time(), Some(end));
    }

    #[test]
    fn complete_without_start_is_invalid_state() {
        let mut run = RunData::new(RunId::from_str("r1"), None);
        let err = run.complete(t0()).unwrap_err();
        assert!(matches!(err, RunDataError::InvalidState(_)));
        assert!(!run.is_complete());
    }

    #[test]
    fn mutators_fail_after_completion() {
        let mut run = RunData::started(t0(), Some("baseline".into()));
        run.complete(t0() + Duration::seconds(5)).unwrap();
        assert!(matches!(
            run.record_treatment(t0(), t0()).unwrap_err(),
            RunDataError::Immutable { .. }
        ));
        assert!(matches!(run.begin(t0()).unwrap_err(), RunDataError::Immutable { .. }));
    }

    #[test]
    fn run_hash_is_stable_for_the_run() {
        let id = RunId::from_str("fixed-run");
        let mut run = RunData::new(id.clone(), None);
        let before = run.run_hash().to_string();
        run.begin(t0()).unwrap();
        run.complete(t0() + Duration::seconds(1)).unwrap();
        assert_eq!(run.run_hash(), before);
        assert_eq!(before, make_run_hash(&id));
        assert_eq!(before.len(), 8);
    }

    #[test]
    fn durations_in_seconds() {
        let mut run = RunData::started(t0(), None);
        run.record_treatment(t0() + Duration::seconds(2), t0() + Duration::milliseconds(4500))
            .unwrap();
        run.complete(t0() + Duration::seconds(10)).unwrap();
        assert_eq!(run.duration_secs(), Some(10.0));
        assert_eq!(run.treatment_duration_secs(), Some(2.5));
    }

    #[test]
    fn summary_roundtrips_into_run_data() {
        let mut run = RunData::started(t0(), Some("exp".into()));
        run.complete(t0() + Duration::seconds(3)).unwrap();
        let back = RunData::from_summary(run.summary().unwrap());
        assert_eq!(back, run);
    }
}
