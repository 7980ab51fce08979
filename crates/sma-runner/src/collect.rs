use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sma_adapter::{Measurement, MeasurementAdapter, ObservationWindow};
use sma_core::{variables_for_filename, ManifestError, Metadata, RunData, RunId, NAME_VARIABLE};
use sma_report::{manifest_path, save, ReportCodec};
use sma_template::{render_filename, render_location};
use tracing::{debug, info, warn};

use crate::error::AgentError;

/// Sample label marking whether a sample falls inside the workload.
pub const TREATMENT_LABEL: &str = "treatment";

/// Per-artifact file metadata for collect flows with no trigger output.
pub type FileMetadataProducer = Box<dyn Fn(&Measurement) -> Metadata + Send + Sync>;

#[derive(Clone, Debug, Serialize)]
pub struct WrittenArtifact {
    pub adapter: String,
    pub measurement: String,
    pub path: PathBuf,
    pub rows: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ArtifactFailure {
    pub adapter: String,
    pub measurement: String,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct AdapterFailure {
    pub adapter: String,
    pub reason: String,
}

/// Outcome of one collect call. Partial failures land here instead of
/// aborting the batch.
#[derive(Clone, Debug, Serialize)]
pub struct CollectReport {
    pub run_id: RunId,
    pub location: PathBuf,
    pub manifest: PathBuf,
    pub artifacts: Vec<WrittenArtifact>,
    pub failed_artifacts: Vec<ArtifactFailure>,
    pub failed_adapters: Vec<AdapterFailure>,
    /// Adapters still pending when the collect deadline passed.
    pub timed_out: Vec<String>,
}

impl CollectReport {
    pub fn is_partial(&self) -> bool {
        !self.failed_artifacts.is_empty() || !self.failed_adapters.is_empty() || !self.timed_out.is_empty()
    }

    /// Surface a timed-out collect as `AgentError::CollectionTimeout`,
    /// carrying the artifacts that did complete.
    pub fn into_result(self) -> Result<CollectReport, AgentError> {
        if self.timed_out.is_empty() {
            Ok(self)
        } else {
            Err(AgentError::CollectionTimeout { report: Box::new(self) })
        }
    }
}

/// Raw measurements from every adapter that answered in time.
#[derive(Debug, Default)]
pub struct Gathered {
    pub measurements: Vec<(String, Measurement)>,
    pub failed_adapters: Vec<AdapterFailure>,
    pub timed_out: Vec<String>,
}

/// Ask every adapter for its records concurrently. `timeout` bounds the
/// join: adapters still running at the deadline are reported as timed out
/// and their threads are left to finish on their own.
pub fn gather(adapters: &[Arc<dyn MeasurementAdapter>], window: &ObservationWindow, timeout: Duration) -> Gathered {
    let deadline = Instant::now() + timeout;
    let (tx, rx) = mpsc::channel();
    for (idx, adapter) in adapters.iter().enumerate() {
        let tx = tx.clone();
        let adapter = Arc::clone(adapter);
        let window = *window;
        std::thread::spawn(move || {
            let res = adapter.collect(&window, timeout);
            let _ = tx.send((idx, res));
        });
    }
    drop(tx);

    let mut results: Vec<Option<Result<Vec<Measurement>, sma_core::AdapterError>>> =
        adapters.iter().map(|_| None).collect();
    let mut pending = adapters.len();
    while pending > 0 {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok((idx, res)) => {
                results[idx] = Some(res);
                pending -= 1;
            }
            Err(_) => break,
        }
    }

    let mut gathered = Gathered::default();
    for (adapter, res) in adapters.iter().zip(results) {
        let id = adapter.id().to_string();
        match res {
            Some(Ok(ms)) => {
                debug!(adapter = %id, measurements = ms.len(), "adapter collected");
                gathered.measurements.extend(ms.into_iter().map(|m| (id.clone(), m)));
            }
            Some(Err(e)) => {
                warn!(adapter = %id, error = %e, "adapter collection failed");
                gathered.failed_adapters.push(AdapterFailure {
                    adapter: id,
                    reason: e.to_string(),
                });
            }
            None => {
                warn!(adapter = %id, timeout_secs = timeout.as_secs_f64(), "adapter did not respond before the collect deadline");
                gathered.timed_out.push(id);
            }
        }
    }
    gathered
}

/// Templates, codec and metadata a collect renders with.
pub struct CollectPlan<'a> {
    pub location_template: &'a str,
    pub filename_template: &'a str,
    pub codec: &'a dyn ReportCodec,
    pub location_metadata: &'a Metadata,
    pub file_metadata: &'a Metadata,
    pub file_metadata_producer: Option<&'a FileMetadataProducer>,
}

/// Render the run's location, persist its manifest, then write one report
/// file per measurement.
///
/// The location and the manifest are fatal: a run whose metadata cannot be
/// persisted is never reported as collected. Everything after that is per
/// artifact and recorded in the report.
pub fn write_reports(
    plan: &CollectPlan<'_>,
    run: &RunData,
    gathered: Gathered,
    output_root: &Path,
) -> Result<CollectReport, AgentError> {
    let location = render_location(plan.location_template, &sma_core::variables_for_location(run, plan.location_metadata))?;
    let location_dir = output_root.join(&location);
    std::fs::create_dir_all(&location_dir).map_err(|source| ManifestError::Io {
        path: location_dir.clone(),
        source,
    })?;
    let manifest = manifest_path(&location_dir);
    save(run, plan.location_metadata, &manifest)?;

    let mut report = CollectReport {
        run_id: run.run_id().clone(),
        location: location_dir.clone(),
        manifest,
        artifacts: vec![],
        failed_artifacts: vec![],
        failed_adapters: gathered.failed_adapters,
        timed_out: gathered.timed_out,
    };

    let treatment = match (run.treatment_start(), run.treatment_end()) {
        (Some(start), Some(end)) => Some(ObservationWindow { start, end }),
        _ => None,
    };

    let mut seen: HashSet<PathBuf> = HashSet::new();
    for (adapter, mut measurement) in gathered.measurements {
        let mut file_metadata = plan.file_metadata.clone();
        if let Some(producer) = plan.file_metadata_producer {
            file_metadata.extend(producer(&measurement));
        }
        file_metadata.insert(NAME_VARIABLE.to_string(), measurement.name.clone().into());

        let vars = variables_for_filename(run, plan.location_metadata, &file_metadata);
        let filename = match render_filename(plan.filename_template, &vars) {
            Ok(f) => f,
            Err(e) => {
                warn!(adapter = %adapter, measurement = %measurement.name, error = %e, "skipping artifact");
                report.failed_artifacts.push(ArtifactFailure {
                    adapter,
                    measurement: measurement.name,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let path = location_dir.join(&filename);
        if path == report.manifest {
            warn!(adapter = %adapter, path = %path.display(), "artifact would overwrite the run manifest");
            report.failed_artifacts.push(ArtifactFailure {
                adapter,
                measurement: measurement.name,
                reason: format!("artifact path {} is reserved for the run manifest", path.display()),
            });
            continue;
        }
        if !seen.insert(path.clone()) {
            warn!(adapter = %adapter, path = %path.display(), "artifact path already written in this collect");
            report.failed_artifacts.push(ArtifactFailure {
                adapter,
                measurement: measurement.name,
                reason: format!("duplicate artifact path {}", path.display()),
            });
            continue;
        }

        if let Some(span) = &treatment {
            measurement.label_span(span, TREATMENT_LABEL);
        }
        match plan.codec.write(&measurement, &path) {
            Ok(rows) => {
                debug!(adapter = %adapter, path = %path.display(), rows, "artifact written");
                report.artifacts.push(WrittenArtifact {
                    adapter,
                    measurement: measurement.name,
                    path,
                    rows,
                });
            }
            Err(e) => {
                warn!(adapter = %adapter, path = %path.display(), error = %format!("{:#}", e), "artifact write failed");
                report.failed_artifacts.push(ArtifactFailure {
                    adapter,
                    measurement: measurement.name,
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    info!(
        run_id = %report.run_id,
        location = %report.location.display(),
        written = report.artifacts.len(),
        failed = report.failed_artifacts.len(),
        timed_out = report.timed_out.len(),
        "collect finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use sma_adapter::Sample;
    use sma_core::{AdapterError, MetaValue, RunId};
    use sma_report::{load, CsvCodec, JsonCodec};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    struct Slow {
        id: &'static str,
        delay: Duration,
        fail: bool,
    }

    impl MeasurementAdapter for Slow {
        fn id(&self) -> &str {
            self.id
        }
        fn connect(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        fn start(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        fn collect(&self, window: &ObservationWindow, _timeout: Duration) -> Result<Vec<Measurement>, AdapterError> {
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(AdapterError::Collection {
                    adapter: self.id.into(),
                    reason: "backend 503".into(),
                });
            }
            Ok(vec![measurement(self.id, window)])
        }
        fn disconnect(&self) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    fn measurement(name: &str, window: &ObservationWindow) -> Measurement {
        Measurement {
            name: name.into(),
            unit: None,
            samples: vec![Sample {
                timestamp: window.start,
                value: 1.0,
                labels: BTreeMap::new(),
            }],
        }
    }

    fn window() -> ObservationWindow {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ObservationWindow {
            start,
            end: start + ChronoDuration::seconds(30),
        }
    }

    fn run() -> RunData {
        let w = window();
        let mut run = RunData::new(RunId::from_str("run-collect"), None);
        run.begin(w.start).unwrap();
        run.complete(w.end).unwrap();
        run
    }

    #[test]
    fn gather_reports_slow_and_failing_adapters_separately() {
        let adapters: Vec<Arc<dyn MeasurementAdapter>> = vec![
            Arc::new(Slow { id: "fast", delay: Duration::ZERO, fail: false }),
            Arc::new(Slow { id: "broken", delay: Duration::ZERO, fail: true }),
            Arc::new(Slow { id: "stuck", delay: Duration::from_secs(5), fail: false }),
        ];
        let g = gather(&adapters, &window(), Duration::from_millis(300));
        assert_eq!(g.measurements.len(), 1);
        assert_eq!(g.measurements[0].0, "fast");
        assert_eq!(g.failed_adapters.len(), 1);
        assert_eq!(g.failed_adapters[0].adapter, "broken");
        assert_eq!(g.timed_out, vec!["stuck".to_string()]);
    }

    #[test]
    fn writes_manifest_and_artifacts_and_flags_duplicates() {
        let dir = tempdir().unwrap();
        let w = window();
        let gathered = Gathered {
            measurements: vec![
                ("a".into(), measurement("cpu", &w)),
                ("b".into(), measurement("cpu", &w)),
                ("b".into(), measurement("mem", &w)),
            ],
            ..Default::default()
        };
        let mut loc = Metadata::new();
        loc.insert("experiment_id".into(), MetaValue::from("exp_1"));
        let plan = CollectPlan {
            location_template: "reports/${experiment_id}/${runHash}/",
            filename_template: "${name}.csv",
            codec: &CsvCodec,
            location_metadata: &loc,
            file_metadata: &Metadata::new(),
            file_metadata_producer: None,
        };
        let run = run();
        let report = write_reports(&plan, &run, gathered, dir.path()).unwrap();
        assert_eq!(report.artifacts.len(), 2);
        assert_eq!(report.failed_artifacts.len(), 1);
        assert!(report.failed_artifacts[0].reason.contains("duplicate"));
        assert!(report.is_partial());

        let expected = dir.path().join(format!("reports/exp_1/{}", run.run_hash()));
        assert_eq!(report.location, expected);
        assert!(expected.join("cpu.csv").is_file());
        assert!(expected.join("mem.csv").is_file());

        let (summary, extras) = load(&report.manifest).unwrap();
        assert_eq!(summary.run_id, *run.run_id());
        assert_eq!(extras, loc);
    }

    #[test]
    fn artifact_named_like_manifest_is_refused() {
        let dir = tempdir().unwrap();
        let w = window();
        let gathered = Gathered {
            measurements: vec![
                ("a".into(), measurement("run_metadata", &w)),
                ("a".into(), measurement("cpu", &w)),
            ],
            ..Default::default()
        };
        let plan = CollectPlan {
            location_template: "out/",
            filename_template: "${name}.json",
            codec: &JsonCodec,
            location_metadata: &Metadata::new(),
            file_metadata: &Metadata::new(),
            file_metadata_producer: None,
        };
        let run = run();
        let report = write_reports(&plan, &run, gathered, dir.path()).unwrap();
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].measurement, "cpu");
        assert_eq!(report.failed_artifacts.len(), 1);
        assert_eq!(report.failed_artifacts[0].measurement, "run_metadata");
        assert!(report.failed_artifacts[0].reason.contains("manifest"));

        let (summary, _) = load(&report.manifest).unwrap();
        assert_eq!(summary.run_id, *run.run_id());
    }

    #[test]
    fn samples_are_labelled_against_the_treatment() {
        let dir = tempdir().unwrap();
        let w = window();
        let mut m = measurement("cpu", &w);
        m.samples = [0, 10, 20, 30]
            .into_iter()
            .map(|secs| Sample {
                timestamp: w.start + ChronoDuration::seconds(secs),
                value: 1.0,
                labels: BTreeMap::new(),
            })
            .collect();
        let gathered = Gathered {
            measurements: vec![("a".into(), m)],
            ..Default::default()
        };
        let plan = CollectPlan {
            location_template: "out/",
            filename_template: "${name}.csv",
            codec: &CsvCodec,
            location_metadata: &Metadata::new(),
            file_metadata: &Metadata::new(),
            file_metadata_producer: None,
        };
        let mut run = RunData::new(RunId::from_str("run-treated"), None);
        run.begin(w.start).unwrap();
        run.record_treatment(w.start + ChronoDuration::seconds(10), w.start + ChronoDuration::seconds(20))
            .unwrap();
        run.complete(w.end).unwrap();

        let report = write_reports(&plan, &run, gathered, dir.path()).unwrap();
        let csv = std::fs::read_to_string(&report.artifacts[0].path).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("timestamp,value,treatment"));
        let tags: Vec<&str> = lines.map(|l| l.rsplit(',').next().unwrap()).collect();
        assert_eq!(tags, vec!["false", "true", "true", "false"]);
    }

    #[test]
    fn untreated_runs_get_no_treatment_column() {
        let dir = tempdir().unwrap();
        let w = window();
        let gathered = Gathered {
            measurements: vec![("a".into(), measurement("cpu", &w))],
            ..Default::default()
        };
        let plan = CollectPlan {
            location_template: "out/",
            filename_template: "${name}.csv",
            codec: &CsvCodec,
            location_metadata: &Metadata::new(),
            file_metadata: &Metadata::new(),
            file_metadata_producer: None,
        };
        let report = write_reports(&plan, &run(), gathered, dir.path()).unwrap();
        let csv = std::fs::read_to_string(&report.artifacts[0].path).unwrap();
        assert_eq!(csv.lines().next(), Some("timestamp,value"));
    }

    #[test]
    fn filename_failure_does_not_abort_batch() {
        let dir = tempdir().unwrap();
        let w = window();
        let gathered = Gathered {
            measurements: vec![("a".into(), measurement("cpu", &w)), ("a".into(), measurement("mem", &w))],
            ..Default::default()
        };
        let producer: FileMetadataProducer = Box::new(|m: &Measurement| {
            let mut meta = Metadata::new();
            if m.name == "cpu" {
                meta.insert("batch".into(), MetaValue::Integer(64));
            }
            meta
        });
        let plan = CollectPlan {
            location_template: "out/",
            filename_template: "${name}_${batch}.csv",
            codec: &CsvCodec,
            location_metadata: &Metadata::new(),
            file_metadata: &Metadata::new(),
            file_metadata_producer: Some(&producer),
        };
        let report = write_reports(&plan, &run(), gathered, dir.path()).unwrap();
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].path, dir.path().join("out/cpu_64.csv"));
        assert_eq!(report.failed_artifacts[0].measurement, "mem");
        assert!(report.failed_artifacts[0].reason.contains("batch"));
    }

    #[test]
    fn unresolved_location_is_fatal_and_writes_nothing() {
        let dir = tempdir().unwrap();
        let plan = CollectPlan {
            location_template: "reports/${experiment_id}/",
            filename_template: "${name}.csv",
            codec: &CsvCodec,
            location_metadata: &Metadata::new(),
            file_metadata: &Metadata::new(),
            file_metadata_producer: None,
        };
        let err = write_reports(&plan, &run(), Gathered::default(), dir.path()).unwrap_err();
        assert!(matches!(err, AgentError::Template(_)));
        assert!(!dir.path().join("reports").exists());
    }

    #[test]
    fn into_result_types_timeouts() {
        let report = CollectReport {
            run_id: RunId::from_str("r"),
            location: PathBuf::from("x"),
            manifest: PathBuf::from("x/run_metadata.json"),
            artifacts: vec![],
            failed_artifacts: vec![],
            failed_adapters: vec![],
            timed_out: vec!["stuck".into()],
        };
        let err = report.into_result().unwrap_err();
        assert_eq!(err.partial_report().unwrap().timed_out, vec!["stuck".to_string()]);
        assert!(err.to_string().contains("stuck"));
    }
}
