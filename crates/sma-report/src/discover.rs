use std::path::{Path, PathBuf};

use sma_core::{variables_for_location, MetaValue, Metadata, RunData, TemplateError};
use sma_template::{validate_location, Template};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::manifest::{RunManifest, MANIFEST_FILE};
use crate::persist::load_manifest;

#[derive(Clone, Debug)]
pub struct DiscoveredRun {
    pub location: PathBuf,
    pub manifest: RunManifest,
}

impl DiscoveredRun {
    /// Report files stored for this run, manifest excluded.
    pub fn artifact_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.location)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() != MANIFEST_FILE)
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }

    /// Template variables this run's location was rendered with.
    pub fn location_variables(&self) -> Metadata {
        let run = RunData::from_summary(self.manifest.run.clone());
        variables_for_location(&run, &self.manifest.run_extras)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Discovery {
    pub runs: Vec<DiscoveredRun>,
    /// Manifests that could not be loaded, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

/// Find every persisted run under `root` whose location matches
/// `location_template`, keeping runs whose variables match all `filters`.
///
/// Only the template's fixed directory prefix is walked, and that prefix
/// must stay under `root`. Broken manifests are reported in `skipped`
/// rather than failing the search.
pub fn discover_runs(root: &Path, location_template: &str, filters: &Metadata) -> Result<Discovery, TemplateError> {
    let template = Template::parse(location_template)?;
    let prefix = template.fixed_prefix();
    if !prefix.is_empty() {
        validate_location(&prefix)?;
    }
    let base = root.join(&prefix);
    let mut discovery = Discovery::default();
    if !base.is_dir() {
        debug!(base = %base.display(), "no reports under base directory");
        return Ok(discovery);
    }

    for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.file_name() != MANIFEST_FILE {
            continue;
        }
        let path = entry.path();
        let manifest = match load_manifest(path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable run manifest");
                discovery.skipped.push((path.to_path_buf(), e.to_string()));
                continue;
            }
        };
        let location = path.parent().map(Path::to_path_buf).unwrap_or_else(|| base.clone());
        let run = DiscoveredRun { location, manifest };
        if matches_filters(&run.location_variables(), filters) {
            discovery.runs.push(run);
        }
    }

    discovery
        .runs
        .sort_by(|a, b| a.manifest.run.start_time.cmp(&b.manifest.run.start_time));
    Ok(discovery)
}

fn matches_filters(vars: &Metadata, filters: &Metadata) -> bool {
    filters.iter().all(|(k, want)| match vars.get(k) {
        Some(have) => values_match(have, want),
        None => false,
    })
}

// `--where replicas=3` parses as an integer while the stored value may be a
// string, so compare rendered text.
fn values_match(have: &MetaValue, want: &MetaValue) -> bool {
    have == want || have.render() == want.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{manifest_path, save};
    use chrono::{Duration, TimeZone, Utc};
    use sma_template::render_location;
    use tempfile::tempdir;

    const LOCATION: &str = "reports/${experiment_id}/${startTime}_${runHash}/";

    fn persist_run(root: &Path, experiment: &str, offset_secs: i64) -> RunData {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs);
        let mut run = RunData::started(start, None);
        run.complete(start + Duration::seconds(10)).unwrap();
        let mut extras = Metadata::new();
        extras.insert("experiment_id".into(), MetaValue::from(experiment));
        let location = render_location(LOCATION, &variables_for_location(&run, &extras)).unwrap();
        let dir = root.join(location);
        save(&run, &extras, &manifest_path(&dir)).unwrap();
        std::fs::write(dir.join("cpu.csv"), "timestamp,value\n").unwrap();
        run
    }

    #[test]
    fn finds_runs_and_filters_by_metadata() {
        let dir = tempdir().unwrap();
        let a = persist_run(dir.path(), "exp_a", 0);
        let b = persist_run(dir.path(), "exp_b", 60);
        persist_run(dir.path(), "exp_a", 120);

        let all = discover_runs(dir.path(), LOCATION, &Metadata::new()).unwrap();
        assert_eq!(all.runs.len(), 3);
        assert_eq!(all.runs[0].manifest.run.run_id, *a.run_id());

        let mut filter = Metadata::new();
        filter.insert("experiment_id".into(), MetaValue::from("exp_b"));
        let only_b = discover_runs(dir.path(), LOCATION, &filter).unwrap();
        assert_eq!(only_b.runs.len(), 1);
        assert_eq!(only_b.runs[0].manifest.run.run_hash, b.run_hash());
        assert_eq!(only_b.runs[0].artifact_files().len(), 1);

        let mut by_hash = Metadata::new();
        by_hash.insert("runHash".into(), MetaValue::from(a.run_hash()));
        assert_eq!(discover_runs(dir.path(), LOCATION, &by_hash).unwrap().runs.len(), 1);
    }

    #[test]
    fn broken_manifest_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        persist_run(dir.path(), "exp_a", 0);
        let broken = dir.path().join("reports/exp_x/bad");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(MANIFEST_FILE), "nope").unwrap();

        let found = discover_runs(dir.path(), LOCATION, &Metadata::new()).unwrap();
        assert_eq!(found.runs.len(), 1);
        assert_eq!(found.skipped.len(), 1);
    }

    #[test]
    fn missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let found = discover_runs(&dir.path().join("none"), LOCATION, &Metadata::new()).unwrap();
        assert!(found.runs.is_empty());
    }

    #[test]
    fn prefix_outside_root_is_rejected() {
        let dir = tempdir().unwrap();
        for template in ["/etc/${experiment_id}/", "reports/../${experiment_id}/", "../${runHash}/"] {
            let err = discover_runs(dir.path(), template, &Metadata::new()).unwrap_err();
            assert!(matches!(err, TemplateError::UnsafeLocation { .. }), "{}: {:?}", template, err);
        }
    }

    #[test]
    fn numeric_filter_matches_string_value() {
        assert!(values_match(&MetaValue::from("3"), &MetaValue::Integer(3)));
        assert!(!values_match(&MetaValue::from("4"), &MetaValue::Integer(3)));
    }
}
