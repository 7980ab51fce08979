use std::io::Write;
use std::path::{Path, PathBuf};

use sma_core::{ManifestError, Metadata, RunData, RunSummary};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::manifest::{RunManifest, MANIFEST_FILE, MANIFEST_SCHEMA};

pub fn manifest_path(location_dir: &Path) -> PathBuf {
    location_dir.join(MANIFEST_FILE)
}

/// Write `bytes` to a temp file next to `path`, fsync, then rename over
/// `path`. Readers see the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Persist the run manifest. Overwrites an existing manifest for the same
/// run, so a retried collect is safe.
pub fn save(run: &RunData, location_metadata: &Metadata, path: &Path) -> Result<RunManifest, ManifestError> {
    let summary = run.summary().map_err(|e| ManifestError::Incomplete {
        run_id: run.run_id().to_string(),
        reason: e.to_string(),
    })?;
    if let Some((key, value)) = location_metadata.iter().find(|(_, v)| !v.is_persistable()) {
        return Err(ManifestError::Incomplete {
            run_id: run.run_id().to_string(),
            reason: format!("location metadata `{}` = {} cannot be stored", key, value),
        });
    }
    let manifest = RunManifest::new(summary, location_metadata.clone());
    let bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| ManifestError::Incomplete {
        run_id: run.run_id().to_string(),
        reason: format!("serialize manifest: {}", e),
    })?;
    write_atomic(path, &bytes).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(run_id = %run.run_id(), path = %path.display(), "run manifest written");
    Ok(manifest)
}

pub fn load_manifest(path: &Path) -> Result<RunManifest, ManifestError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(ManifestError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let manifest: RunManifest = serde_json::from_slice(&bytes).map_err(|e| ManifestError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if manifest.schema_version != MANIFEST_SCHEMA {
        return Err(ManifestError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("unknown schema_version {}", manifest.schema_version),
        });
    }
    Ok(manifest)
}

/// Read a manifest back as `(run summary, location metadata)`.
pub fn load(path: &Path) -> Result<(RunSummary, Metadata), ManifestError> {
    let manifest = load_manifest(path)?;
    Ok((manifest.run, manifest.run_extras))
}

/// Convenience lookup: a missing or broken manifest is a warning, not an error.
pub fn try_load(path: &Path) -> Option<(RunSummary, Metadata)> {
    match load(path) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable run manifest");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use sma_core::MetaValue;
    use tempfile::tempdir;

    fn completed_run() -> RunData {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::milliseconds(250);
        let mut run = RunData::started(start, Some("baseline".into()));
        run.record_treatment(start + Duration::seconds(1), start + Duration::seconds(4))
            .unwrap();
        run.complete(start + Duration::seconds(5)).unwrap();
        run
    }

    fn extras() -> Metadata {
        let mut m = Metadata::new();
        m.insert("experiment_id".into(), MetaValue::from("exp_123"));
        m.insert("replicas".into(), MetaValue::Integer(3));
        m.insert("load".into(), MetaValue::Float(0.75));
        m.insert("warm".into(), MetaValue::Boolean(false));
        m.insert("deployed_at".into(), MetaValue::Timestamp(Utc.with_ymd_and_hms(2024, 2, 29, 8, 0, 0).unwrap()));
        m
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let path = manifest_path(dir.path());
        let run = completed_run();
        save(&run, &extras(), &path).unwrap();

        let (summary, meta) = load(&path).unwrap();
        assert_eq!(summary.run_id, *run.run_id());
        assert_eq!(summary.run_hash, run.run_hash());
        assert_eq!(summary, run.summary().unwrap());
        assert_eq!(meta, extras());
    }

    #[test]
    fn save_overwrites_idempotently() {
        let dir = tempdir().unwrap();
        let path = manifest_path(dir.path());
        let run = completed_run();
        save(&run, &Metadata::new(), &path).unwrap();
        save(&run, &extras(), &path).unwrap();
        let (_, meta) = load(&path).unwrap();
        assert_eq!(meta, extras());
        // no temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn save_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let path = manifest_path(&dir.path().join("reports/exp/run"));
        save(&completed_run(), &extras(), &path).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = tempdir().unwrap();
        let err = load(&dir.path().join(MANIFEST_FILE)).unwrap_err();
        assert!(matches!(err, ManifestError::NotFound(_)));
    }

    #[test]
    fn unparseable_or_incomplete_manifest_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = manifest_path(dir.path());
        std::fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(load(&path).unwrap_err(), ManifestError::Corrupt { .. }));

        std::fs::write(&path, r#"{"schema_version":"sma_run_manifest_v1","run_hash":"abc"}"#).unwrap();
        assert!(matches!(load(&path).unwrap_err(), ManifestError::Corrupt { .. }));
    }

    #[test]
    fn unknown_schema_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = manifest_path(dir.path());
        save(&completed_run(), &extras(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap().replace(MANIFEST_SCHEMA, "other_v9");
        std::fs::write(&path, text).unwrap();
        assert!(matches!(load(&path).unwrap_err(), ManifestError::Corrupt { .. }));
        assert!(try_load(&path).is_none());
    }

    #[test]
    fn non_finite_metadata_is_rejected_before_writing() {
        let dir = tempdir().unwrap();
        let path = manifest_path(dir.path());
        let mut meta = extras();
        meta.insert("load".into(), MetaValue::Float(f64::INFINITY));
        let err = save(&completed_run(), &meta, &path).unwrap_err();
        assert!(matches!(err, ManifestError::Incomplete { ref reason, .. } if reason.contains("load")));
        assert!(!path.exists());

        meta.insert("load".into(), MetaValue::Float(f64::NAN));
        assert!(save(&completed_run(), &meta, &path).is_err());
    }

    #[test]
    fn unstarted_run_cannot_be_saved() {
        let dir = tempdir().unwrap();
        let run = RunData::new(sma_core::RunId::from_str("r"), None);
        let err = save(&run, &Metadata::new(), &manifest_path(dir.path())).unwrap_err();
        assert!(matches!(err, ManifestError::Incomplete { .. }));
    }
}
