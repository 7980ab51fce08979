use crate::{
    run::RunData,
    value::{MetaValue, Metadata},
};

/// Template variable names derived from `RunData`. Caller metadata under any
/// of these names is discarded, whether or not the run has a value for it.
pub const RESERVED_VARIABLES: &[&str] = &[
    "run_id",
    "runId",
    "run_hash",
    "runHash",
    "start_time",
    "startTime",
    "end_time",
    "endTime",
    "treatment_start",
    "treatment_end",
    "duration",
    "treatment_duration",
    "experiment_label",
];

/// Variable every filename template must reference.
pub const NAME_VARIABLE: &str = "name";

pub fn is_reserved(key: &str) -> bool {
    RESERVED_VARIABLES.contains(&key)
}

/// Reserved variables for a run. Unset fields produce no entry.
pub fn run_variables(run: &RunData) -> Metadata {
    let mut vars = Metadata::new();
    let id = MetaValue::String(run.run_id().to_string());
    let hash = MetaValue::String(run.run_hash().to_string());
    vars.insert("run_id".into(), id.clone());
    vars.insert("runId".into(), id);
    vars.insert("run_hash".into(), hash.clone());
    vars.insert("runHash".into(), hash);
    if let Some(start) = run.start_time() {
        vars.insert("start_time".into(), MetaValue::Timestamp(start));
        vars.insert("startTime".into(), MetaValue::Timestamp(start));
    }
    if let Some(end) = run.end_time() {
        vars.insert("end_time".into(), MetaValue::Timestamp(end));
        vars.insert("endTime".into(), MetaValue::Timestamp(end));
    }
    if let Some(t) = run.treatment_start() {
        vars.insert("treatment_start".into(), MetaValue::Timestamp(t));
    }
    if let Some(t) = run.treatment_end() {
        vars.insert("treatment_end".into(), MetaValue::Timestamp(t));
    }
    if let Some(d) = run.duration_secs() {
        vars.insert("duration".into(), MetaValue::Float(d));
    }
    if let Some(d) = run.treatment_duration_secs() {
        vars.insert("treatment_duration".into(), MetaValue::Float(d));
    }
    if let Some(label) = run.experiment_label() {
        vars.insert("experiment_label".into(), MetaValue::String(label.to_string()));
    }
    vars
}

/// Variables visible to the location template: run fields overlaid with
/// the location metadata's non-reserved keys.
pub fn variables_for_location(run: &RunData, location_metadata: &Metadata) -> Metadata {
    let mut vars = run_variables(run);
    overlay(&mut vars, location_metadata);
    vars
}

/// Variables visible to the filename template: the location variables
/// overlaid with file metadata. File values win over location values;
/// reserved run fields win over both.
pub fn variables_for_filename(run: &RunData, location_metadata: &Metadata, file_metadata: &Metadata) -> Metadata {
    let mut vars = variables_for_location(run, location_metadata);
    overlay(&mut vars, file_metadata);
    vars
}

fn overlay(vars: &mut Metadata, extra: &Metadata) {
    for (k, v) in extra {
        if !is_reserved(k) {
            vars.insert(k.clone(), v.clone());
        }
    }
}
