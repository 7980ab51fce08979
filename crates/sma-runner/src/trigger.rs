use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use sma_core::Metadata;
use tracing::{debug, info};

use crate::convert::metadata_from_json;

/// Trigger that runs `program` to completion as the workload.
///
/// The workload's stdout is echoed line by line. If its last non-empty line
/// is a JSON object of scalars, that object becomes the run's file metadata.
/// A non-zero exit fails the trigger.
pub fn command_trigger(program: String, args: Vec<String>, cwd: Option<PathBuf>) -> impl FnOnce() -> Result<Metadata> {
    move || {
        let mut cmd = Command::new(&program);
        cmd.args(&args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::inherit());
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        info!(program = %program, args = ?args, "starting workload");
        let mut child = cmd.spawn().with_context(|| format!("spawn workload {}", program))?;

        let mut last_line = None;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line.with_context(|| "read workload stdout")?;
                println!("{}", line);
                if !line.trim().is_empty() {
                    last_line = Some(line);
                }
            }
        }

        let status = child.wait().with_context(|| format!("wait for workload {}", program))?;
        if !status.success() {
            return Err(anyhow!("workload {} exited with {}", program, status));
        }
        Ok(last_line.map(|l| metadata_from_last_line(&l)).unwrap_or_default())
    }
}

fn metadata_from_last_line(line: &str) -> Metadata {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
        return Metadata::new();
    };
    if !value.is_object() {
        return Metadata::new();
    }
    match metadata_from_json(&value) {
        Ok(meta) => meta,
        Err(e) => {
            debug!(error = %e, "workload output is not scalar metadata");
            Metadata::new()
        }
    }
}
