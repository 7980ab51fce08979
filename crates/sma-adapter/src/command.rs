use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use sma_core::{format_timestamp, AdapterError};
use tracing::{debug, warn};

use crate::types::{Measurement, MeasurementAdapter, ObservationWindow};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Scrapes measurements by running an external program.
///
/// The program sees the window as `SMA_WINDOW_START` / `SMA_WINDOW_END`
/// (RFC 3339) and `SMA_ADAPTER_ID`, and prints a JSON array of measurements
/// on stdout. An optional probe command is run on `connect`.
#[derive(Clone, Debug)]
pub struct CommandAdapter {
    pub id: String,
    pub program: String,
    pub args: Vec<String>,
    pub probe: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
}

impl CommandAdapter {
    pub fn new(id: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args,
            probe: None,
            cwd: None,
        }
    }

    pub fn with_probe(mut self, probe: Vec<String>) -> Self {
        self.probe = Some(probe);
        self
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args).env("SMA_ADAPTER_ID", &self.id);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    fn run_to_completion(&self, mut cmd: Command, timeout: Duration) -> Result<String, String> {
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("spawn {}: {}", self.program, e))?;

        // drain pipes on helper threads so a chatty child cannot block on a full pipe
        let mut stdout = child.stdout.take().ok_or("stdout not captured")?;
        let mut stderr = child.stderr.take().ok_or("stderr not captured")?;
        let out_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf);
            buf
        });
        let err_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("{} did not finish within {:?}", self.program, timeout));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(format!("wait {}: {}", self.program, e)),
            }
        };

        let out = out_reader.join().unwrap_or_default();
        let err = err_reader.join().unwrap_or_default();
        if !status.success() {
            return Err(format!(
                "{} exited with {:?}\nstderr:{}",
                self.program,
                status.code(),
                err.trim()
            ));
        }
        Ok(out)
    }
}

impl MeasurementAdapter for CommandAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&self) -> Result<(), AdapterError> {
        let Some(probe) = &self.probe else {
            return Ok(());
        };
        let Some((program, args)) = probe.split_first() else {
            return Ok(());
        };
        self.run_to_completion(self.command(program, args), Duration::from_secs(30))
            .map(|_| ())
            .map_err(|reason| AdapterError::Connection {
                adapter: self.id.clone(),
                reason,
            })
    }

    fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn collect(&self, window: &ObservationWindow, timeout: Duration) -> Result<Vec<Measurement>, AdapterError> {
        let mut cmd = self.command(&self.program, &self.args);
        cmd.env("SMA_WINDOW_START", format_timestamp(&window.start))
            .env("SMA_WINDOW_END", format_timestamp(&window.end));
        debug!(adapter = %self.id, program = %self.program, "running collection command");

        let stdout = self.run_to_completion(cmd, timeout).map_err(|reason| {
            warn!(adapter = %self.id, %reason, "collection command failed");
            AdapterError::Collection {
                adapter: self.id.clone(),
                reason,
            }
        })?;
        serde_json::from_str(stdout.trim()).map_err(|e| AdapterError::Collection {
            adapter: self.id.clone(),
            reason: format!("parse output of {}: {}", self.program, e),
        })
    }

    fn disconnect(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
