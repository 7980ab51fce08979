use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sma_adapter::{MeasurementAdapter, ObservationWindow};
use sma_core::{AdapterError, AgentState, Metadata, RunData, RunId, StateError};
use sma_report::{codec_for, ReportCodec};
use sma_template::{check_filename_template, Template};
use tracing::{info, warn};

use crate::collect::{gather, write_reports, CollectPlan, CollectReport, FileMetadataProducer};
use crate::config::Config;
use crate::error::AgentError;
use crate::session::SessionFile;

const DEFAULT_LOOKBACK: Duration = Duration::from_secs(300);
const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(60);

/// The run currently owned by an agent.
#[derive(Clone, Debug)]
pub struct ActiveRun {
    pub run: RunData,
    pub location_metadata: Metadata,
    pub file_metadata: Metadata,
}

/// Result of probing one adapter during `deploy`.
#[derive(Clone, Debug)]
pub struct ProbeResult {
    pub adapter: String,
    pub error: Option<AdapterError>,
}

/// Lifecycle state machine over a fixed set of adapters.
///
/// `Disconnected -> Connected -> Running -> Stopped -> Collected -> TornDown`.
/// A collected agent may start another run; `TornDown` is terminal. Calls
/// must be serialized by the caller; adapter fan-out happens internally.
pub struct Agent {
    adapters: Vec<Arc<dyn MeasurementAdapter>>,
    state: AgentState,
    location_template: String,
    filename_template: String,
    codec: Box<dyn ReportCodec>,
    session_metadata: Metadata,
    experiment_label: Option<String>,
    lookback: Duration,
    collect_timeout: Duration,
    left_pad: Duration,
    right_pad: Duration,
    file_metadata_producer: Option<FileMetadataProducer>,
    active: Option<ActiveRun>,
}

impl Agent {
    /// Templates are checked here so a bad configuration fails before any
    /// adapter is touched.
    pub fn new(
        adapters: Vec<Arc<dyn MeasurementAdapter>>,
        location_template: impl Into<String>,
        filename_template: impl Into<String>,
    ) -> Result<Self, AgentError> {
        let location_template = location_template.into();
        let filename_template = filename_template.into();
        Template::parse(&location_template)?;
        check_filename_template(&filename_template)?;
        Ok(Self {
            adapters,
            state: AgentState::Disconnected,
            location_template,
            filename_template,
            codec: codec_for(Default::default()),
            session_metadata: Metadata::new(),
            experiment_label: None,
            lookback: DEFAULT_LOOKBACK,
            collect_timeout: DEFAULT_COLLECT_TIMEOUT,
            left_pad: Duration::ZERO,
            right_pad: Duration::ZERO,
            file_metadata_producer: None,
            active: None,
        })
    }

    pub fn from_config(cfg: &Config, base_dir: &Path) -> Result<Self, AgentError> {
        let session_metadata = cfg
            .session_metadata()
            .map_err(|e| AgentError::Configuration(format!("{:#}", e)))?;
        let mut agent = Self::new(cfg.build_adapters(base_dir), &cfg.report.location, &cfg.report.filename)?
            .with_codec(codec_for(cfg.report.format))
            .with_session_metadata(session_metadata)
            .with_lookback(Duration::from_secs(cfg.observation.lookback_secs))
            .with_padding(
                Duration::from_secs(cfg.observation.left_secs),
                Duration::from_secs(cfg.observation.right_secs),
            );
        agent.collect_timeout = Duration::from_secs(cfg.observation.collect_timeout_secs);
        Ok(agent)
    }

    /// Location metadata every run starts from; `run` metadata overlays it.
    pub fn with_session_metadata(mut self, metadata: Metadata) -> Self {
        self.session_metadata = metadata;
        self
    }

    pub fn with_experiment_label(mut self, label: impl Into<String>) -> Self {
        self.experiment_label = Some(label.into());
        self
    }

    /// Window length for an ad-hoc collect.
    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    /// Idle time observed before and after the trigger in `run`.
    pub fn with_padding(mut self, left: Duration, right: Duration) -> Self {
        self.left_pad = left;
        self.right_pad = right;
        self
    }

    pub fn with_codec(mut self, codec: Box<dyn ReportCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Per-artifact file metadata, overlaid on the trigger's output.
    pub fn with_file_metadata_producer(mut self, producer: FileMetadataProducer) -> Self {
        self.file_metadata_producer = Some(producer);
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn active_run(&self) -> Option<&ActiveRun> {
        self.active.as_ref()
    }

    pub fn adapter_ids(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.id()).collect()
    }

    /// Connect and disconnect every adapter once, reporting reachability.
    /// Leaves the agent state untouched.
    pub fn probe(&self) -> Result<Vec<ProbeResult>, AgentError> {
        if self.state != AgentState::Disconnected {
            return Err(self.invalid("probe"));
        }
        let results = fan_out(&self.adapters, |a| {
            let res = a.connect();
            if res.is_ok() {
                if let Err(e) = a.disconnect() {
                    warn!(adapter = %a.id(), error = %e, "disconnect after probe failed");
                }
            }
            res
        });
        Ok(self
            .adapters
            .iter()
            .zip(results)
            .map(|(a, res)| ProbeResult {
                adapter: a.id().to_string(),
                error: res.err(),
            })
            .collect())
    }

    /// `Disconnected -> Connected`. All or nothing: if any adapter fails,
    /// every adapter that did connect is disconnected before returning.
    pub fn connect(&mut self) -> Result<(), AgentError> {
        if self.state != AgentState::Disconnected {
            return Err(self.invalid("connect"));
        }
        let results = fan_out(&self.adapters, |a| a.connect());
        let mut first_err = None;
        let mut connected = vec![];
        for (adapter, res) in self.adapters.iter().zip(results) {
            match res {
                Ok(()) => connected.push(Arc::clone(adapter)),
                Err(e) => {
                    warn!(adapter = %adapter.id(), error = %e, "adapter connect failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(err) = first_err {
            for (adapter, res) in connected.iter().zip(fan_out(&connected, |a| a.disconnect())) {
                if let Err(e) = res {
                    warn!(adapter = %adapter.id(), error = %e, "rollback disconnect failed");
                }
            }
            return Err(AgentError::Connection(err));
        }
        self.transition(AgentState::Connected);
        Ok(())
    }

    /// `Connected -> Running` without a trigger, for callers that drive the
    /// workload themselves and call `stop` later.
    pub fn start(&mut self, location_metadata: Metadata) -> Result<RunId, AgentError> {
        match self.state {
            AgentState::Connected | AgentState::Collected => {}
            AgentState::Running => return Err(StateError::AlreadyRunning.into()),
            _ => return Err(self.invalid("run")),
        }

        let results = fan_out(&self.adapters, |a| a.start());
        if let Some(pos) = results.iter().position(Result::is_err) {
            let started: Vec<_> = self
                .adapters
                .iter()
                .zip(&results)
                .filter(|(_, r)| r.is_ok())
                .map(|(a, _)| Arc::clone(a))
                .collect();
            stop_all(&started);
            let err = results.into_iter().nth(pos).and_then(Result::err);
            return Err(match err {
                Some(e) => AgentError::Adapter(e),
                None => self.invalid("run"),
            });
        }

        let run = RunData::started(Utc::now(), self.experiment_label.clone());
        let mut merged = self.session_metadata.clone();
        merged.extend(location_metadata);
        let run_id = run.run_id().clone();
        info!(run_id = %run_id, run_hash = %run.run_hash(), "run started");
        self.active = Some(ActiveRun {
            run,
            location_metadata: merged,
            file_metadata: Metadata::new(),
        });
        self.transition(AgentState::Running);
        Ok(run_id)
    }

    /// Start a run and invoke `trigger` on the caller's thread. The trigger
    /// is neither cancelled nor timed out. Its return value becomes the
    /// run's file metadata and the time it spent is the treatment window.
    /// The configured left and right padding is observed around it, so the
    /// run window covers an idle baseline and a cool-down.
    ///
    /// A failing trigger leaves the agent `Running` so the caller can still
    /// `stop`.
    pub fn run<F>(&mut self, location_metadata: Metadata, trigger: F) -> Result<RunId, AgentError>
    where
        F: FnOnce() -> anyhow::Result<Metadata>,
    {
        let run_id = self.start(location_metadata)?;
        if !self.left_pad.is_zero() {
            std::thread::sleep(self.left_pad);
        }
        let treatment_start = Utc::now();
        let outcome = trigger();
        let treatment_end = Utc::now();
        if !self.right_pad.is_zero() {
            std::thread::sleep(self.right_pad);
        }

        let active = self.active_mut("run")?;
        active.run.record_treatment(treatment_start, treatment_end)?;
        match outcome {
            Ok(file_metadata) => {
                active.file_metadata = file_metadata;
                Ok(run_id)
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %format!("{:#}", e), "trigger failed");
                Err(AgentError::Trigger(format!("{:#}", e)))
            }
        }
    }

    /// Timer mode: a run whose treatment is a fixed `duration` with no
    /// workload of its own.
    pub fn run_for(&mut self, location_metadata: Metadata, duration: Duration) -> Result<RunId, AgentError> {
        info!(duration_secs = duration.as_secs_f64(), "timed run");
        self.run(location_metadata, || {
            std::thread::sleep(duration);
            Ok(Metadata::new())
        })
    }

    /// `Running -> Stopped`. Adapter stop failures are logged; the run is
    /// finalized regardless.
    pub fn stop(&mut self) -> Result<(), AgentError> {
        match self.state {
            AgentState::Running => {}
            AgentState::TornDown => return Err(StateError::TornDown.into()),
            state => return Err(StateError::NotRunning { state }.into()),
        }
        stop_all(&self.adapters);
        let active = self.active_mut("stop")?;
        active.run.complete(Utc::now())?;
        info!(
            run_id = %active.run.run_id(),
            duration_secs = active.run.duration_secs().unwrap_or_default(),
            "run stopped"
        );
        self.transition(AgentState::Stopped);
        Ok(())
    }

    /// Pull measurements and write reports under `output_root`.
    ///
    /// From `Stopped` (or `Collected`, to retry) this collects the active
    /// run. From `Connected` it is an ad-hoc collect over the last lookback
    /// window and requires an explicit `timeout`.
    ///
    /// Timed-out and failing adapters do not fail the call; they are listed
    /// in the returned report (see `CollectReport::into_result`). A location
    /// or manifest failure is fatal and leaves the state unchanged.
    pub fn collect(&mut self, output_root: &Path, timeout: Option<Duration>) -> Result<CollectReport, AgentError> {
        let active = match self.state {
            AgentState::Stopped | AgentState::Collected => match &self.active {
                Some(active) => active.clone(),
                None => return Err(self.invalid("collect")),
            },
            AgentState::Connected if timeout.is_some() => self.ad_hoc_run()?,
            AgentState::TornDown => return Err(StateError::TornDown.into()),
            _ => return Err(self.invalid("collect")),
        };
        let timeout = timeout.unwrap_or(self.collect_timeout);

        let (Some(start), Some(end)) = (active.run.start_time(), active.run.end_time()) else {
            return Err(self.invalid("collect"));
        };
        let window = ObservationWindow { start, end };
        let gathered = gather(&self.adapters, &window, timeout);

        let plan = CollectPlan {
            location_template: &self.location_template,
            filename_template: &self.filename_template,
            codec: self.codec.as_ref(),
            location_metadata: &active.location_metadata,
            file_metadata: &active.file_metadata,
            file_metadata_producer: self.file_metadata_producer.as_ref(),
        };
        let report = write_reports(&plan, &active.run, gathered, output_root)?;

        self.active = Some(active);
        self.transition(AgentState::Collected);
        Ok(report)
    }

    /// Release every adapter session. Any state goes to `TornDown`; a
    /// running run is stopped first. Calling it again is a no-op.
    pub fn teardown(&mut self) {
        match self.state {
            AgentState::TornDown => return,
            AgentState::Disconnected => {}
            AgentState::Running => {
                stop_all(&self.adapters);
                disconnect_all(&self.adapters);
            }
            _ => disconnect_all(&self.adapters),
        }
        self.active = None;
        self.transition(AgentState::TornDown);
    }

    /// Persistable view of the agent for the CLI session file.
    pub fn snapshot(&self) -> SessionFile {
        let active = self.active.as_ref();
        SessionFile {
            state: self.state,
            run: active.and_then(|a| a.run.summary().ok()),
            location_metadata: active.map(|a| a.location_metadata.clone()).unwrap_or_default(),
            file_metadata: active.map(|a| a.file_metadata.clone()).unwrap_or_default(),
            saved_at: Utc::now(),
        }
    }

    /// Resume a run saved by another process. The agent must be freshly
    /// connected; the saved state must be one that owns a run.
    pub fn restore(&mut self, session: SessionFile) -> Result<(), AgentError> {
        if self.state != AgentState::Connected {
            return Err(self.invalid("restore"));
        }
        let SessionFile {
            state,
            run,
            location_metadata,
            file_metadata,
            ..
        } = session;
        match (state, run) {
            (AgentState::Running | AgentState::Stopped | AgentState::Collected, Some(summary)) => {
                let run = RunData::from_summary(summary);
                info!(run_id = %run.run_id(), state = %state, "restored run");
                self.active = Some(ActiveRun {
                    run,
                    location_metadata,
                    file_metadata,
                });
                self.transition(state);
                Ok(())
            }
            (AgentState::Connected | AgentState::Disconnected, _) => Ok(()),
            (state, _) => Err(StateError::InvalidTransition {
                operation: "restore",
                state,
            }
            .into()),
        }
    }

    fn ad_hoc_run(&self) -> Result<ActiveRun, AgentError> {
        let end = Utc::now();
        let lookback = chrono::Duration::from_std(self.lookback)
            .map_err(|e| AgentError::Configuration(format!("lookback out of range: {}", e)))?;
        let mut run = RunData::started(end - lookback, self.experiment_label.clone());
        run.complete(end)?;
        info!(run_id = %run.run_id(), lookback_secs = self.lookback.as_secs(), "ad-hoc collect");
        Ok(ActiveRun {
            run,
            location_metadata: self.session_metadata.clone(),
            file_metadata: Metadata::new(),
        })
    }

    fn active_mut(&mut self, operation: &'static str) -> Result<&mut ActiveRun, AgentError> {
        let state = self.state;
        self.active
            .as_mut()
            .ok_or(AgentError::State(StateError::InvalidTransition { operation, state }))
    }

    fn invalid(&self, operation: &'static str) -> AgentError {
        match self.state {
            AgentState::TornDown => StateError::TornDown.into(),
            state => StateError::InvalidTransition { operation, state }.into(),
        }
    }

    fn transition(&mut self, to: AgentState) {
        info!(from = %self.state, to = %to, "agent state");
        self.state = to;
    }
}

/// Run `op` against every adapter concurrently; results keep adapter order.
fn fan_out<T, F>(adapters: &[Arc<dyn MeasurementAdapter>], op: F) -> Vec<Result<T, AdapterError>>
where
    T: Send,
    F: Fn(&dyn MeasurementAdapter) -> Result<T, AdapterError> + Sync,
{
    std::thread::scope(|s| {
        let handles: Vec<_> = adapters
            .iter()
            .map(|a| {
                let op = &op;
                let id = a.id().to_string();
                (id, s.spawn(move || op(a.as_ref())))
            })
            .collect();
        handles
            .into_iter()
            .map(|(id, h)| {
                h.join().unwrap_or_else(|_| {
                    Err(AdapterError::Connection {
                        adapter: id,
                        reason: "adapter thread panicked".to_string(),
                    })
                })
            })
            .collect()
    })
}

fn stop_all(adapters: &[Arc<dyn MeasurementAdapter>]) {
    for (adapter, res) in adapters.iter().zip(fan_out(adapters, |a| a.stop())) {
        if let Err(e) = res {
            warn!(adapter = %adapter.id(), error = %e, "adapter stop failed");
        }
    }
}

fn disconnect_all(adapters: &[Arc<dyn MeasurementAdapter>]) {
    for (adapter, res) in adapters.iter().zip(fan_out(adapters, |a| a.disconnect())) {
        if let Err(e) = res {
            warn!(adapter = %adapter.id(), error = %e, "adapter disconnect failed");
        }
    }
}
