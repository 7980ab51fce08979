use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use sma_core::{format_timestamp, parse_meta_pair, Metadata};
use sma_runner::{command_trigger, CollectReport, Workspace};

#[derive(Parser)]
#[command(name = "sma", version)]
struct Cli {
    /// Config file (default: .sma/sma.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create .sma/sma.toml in the current directory
    Init,

    /// Check that every configured adapter is reachable
    Deploy,

    /// Begin a run; the workload is driven externally until `stop`
    Start {
        #[arg(long)]
        label: Option<String>,
        /// Location metadata, repeatable (key=value)
        #[arg(long = "meta", value_parser = parse_pair)]
        meta: Vec<(String, sma_core::MetaValue)>,
    },

    /// Stop the active run
    Stop,

    /// Collect measurements and write reports
    Collect {
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
        /// Collect deadline in seconds
        #[arg(short = 't', long)]
        timeout: Option<u64>,
        /// Print the collect report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start, run a workload command or wait `--duration`, stop, collect and tear down
    Run {
        #[arg(long)]
        label: Option<String>,
        #[arg(long = "meta", value_parser = parse_pair)]
        meta: Vec<(String, sma_core::MetaValue)>,
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
        #[arg(short = 't', long)]
        timeout: Option<u64>,
        /// Timer mode: observe for this many seconds instead of running a command
        #[arg(short = 'd', long, conflicts_with = "cmd")]
        duration: Option<u64>,
        #[arg(last = true, required_unless_present = "duration")]
        cmd: Vec<String>,
    },

    /// List persisted runs under the report root
    List {
        #[arg(long)]
        root: Option<PathBuf>,
        /// Filter on run fields or location metadata (key=value), repeatable
        #[arg(long = "where", value_parser = parse_pair)]
        filters: Vec<(String, sma_core::MetaValue)>,
    },

    /// Release adapters and forget the active session
    Teardown,
}

fn parse_pair(raw: &str) -> Result<(String, sma_core::MetaValue), String> {
    parse_meta_pair(raw).ok_or_else(|| format!("expected key=value, got {}", raw))
}

fn open(config: &Option<PathBuf>, repo_root: PathBuf) -> Result<Workspace> {
    match config {
        Some(path) => Workspace::open_with_config(repo_root, path),
        None => Workspace::open(repo_root),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;

    match cli.cmd {
        Command::Init => {
            let path = Workspace::init_repo(&repo_root)?;
            println!("Initialized sma config at {}", path.display());
        }
        Command::Deploy => {
            let ws = open(&cli.config, repo_root)?;
            let results = ws.agent()?.probe()?;
            if results.is_empty() {
                println!("No adapters configured");
            }
            let mut failed = 0;
            for r in &results {
                match &r.error {
                    None => println!("- {} reachable", r.adapter),
                    Some(e) => {
                        failed += 1;
                        println!("- {} UNREACHABLE: {}", r.adapter, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} adapters unreachable", failed, results.len());
            }
        }
        Command::Start { label, meta } => {
            let ws = open(&cli.config, repo_root)?;
            let mut agent = ws.resume_agent(label)?;
            let run_id = agent.start(meta.into_iter().collect())?;
            ws.save_session(&agent)?;
            let run = agent.active_run().map(|a| &a.run).ok_or_else(|| anyhow!("run not recorded"))?;
            println!("Started run {} (hash {})", run_id, run.run_hash());
        }
        Command::Stop => {
            let ws = open(&cli.config, repo_root)?;
            let mut agent = ws.resume_agent(None)?;
            agent.stop()?;
            ws.save_session(&agent)?;
            if let Some(active) = agent.active_run() {
                println!(
                    "Stopped run {} after {:.1}s",
                    active.run.run_id(),
                    active.run.duration_secs().unwrap_or_default()
                );
            }
        }
        Command::Collect { output, timeout, json } => {
            let ws = open(&cli.config, repo_root)?;
            let mut agent = ws.resume_agent(None)?;
            let timeout = Duration::from_secs(timeout.unwrap_or(ws.cfg.observation.collect_timeout_secs));
            let report = agent.collect(&ws.output_root(output.as_deref()), Some(timeout))?;
            ws.save_session(&agent)?;
            print_report(&report, json)?;
        }
        Command::Run {
            label,
            meta,
            output,
            timeout,
            duration,
            cmd,
        } => {
            let ws = open(&cli.config, repo_root)?;
            let mut agent = ws.agent()?;
            if let Some(label) = label {
                agent = agent.with_experiment_label(label);
            }
            agent.connect()?;

            let meta: Metadata = meta.into_iter().collect();
            let outcome = match duration {
                Some(secs) => agent.run_for(meta, Duration::from_secs(secs)),
                None => {
                    let (program, args) = cmd.split_first().ok_or_else(|| anyhow!("missing workload command"))?;
                    let trigger = command_trigger(program.clone(), args.to_vec(), Some(ws.repo_root.clone()));
                    agent.run(meta, trigger)
                }
            };
            if let Err(e) = outcome {
                if let Err(stop_err) = agent.stop() {
                    warn!(error = %stop_err, "stop after failed run");
                }
                agent.teardown();
                return Err(e.into());
            }
            agent.stop()?;
            let timeout = timeout.map(Duration::from_secs);
            let result = agent.collect(&ws.output_root(output.as_deref()), timeout);
            agent.teardown();
            print_report(&result?, false)?;
        }
        Command::List { root, filters } => {
            let ws = open(&cli.config, repo_root)?;
            let filters: Metadata = filters.into_iter().collect();
            let found = ws.discover(root.as_deref(), &filters)?;
            for run in &found.runs {
                let r = &run.manifest.run;
                println!(
                    "{} {} {} ({} files)",
                    format_timestamp(&r.start_time),
                    r.run_hash,
                    run.location.display(),
                    run.artifact_files().len()
                );
            }
            for (path, reason) in &found.skipped {
                eprintln!("skipped {}: {}", path.display(), reason);
            }
            println!("{} runs", found.runs.len());
        }
        Command::Teardown => {
            let ws = open(&cli.config, repo_root)?;
            match ws.resume_agent(None) {
                Ok(mut agent) => agent.teardown(),
                Err(e) => warn!(error = %format!("{:#}", e), "could not resume session; clearing it anyway"),
            }
            ws.clear_session()?;
            println!("Torn down");
        }
    }

    Ok(())
}

fn print_report(report: &CollectReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("Run {} -> {}", report.run_id, report.location.display());
    for a in &report.artifacts {
        println!("- {} [{}] {} rows", a.path.display(), a.adapter, a.rows);
    }
    for f in &report.failed_artifacts {
        println!("! {} [{}] {}", f.measurement, f.adapter, f.reason);
    }
    for f in &report.failed_adapters {
        println!("! adapter {} failed: {}", f.adapter, f.reason);
    }
    for id in &report.timed_out {
        println!("! adapter {} timed out", id);
    }
    if report.is_partial() {
        warn!(run_id = %report.run_id, "collect finished with partial results");
    }
    Ok(())
}
