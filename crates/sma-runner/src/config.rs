use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sma_adapter::{CommandAdapter, FixtureAdapter, MeasurementAdapter};
use sma_core::{Metadata, ReportFormat};
use sma_template::{check_filename_template, Template};

use crate::convert::metadata_from_toml;

pub const DEFAULT_LOCATION: &str = "reports/${startTime}_${runHash}/";
pub const DEFAULT_FILENAME: &str = "${name}.csv";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub session: SessionConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub observation: ObservationConfig,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,
    /// Location-metadata defaults for every run of this session.
    #[serde(default)]
    pub extras: BTreeMap<String, toml::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub format: ReportFormat,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_filename")]
    pub filename: String,
    /// Output root for `collect` and `list` when none is given.
    #[serde(default = "default_root")]
    pub root: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: ReportFormat::Csv,
            location: default_location(),
            filename: default_filename(),
            root: default_root(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObservationConfig {
    /// Window length for a collect with no preceding run.
    #[serde(default = "default_lookback")]
    pub lookback_secs: u64,
    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_secs: u64,
    /// Idle baseline observed before the workload starts.
    #[serde(default)]
    pub left_secs: u64,
    /// Cool-down observed after the workload ends.
    #[serde(default)]
    pub right_secs: u64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            lookback_secs: default_lookback(),
            collect_timeout_secs: default_collect_timeout(),
            left_secs: 0,
            right_secs: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: AdapterKind,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterKind {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        probe: Option<Vec<String>>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Fixture {
        path: String,
    },
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}

fn default_filename() -> String {
    DEFAULT_FILENAME.to_string()
}

fn default_root() -> String {
    ".".to_string()
}

fn default_lookback() -> u64 {
    300
}

fn default_collect_timeout() -> u64 {
    60
}

impl Config {
    pub fn default_for_repo(session_name: &str) -> Self {
        Self {
            session: SessionConfig {
                name: session_name.to_string(),
                extras: BTreeMap::new(),
            },
            report: ReportConfig::default(),
            observation: ObservationConfig::default(),
            adapters: vec![],
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Template and adapter checks that need no run.
    pub fn validate(&self) -> Result<()> {
        Template::parse(&self.report.location).with_context(|| "report.location")?;
        check_filename_template(&self.report.filename).with_context(|| "report.filename")?;
        let mut ids = HashSet::new();
        for a in &self.adapters {
            if a.id.trim().is_empty() {
                return Err(anyhow!("adapter with empty id"));
            }
            if !ids.insert(a.id.as_str()) {
                return Err(anyhow!("duplicate adapter id {}", a.id));
            }
        }
        self.session_metadata()?;
        Ok(())
    }

    /// Location metadata every run starts from: `session` plus extras.
    pub fn session_metadata(&self) -> Result<Metadata> {
        let mut meta = metadata_from_toml(&self.session.extras)?;
        meta.insert("session".into(), self.session.name.clone().into());
        Ok(meta)
    }

    /// Instantiate the configured adapters. Relative paths resolve against
    /// `base_dir`, the workspace root.
    pub fn build_adapters(&self, base_dir: &Path) -> Vec<Arc<dyn MeasurementAdapter>> {
        self.adapters
            .iter()
            .map(|a| -> Arc<dyn MeasurementAdapter> {
                match &a.kind {
                    AdapterKind::Command { program, args, probe, cwd } => {
                        let mut adapter = CommandAdapter::new(a.id.clone(), program.clone(), args.clone());
                        adapter.probe = probe.clone();
                        adapter.cwd = Some(cwd.as_deref().map(|c| resolve(base_dir, c)).unwrap_or_else(|| base_dir.to_path_buf()));
                        Arc::new(adapter)
                    }
                    AdapterKind::Fixture { path } => Arc::new(FixtureAdapter::new(a.id.clone(), resolve(base_dir, path))),
                }
            })
            .collect()
    }

    pub fn report_root(&self, base_dir: &Path) -> PathBuf {
        resolve(base_dir, &self.report.root)
    }

    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".sma").join("sma.toml")
    }

    pub fn session_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".sma").join("session.json")
    }
}

fn resolve(base_dir: &Path, raw: &str) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(raw).to_string());
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}
