use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sma_core::Metadata;
use sma_report::{discover_runs, Discovery};

use crate::agent::Agent;
use crate::config::Config;
use crate::session::SessionFile;

/// A directory holding `.sma/sma.toml` and, between CLI calls, the active
/// session.
pub struct Workspace {
    pub repo_root: PathBuf,
    pub cfg: Config,
}

impl Workspace {
    pub fn open(repo_root: PathBuf) -> Result<Self> {
        let cfg_path = Config::config_path(&repo_root);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default_for_repo(&default_session_name(&repo_root));
            cfg.save_to(&cfg_path)?;
            cfg
        };
        Ok(Self { repo_root, cfg })
    }

    /// Open with an explicit config file; it must already exist.
    pub fn open_with_config(repo_root: PathBuf, cfg_path: &Path) -> Result<Self> {
        let cfg = Config::load_from(cfg_path)?;
        Ok(Self { repo_root, cfg })
    }

    /// Write a default config unless one exists. Returns the config path.
    pub fn init_repo(repo_root: &Path) -> Result<PathBuf> {
        let cfg_path = Config::config_path(repo_root);
        if !cfg_path.exists() {
            Config::default_for_repo(&default_session_name(repo_root)).save_to(&cfg_path)?;
        }
        Ok(cfg_path)
    }

    pub fn agent(&self) -> Result<Agent> {
        Agent::from_config(&self.cfg, &self.repo_root).with_context(|| "build agent from config")
    }

    /// A connected agent with any saved session restored into it.
    pub fn resume_agent(&self, experiment_label: Option<String>) -> Result<Agent> {
        let mut agent = self.agent()?;
        if let Some(label) = experiment_label {
            agent = agent.with_experiment_label(label);
        }
        agent.connect()?;
        if let Some(session) = self.load_session()? {
            agent.restore(session)?;
        }
        Ok(agent)
    }

    pub fn session_path(&self) -> PathBuf {
        Config::session_path(&self.repo_root)
    }

    pub fn load_session(&self) -> Result<Option<SessionFile>> {
        SessionFile::load(&self.session_path())
    }

    pub fn save_session(&self, agent: &Agent) -> Result<()> {
        agent.snapshot().save(&self.session_path())
    }

    pub fn clear_session(&self) -> Result<()> {
        SessionFile::clear(&self.session_path())
    }

    pub fn output_root(&self, override_root: Option<&Path>) -> PathBuf {
        match override_root {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => self.repo_root.join(p),
            None => self.cfg.report_root(&self.repo_root),
        }
    }

    pub fn discover(&self, root: Option<&Path>, filters: &Metadata) -> Result<Discovery> {
        let root = self.output_root(root);
        discover_runs(&root, &self.cfg.report.location, filters)
            .with_context(|| format!("search reports under {}", root.display()))
    }
}

fn default_session_name(repo_root: &Path) -> String {
    repo_root
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("default")
        .to_string()
}
