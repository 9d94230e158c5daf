use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::{ExecutionMode, OrchestratorConfig, PlannerConfig};
use crate::{clog_debug, Error, Result};

fn default_decision_threshold() -> f64 {
    0.5
}

fn default_decision_timeout_secs() -> u64 {
    300
}

fn default_event_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where checkpoint blobs and the index live. Defaults to
    /// `<project>/.conductor/state`.
    pub state_dir: Option<String>,
    /// Confidence below which a step is gated by a decision.
    #[serde(default = "default_decision_threshold")]
    pub decision_threshold: f64,
    /// Auto-resolve timeout for planned decisions; 0 waits forever.
    #[serde(default = "default_decision_timeout_secs")]
    pub decision_timeout_secs: u64,
    /// Checkpoint before the first step in addition to mutating steps.
    #[serde(default)]
    pub initial_checkpoint: bool,
    /// Dispatch parallel groups concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Upper bound on a single event-sink call.
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: None,
            decision_threshold: default_decision_threshold(),
            decision_timeout_secs: default_decision_timeout_secs(),
            initial_checkpoint: false,
            parallel: false,
            event_timeout_ms: default_event_timeout_ms(),
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Resolve the checkpoint state directory for a project root.
    pub fn state_dir_for(&self, project_root: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) => expand_tilde(dir),
            None => project_root.join(".conductor").join("state"),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: threshold={}, decision_timeout={}s, parallel={}",
            config.decision_threshold,
            config.decision_timeout_secs,
            config.parallel
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                clog_debug!("Creating config directory {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.decision_threshold) {
            return Err(Error::Validation(format!(
                "decision_threshold must be within 0.0..=1.0, got {}",
                self.decision_threshold
            )));
        }
        Ok(())
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            confidence_threshold: self.decision_threshold,
            decision_timeout: (self.decision_timeout_secs > 0)
                .then(|| Duration::from_secs(self.decision_timeout_secs)),
            initial_checkpoint: self.initial_checkpoint,
            ..PlannerConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            mode: if self.parallel {
                ExecutionMode::Parallel
            } else {
                ExecutionMode::Sequential
            },
            event_timeout: Duration::from_millis(self.event_timeout_ms),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
