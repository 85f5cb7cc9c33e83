use crate::agent::AgentSpec;
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the task and workflow engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_timeout_scan_interval_ms")]
    pub timeout_scan_interval_ms: u64,
    #[serde(default = "default_workflow_poll_interval_ms")]
    pub workflow_poll_interval_ms: u64,
    /// Applied when a submitter does not choose a timeout. Zero disables it.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// In-flight cap per agent. `None` means unbounded.
    #[serde(default)]
    pub max_tasks_per_agent: Option<usize>,
    /// Agents created and registered at startup.
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

fn default_dispatch_interval_ms() -> u64 {
    100
}
fn default_timeout_scan_interval_ms() -> u64 {
    1000
}
fn default_workflow_poll_interval_ms() -> u64 {
    100
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: default_dispatch_interval_ms(),
            timeout_scan_interval_ms: default_timeout_scan_interval_ms(),
            workflow_poll_interval_ms: default_workflow_poll_interval_ms(),
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: default_max_retries(),
            max_tasks_per_agent: None,
            agents: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> MaestroResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| MaestroError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> MaestroResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MaestroError::Config(format!("Failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> MaestroResult<()> {
        if self.dispatch_interval_ms == 0
            || self.timeout_scan_interval_ms == 0
            || self.workflow_poll_interval_ms == 0
        {
            return Err(MaestroError::Config(
                "poll intervals must be greater than zero".to_string(),
            ));
        }
        if self.max_tasks_per_agent == Some(0) {
            return Err(MaestroError::Config(
                "max_tasks_per_agent must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(MaestroError::Config(format!(
                    "agent '{}' is declared twice",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn timeout_scan_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_scan_interval_ms)
    }

    pub fn workflow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.workflow_poll_interval_ms)
    }
}
