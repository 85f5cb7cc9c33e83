use crate::types::{Payload, Task, TaskId, TaskPriority};
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Payload key that makes [`LoopbackConnector`] wait before answering.
pub const SIMULATE_DELAY_KEY: &str = "simulate_delay_ms";
/// Payload key that makes [`LoopbackConnector`] fail the task with the given message.
pub const SIMULATE_ERROR_KEY: &str = "simulate_error";

/// Declaration of an agent: its id and what it can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Connector-specific settings.
    #[serde(default)]
    pub config: Payload,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, capabilities: &[&str]) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            config: Payload::new(),
        }
    }
}

/// Lifecycle state of an agent as reported by its connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Inactive,
    Active,
    Paused,
    Error,
}

/// What an agent receives when a task is dispatched to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub payload: Payload,
    pub priority: TaskPriority,
    pub retry_count: u32,
    pub timeout_secs: u64,
}

impl From<&Task> for TaskDescriptor {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            payload: task.payload.clone(),
            priority: task.priority,
            retry_count: task.retry_count,
            timeout_secs: task.timeout_secs,
        }
    }
}

/// The boundary between the scheduler and whatever actually runs agents.
///
/// Only [`execute_task`](AgentConnector::execute_task) takes part in
/// scheduling; the lifecycle methods let a composition root manage the
/// agents behind a connector.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Name of the framework behind this connector.
    fn framework(&self) -> &str;

    async fn create_agent(&self, spec: AgentSpec) -> MaestroResult<String>;
    async fn start_agent(&self, agent_id: &str) -> MaestroResult<()>;
    async fn stop_agent(&self, agent_id: &str) -> MaestroResult<()>;
    async fn pause_agent(&self, agent_id: &str) -> MaestroResult<()>;
    async fn resume_agent(&self, agent_id: &str) -> MaestroResult<()>;
    async fn delete_agent(&self, agent_id: &str) -> MaestroResult<()>;
    async fn agent_status(&self, agent_id: &str) -> MaestroResult<AgentStatus>;

    /// Run a task to completion and return its result.
    async fn execute_task(
        &self,
        agent_id: &str,
        task: TaskDescriptor,
    ) -> MaestroResult<serde_json::Value>;
}

/// In-process connector that answers every task by echoing its payload.
///
/// Payload keys [`SIMULATE_DELAY_KEY`] and [`SIMULATE_ERROR_KEY`] let
/// callers exercise slow and failing agents without a real framework.
pub struct LoopbackConnector {
    agents: RwLock<HashMap<String, LoopbackAgent>>,
    executions: AtomicUsize,
}

struct LoopbackAgent {
    spec: AgentSpec,
    status: AgentStatus,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            executions: AtomicUsize::new(0),
        }
    }

    /// Number of `execute_task` calls that reached an agent.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Capabilities declared when the agent was created.
    pub fn capabilities(&self, agent_id: &str) -> Option<Vec<String>> {
        self.agents
            .read()
            .get(agent_id)
            .map(|a| a.spec.capabilities.clone())
    }

    fn transition(
        &self,
        agent_id: &str,
        allowed: &[AgentStatus],
        to: AgentStatus,
    ) -> MaestroResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| MaestroError::Agent(format!("Unknown agent: {agent_id}")))?;
        if !allowed.contains(&agent.status) {
            return Err(MaestroError::Agent(format!(
                "Agent {agent_id} cannot move from {:?} to {to:?}",
                agent.status
            )));
        }
        agent.status = to;
        debug!(agent = %agent_id, status = ?to, "Loopback agent status changed");
        Ok(())
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentConnector for LoopbackConnector {
    fn framework(&self) -> &str {
        "loopback"
    }

    async fn create_agent(&self, spec: AgentSpec) -> MaestroResult<String> {
        let mut agents = self.agents.write();
        if agents.contains_key(&spec.id) {
            return Err(MaestroError::Agent(format!("Agent already exists: {}", spec.id)));
        }
        let id = spec.id.clone();
        info!(agent = %id, capabilities = ?spec.capabilities, "Loopback agent created");
        agents.insert(
            id.clone(),
            LoopbackAgent {
                spec,
                status: AgentStatus::Inactive,
            },
        );
        Ok(id)
    }

    async fn start_agent(&self, agent_id: &str) -> MaestroResult<()> {
        self.transition(
            agent_id,
            &[AgentStatus::Inactive, AgentStatus::Error],
            AgentStatus::Active,
        )
    }

    async fn stop_agent(&self, agent_id: &str) -> MaestroResult<()> {
        self.transition(
            agent_id,
            &[AgentStatus::Active, AgentStatus::Paused, AgentStatus::Error],
            AgentStatus::Inactive,
        )
    }

    async fn pause_agent(&self, agent_id: &str) -> MaestroResult<()> {
        self.transition(agent_id, &[AgentStatus::Active], AgentStatus::Paused)
    }

    async fn resume_agent(&self, agent_id: &str) -> MaestroResult<()> {
        self.transition(agent_id, &[AgentStatus::Paused], AgentStatus::Active)
    }

    async fn delete_agent(&self, agent_id: &str) -> MaestroResult<()> {
        self.agents
            .write()
            .remove(agent_id)
            .map(|_| ())
            .ok_or_else(|| MaestroError::Agent(format!("Unknown agent: {agent_id}")))
    }

    async fn agent_status(&self, agent_id: &str) -> MaestroResult<AgentStatus> {
        self.agents
            .read()
            .get(agent_id)
            .map(|a| a.status)
            .ok_or_else(|| MaestroError::Agent(format!("Unknown agent: {agent_id}")))
    }

    async fn execute_task(
        &self,
        agent_id: &str,
        task: TaskDescriptor,
    ) -> MaestroResult<serde_json::Value> {
        match self.agent_status(agent_id).await? {
            AgentStatus::Active => {}
            other => {
                return Err(MaestroError::Agent(format!(
                    "Agent {agent_id} is {other:?}, not active"
                )))
            }
        }
        self.executions.fetch_add(1, Ordering::SeqCst);

        if let Some(ms) = task.payload.get(SIMULATE_DELAY_KEY).and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(message) = task.payload.get(SIMULATE_ERROR_KEY).and_then(|v| v.as_str()) {
            return Err(MaestroError::Agent(message.to_string()));
        }

        Ok(serde_json::json!({
            "agent_id": agent_id,
            "task_id": task.task_id,
            "retry_count": task.retry_count,
            "echo": task.payload,
        }))
    }
}
