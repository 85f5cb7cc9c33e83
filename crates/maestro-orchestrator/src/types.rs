use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Identifier of a task. Stable for the lifetime of a run.
pub type TaskId = Uuid;

/// Opaque task input handed to the agent untouched.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Payload key listing the capabilities an agent needs to run the task.
pub const REQUIRED_CAPABILITIES_KEY: &str = "required_capabilities";

/// Dispatch priority. Higher variants are dispatched first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    /// Whether the task can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// A unit of work scheduled onto an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Agent the submitter pinned this task to, if any.
    pub agent_id: Option<String>,
    /// Agent the task was actually dispatched to.
    #[serde(default)]
    pub assigned_agent: Option<String>,
    pub payload: Payload,
    pub priority: TaskPriority,
    /// Zero disables the timeout.
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub dependencies: Vec<TaskId>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: Option<i64>,
    /// The timed-out task this one retries.
    #[serde(default)]
    pub retry_of: Option<TaskId>,
}

impl Task {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: None,
            assigned_agent: None,
            payload,
            priority: TaskPriority::Normal,
            timeout_secs: 300,
            retry_count: 0,
            max_retries: 3,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            execution_time_ms: None,
            retry_of: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn pinned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the prerequisite tasks. Duplicate ids are collapsed.
    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        let mut seen = HashSet::new();
        self.dependencies = deps.into_iter().filter(|d| seen.insert(*d)).collect();
        self
    }

    /// All dependencies are in `completed`.
    pub fn dependencies_met(&self, completed: &HashSet<TaskId>) -> bool {
        self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Queued and unblocked.
    pub fn is_ready(&self, completed: &HashSet<TaskId>) -> bool {
        self.status == TaskStatus::Queued && self.dependencies_met(completed)
    }

    /// Capabilities listed under `required_capabilities` in the payload.
    /// Non-string entries are ignored.
    pub fn required_capabilities(&self) -> Vec<String> {
        self.payload
            .get(REQUIRED_CAPABILITIES_KEY)
            .and_then(|v| v.as_array())
            .map(|caps| {
                caps.iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Instant after which a running task counts as timed out.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        if self.timeout_secs == 0 {
            return None;
        }
        let timeout = Duration::try_seconds(i64::try_from(self.timeout_secs).ok()?)?;
        self.started_at
            .and_then(|start| start.checked_add_signed(timeout))
    }

    /// Running for strictly longer than `timeout_secs` as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && self.deadline().is_some_and(|d| now > d)
    }

    /// Whether the retry budget allows another attempt.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// A fresh task instance carrying the same work, one retry further along.
    pub fn retry(&self) -> Task {
        let mut retry = Task::new(self.payload.clone())
            .with_priority(self.priority)
            .with_timeout(self.timeout_secs)
            .with_max_retries(self.max_retries)
            .with_dependencies(self.dependencies.clone());
        retry.agent_id = self.agent_id.clone();
        retry.retry_count = self.retry_count + 1;
        retry.retry_of = Some(self.id);
        retry
    }
}
