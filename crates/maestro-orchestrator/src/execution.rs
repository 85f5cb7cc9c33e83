use crate::definition::WorkflowDefinition;
use crate::types::{Payload, TaskId};
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Overall state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Ready => "ready",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-execution state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Reserved; connection conditions never prune branches.
    Skipped,
}

/// Shadow copy of a node's run state inside one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRun {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: Option<i64>,
    /// Task submitted on behalf of an agent node.
    pub task_id: Option<TaskId>,
}

impl NodeRun {
    fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            execution_time_ms: None,
            task_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub running_nodes: usize,
    pub progress_percentage: f64,
    pub status: ExecutionStatus,
}

/// Serializable view of every field of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub input_data: Payload,
    pub current_nodes: Vec<String>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub node_results: Payload,
    pub context: Payload,
    pub nodes: BTreeMap<String, NodeRun>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

struct ExecutionState {
    status: ExecutionStatus,
    current: BTreeSet<String>,
    completed: BTreeSet<String>,
    failed: BTreeSet<String>,
    /// Running nodes whose handler has already been invoked.
    claimed: HashSet<String>,
    nodes: BTreeMap<String, NodeRun>,
    results: Payload,
    context: Payload,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// A live run of a [`WorkflowDefinition`].
///
/// All mutable state sits behind one lock so that two predecessors of a
/// fan-in node completing at once activate it exactly once. Every status
/// change is also published on a `watch` channel for
/// [`wait_terminal`](Self::wait_terminal).
pub struct WorkflowExecution {
    id: Uuid,
    definition: Arc<WorkflowDefinition>,
    input: Payload,
    created_at: DateTime<Utc>,
    state: Mutex<ExecutionState>,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl WorkflowExecution {
    pub fn new(definition: Arc<WorkflowDefinition>, input: Payload) -> Self {
        let nodes = definition
            .nodes()
            .map(|n| (n.id.clone(), NodeRun::pending()))
            .collect();
        let (status_tx, _) = watch::channel(ExecutionStatus::Ready);
        Self {
            id: Uuid::new_v4(),
            definition,
            input,
            created_at: Utc::now(),
            state: Mutex::new(ExecutionState {
                status: ExecutionStatus::Ready,
                current: BTreeSet::new(),
                completed: BTreeSet::new(),
                failed: BTreeSet::new(),
                claimed: HashSet::new(),
                nodes,
                results: Payload::new(),
                context: Payload::new(),
                started_at: None,
                completed_at: None,
                error: None,
            }),
            status_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn input(&self) -> &Payload {
        &self.input
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().status
    }

    /// Seed the context (definition variables, then input data on top) and
    /// activate the entry nodes.
    pub fn start(&self) -> MaestroResult<()> {
        let mut state = self.state.lock();
        if state.status != ExecutionStatus::Ready {
            return Err(MaestroError::AlreadyStarted {
                id: self.id,
                status: state.status.to_string(),
            });
        }

        state.context = self.definition.variables.clone();
        for (key, value) in &self.input {
            state.context.insert(key.clone(), value.clone());
        }
        state.started_at = Some(Utc::now());
        self.set_status(&mut state, ExecutionStatus::Running);

        let entries: Vec<String> = self
            .definition
            .entry_nodes()
            .into_iter()
            .map(str::to_string)
            .collect();
        for node in entries {
            Self::activate(&mut state, node);
        }
        info!(
            execution_id = %self.id,
            workflow = %self.definition.id,
            entry_nodes = state.current.len(),
            "Workflow execution started"
        );
        Ok(())
    }

    /// Record a node's result and activate every successor whose
    /// predecessors have all completed. Returns whether the result was
    /// applied; results for nodes that are not running, or arriving after
    /// the execution ended, are ignored.
    pub fn complete_node(&self, node_id: &str, result: serde_json::Value) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() || !state.current.remove(node_id) {
            debug!(execution_id = %self.id, node = %node_id, "Ignoring node completion");
            return false;
        }
        state.claimed.remove(node_id);
        state.completed.insert(node_id.to_string());
        state.results.insert(node_id.to_string(), result.clone());
        if let Some(run) = state.nodes.get_mut(node_id) {
            let now = Utc::now();
            run.status = NodeStatus::Completed;
            run.completed_at = Some(now);
            run.execution_time_ms = run.started_at.map(|s| (now - s).num_milliseconds());
            run.result = Some(result);
        }
        debug!(execution_id = %self.id, node = %node_id, "Node completed");

        for next in self.definition.next_nodes(node_id) {
            let ready = self
                .definition
                .previous_nodes(next)
                .iter()
                .all(|prev| state.completed.contains(*prev));
            let seen = state.current.contains(next)
                || state.completed.contains(next)
                || state.failed.contains(next);
            if ready && !seen {
                Self::activate(&mut state, next.to_string());
            }
        }

        self.check_completion(&mut state);
        true
    }

    /// Record a node failure. The whole execution fails immediately.
    pub fn fail_node(&self, node_id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        let mut state = self.state.lock();
        if state.status.is_terminal() || !state.current.remove(node_id) {
            debug!(execution_id = %self.id, node = %node_id, "Ignoring node failure");
            return false;
        }
        state.claimed.remove(node_id);
        state.failed.insert(node_id.to_string());
        if let Some(run) = state.nodes.get_mut(node_id) {
            run.status = NodeStatus::Failed;
            run.completed_at = Some(Utc::now());
            run.error = Some(error.clone());
        }

        warn!(
            execution_id = %self.id,
            node = %node_id,
            error = %error,
            "Node failed, failing execution"
        );
        state.error = Some(format!("Node {node_id} failed: {error}"));
        state.completed_at = Some(Utc::now());
        self.set_status(&mut state, ExecutionStatus::Failed);
        true
    }

    /// Stop handing out new nodes. Results of nodes already in flight
    /// still land while paused.
    pub fn pause(&self) -> MaestroResult<()> {
        let mut state = self.state.lock();
        if state.status != ExecutionStatus::Running {
            return Err(self.rejected("pause", state.status));
        }
        self.set_status(&mut state, ExecutionStatus::Paused);
        info!(execution_id = %self.id, "Workflow execution paused");
        Ok(())
    }

    pub fn resume(&self) -> MaestroResult<()> {
        let mut state = self.state.lock();
        if state.status != ExecutionStatus::Paused {
            return Err(self.rejected("resume", state.status));
        }
        self.set_status(&mut state, ExecutionStatus::Running);
        info!(execution_id = %self.id, "Workflow execution resumed");
        // everything may have finished while paused
        self.check_completion(&mut state);
        Ok(())
    }

    /// Legal from any non-terminal state.
    pub fn cancel(&self) -> MaestroResult<()> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return Err(self.rejected("cancel", state.status));
        }
        state.completed_at = Some(Utc::now());
        self.set_status(&mut state, ExecutionStatus::Cancelled);
        info!(execution_id = %self.id, "Workflow execution cancelled");
        Ok(())
    }

    pub fn progress(&self) -> ExecutionProgress {
        let state = self.state.lock();
        let total = self.definition.node_count();
        let finished = state.completed.len() + state.failed.len();
        let percentage = if total == 0 {
            0.0
        } else {
            finished as f64 / total as f64 * 100.0
        };
        ExecutionProgress {
            total_nodes: total,
            completed_nodes: state.completed.len(),
            failed_nodes: state.failed.len(),
            running_nodes: state.current.len(),
            progress_percentage: percentage,
            status: state.status,
        }
    }

    /// Running nodes whose handler has not been invoked yet, marked as
    /// claimed. Empty unless the execution is running.
    pub fn claim_runnable(&self) -> Vec<String> {
        let mut state = self.state.lock();
        if state.status != ExecutionStatus::Running {
            return Vec::new();
        }
        let fresh: Vec<String> = state
            .current
            .iter()
            .filter(|n| !state.claimed.contains(*n))
            .cloned()
            .collect();
        state.claimed.extend(fresh.iter().cloned());
        fresh
    }

    /// Copies of the context and the node results, for handlers.
    pub fn scopes(&self) -> (Payload, Payload) {
        let state = self.state.lock();
        (state.context.clone(), state.results.clone())
    }

    pub fn set_variable(&self, key: impl Into<String>, value: serde_json::Value) {
        self.state.lock().context.insert(key.into(), value);
    }

    /// Point the node at the task now carrying its work. Returns `false` once
    /// the execution has finished, leaving the node untouched.
    pub(crate) fn record_task(&self, node_id: &str, task_id: TaskId) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        if let Some(run) = state.nodes.get_mut(node_id) {
            run.task_id = Some(task_id);
        }
        true
    }

    /// Tasks submitted for agent nodes of this execution.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.state
            .lock()
            .nodes
            .values()
            .filter_map(|run| run.task_id)
            .collect()
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeRun> {
        self.state.lock().nodes.get(node_id).cloned()
    }

    pub fn node_result(&self, node_id: &str) -> Option<serde_json::Value> {
        self.state.lock().results.get(node_id).cloned()
    }

    pub fn context(&self) -> Payload {
        self.state.lock().context.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        let state = self.state.lock();
        ExecutionSnapshot {
            id: self.id,
            workflow_id: self.definition.id.clone(),
            status: state.status,
            input_data: self.input.clone(),
            current_nodes: state.current.iter().cloned().collect(),
            completed_nodes: state.completed.iter().cloned().collect(),
            failed_nodes: state.failed.iter().cloned().collect(),
            node_results: state.results.clone(),
            context: state.context.clone(),
            nodes: state.nodes.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            error: state.error.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }

    /// Resolve once the execution reaches a terminal status.
    pub async fn wait_terminal(&self) -> ExecutionStatus {
        let mut rx = self.status_tx.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    fn activate(state: &mut ExecutionState, node_id: String) {
        if let Some(run) = state.nodes.get_mut(&node_id) {
            run.status = NodeStatus::Running;
            run.started_at = Some(Utc::now());
        }
        state.current.insert(node_id);
    }

    fn check_completion(&self, state: &mut ExecutionState) {
        if state.status != ExecutionStatus::Running {
            return;
        }
        if state.completed.len() + state.failed.len() != self.definition.node_count() {
            return;
        }
        let status = if state.failed.is_empty() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        state.completed_at = Some(Utc::now());
        self.set_status(state, status);
        info!(execution_id = %self.id, status = %status, "Workflow execution finished");
    }

    fn set_status(&self, state: &mut ExecutionState, status: ExecutionStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    fn rejected(&self, action: &str, status: ExecutionStatus) -> MaestroError {
        MaestroError::CancellationRejected(format!(
            "cannot {action} execution {} while {status}",
            self.id
        ))
    }
}
