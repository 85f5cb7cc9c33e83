use crate::condition::Condition;
use crate::definition::{NodeKind, WorkflowNode};
use crate::distribution::{TaskDistributionEngine, TaskRequest};
use crate::execution::WorkflowExecution;
use crate::types::{
    Payload, Task, TaskId, TaskPriority, TaskStatus, REQUIRED_CAPABILITIES_KEY,
};
use maestro_core::ValidationError;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// What a handler produced for a claimed node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// The node is done; the value becomes its result.
    Completed(Value),
    /// The result arrives later through a task callback.
    Pending,
}

/// How an agent node turns into a task.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStep {
    pub agent_id: Option<String>,
    pub priority: TaskPriority,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub required_capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionStep {
    Log { message: String },
    SetVariable { name: String, value: Value },
}

/// Executable form of a node, built once when its workflow is registered.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeHandler {
    Agent(AgentStep),
    Condition(Condition),
    Action(ActionStep),
    /// Parallel and sequential markers; the graph shape does the work.
    Passthrough,
}

impl NodeHandler {
    /// Read the node's config. Bad config is reported as a validation error
    /// so the workflow is rejected before it can run.
    pub fn build(node: &WorkflowNode) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidNodeConfig {
            node: node.id.clone(),
            reason,
        };

        match node.kind {
            NodeKind::Agent => {
                let agent_id = optional_str(&node.config, "agent_id").map_err(invalid)?;
                let priority = match node.config.get("priority") {
                    None => TaskPriority::Normal,
                    Some(v) => serde_json::from_value(v.clone())
                        .map_err(|e| invalid(format!("priority: {e}")))?,
                };
                let timeout_secs = optional_u64(&node.config, "timeout_seconds").map_err(invalid)?;
                let max_retries = optional_u64(&node.config, "max_retries")
                    .map_err(invalid)?
                    .map(|n| {
                        u32::try_from(n).map_err(|_| invalid("max_retries is too large".into()))
                    })
                    .transpose()?;
                let required_capabilities = match node.config.get(REQUIRED_CAPABILITIES_KEY) {
                    None => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|c| {
                            c.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| invalid("capabilities must be strings".into()))
                        })
                        .collect::<Result<_, _>>()?,
                    Some(_) => return Err(invalid("required_capabilities must be a list".into())),
                };
                Ok(NodeHandler::Agent(AgentStep {
                    agent_id,
                    priority,
                    timeout_secs,
                    max_retries,
                    required_capabilities,
                }))
            }
            NodeKind::Condition => {
                let source = optional_str(&node.config, "condition")
                    .map_err(invalid)?
                    .unwrap_or_else(|| "true".to_string());
                Condition::parse(&source)
                    .map(NodeHandler::Condition)
                    .map_err(|e| invalid(format!("condition '{source}': {e}")))
            }
            NodeKind::Action => {
                let action_type = optional_str(&node.config, "action_type")
                    .map_err(invalid)?
                    .unwrap_or_else(|| "log".to_string());
                match action_type.as_str() {
                    "log" => {
                        let message = optional_str(&node.config, "message")
                            .map_err(invalid)?
                            .unwrap_or_else(|| format!("Action {} executed", node.name));
                        Ok(NodeHandler::Action(ActionStep::Log { message }))
                    }
                    "set_variable" => {
                        let name = optional_str(&node.config, "variable_name")
                            .map_err(invalid)?
                            .ok_or_else(|| invalid("set_variable needs variable_name".into()))?;
                        let value = node
                            .config
                            .get("variable_value")
                            .cloned()
                            .unwrap_or(Value::Null);
                        Ok(NodeHandler::Action(ActionStep::SetVariable { name, value }))
                    }
                    other => Err(invalid(format!("unknown action_type '{other}'"))),
                }
            }
            NodeKind::Parallel | NodeKind::Sequential => Ok(NodeHandler::Passthrough),
        }
    }

    /// Run the handler for a claimed node. An `Err` fails the node.
    pub(crate) fn run(
        &self,
        node: &WorkflowNode,
        execution: &Arc<WorkflowExecution>,
        tasks: &TaskDistributionEngine,
        wake: &Arc<Notify>,
    ) -> Result<NodeOutcome, String> {
        match self {
            NodeHandler::Agent(step) => submit_agent_task(step, node, execution, tasks, wake),
            NodeHandler::Condition(condition) => {
                let (context, results) = execution.scopes();
                let outcome = condition.evaluate(&context, &results);
                Ok(NodeOutcome::Completed(json!({
                    "condition": condition.source(),
                    "condition_result": outcome,
                })))
            }
            NodeHandler::Action(ActionStep::Log { message }) => {
                info!(
                    execution_id = %execution.id(),
                    node = %node.id,
                    message = %message,
                    "Workflow action"
                );
                Ok(NodeOutcome::Completed(json!({
                    "action": "log",
                    "message": message,
                })))
            }
            NodeHandler::Action(ActionStep::SetVariable { name, value }) => {
                execution.set_variable(name.clone(), value.clone());
                Ok(NodeOutcome::Completed(json!({
                    "action": "set_variable",
                    "variable": name,
                    "value": value,
                })))
            }
            NodeHandler::Passthrough => Ok(NodeOutcome::Completed(json!({
                "node_type": node.kind.to_string(),
                "status": "completed",
            }))),
        }
    }
}

fn submit_agent_task(
    step: &AgentStep,
    node: &WorkflowNode,
    execution: &Arc<WorkflowExecution>,
    tasks: &TaskDistributionEngine,
    wake: &Arc<Notify>,
) -> Result<NodeOutcome, String> {
    let (context, _) = execution.scopes();
    let mut payload = Payload::new();
    payload.insert("node_id".into(), json!(node.id));
    payload.insert("execution_id".into(), json!(execution.id()));
    payload.insert("agent_config".into(), Value::Object(node.config.clone()));
    payload.insert("context".into(), Value::Object(context));
    payload.insert(
        REQUIRED_CAPABILITIES_KEY.into(),
        json!(step.required_capabilities),
    );

    let task_id = TaskId::new_v4();
    let mut request = TaskRequest::new(payload)
        .with_id(task_id)
        .with_priority(step.priority);
    request.agent_id = step.agent_id.clone();
    request.timeout_secs = step.timeout_secs;
    request.max_retries = step.max_retries;

    let exec = Arc::clone(execution);
    let node_id = node.id.clone();
    let wake = Arc::clone(wake);
    let retry_exec = Arc::clone(execution);
    let retry_node = node.id.clone();
    let request = request.on_retry(move |retry_id| {
        // declined once the execution has finished
        retry_exec.record_task(&retry_node, retry_id)
    });
    let request = request.on_finish(move |task: &Task| {
        let applied = match task.status {
            TaskStatus::Completed => exec.complete_node(
                &node_id,
                json!({
                    "task_id": task.id,
                    "agent_id": task.assigned_agent,
                    "output": task.result,
                }),
            ),
            TaskStatus::Failed => exec.fail_node(
                &node_id,
                task.error.clone().unwrap_or_else(|| "agent task failed".into()),
            ),
            TaskStatus::Timeout => exec.fail_node(
                &node_id,
                format!("task {} timed out after {} retries", task.id, task.retry_count),
            ),
            TaskStatus::Cancelled => {
                exec.fail_node(&node_id, format!("task {} was cancelled", task.id))
            }
            _ => false,
        };
        if applied {
            wake.notify_one();
        }
    });

    execution.record_task(&node.id, task_id);
    tasks.submit(request).map_err(|e| e.to_string())?;
    info!(
        execution_id = %execution.id(),
        node = %node.id,
        task_id = %task_id,
        "Agent node submitted"
    );
    Ok(NodeOutcome::Pending)
}

fn optional_str(config: &Payload, key: &str) -> Result<Option<String>, String> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(format!("{key} must be a string")),
    }
}

fn optional_u64(config: &Payload, key: &str) -> Result<Option<u64>, String> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("{key} must be a non-negative integer")),
    }
}
