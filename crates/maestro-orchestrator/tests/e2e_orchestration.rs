//! End-to-end orchestration tests.
//!
//! Drives both engines through their background loops against the loopback
//! connector and a scripted connector whose per-node behaviour is fixed up
//! front. Checks fan-in ordering, fail-fast, timeouts inside workflows,
//! cancellation and priority dispatch.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use maestro_orchestrator::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Scripted connector: behaviour keyed by the payload's node_id or label
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail(&'static str),
    Hang,
}

#[derive(Default)]
struct ScriptedConnector {
    behaviors: HashMap<String, Behavior>,
    calls: parking_lot::Mutex<Vec<String>>,
}

impl ScriptedConnector {
    fn with(mut self, key: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(key.to_string(), behavior);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AgentConnector for ScriptedConnector {
    fn framework(&self) -> &str {
        "scripted"
    }

    async fn create_agent(&self, spec: AgentSpec) -> MaestroResult<String> {
        Ok(spec.id)
    }
    async fn start_agent(&self, _agent_id: &str) -> MaestroResult<()> {
        Ok(())
    }
    async fn stop_agent(&self, _agent_id: &str) -> MaestroResult<()> {
        Ok(())
    }
    async fn pause_agent(&self, _agent_id: &str) -> MaestroResult<()> {
        Ok(())
    }
    async fn resume_agent(&self, _agent_id: &str) -> MaestroResult<()> {
        Ok(())
    }
    async fn delete_agent(&self, _agent_id: &str) -> MaestroResult<()> {
        Ok(())
    }
    async fn agent_status(&self, _agent_id: &str) -> MaestroResult<AgentStatus> {
        Ok(AgentStatus::Active)
    }

    async fn execute_task(
        &self,
        agent_id: &str,
        task: TaskDescriptor,
    ) -> MaestroResult<serde_json::Value> {
        let key = task
            .payload
            .get("node_id")
            .or_else(|| task.payload.get("label"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.calls.lock().push(key.clone());

        match self.behaviors.get(&key).cloned().unwrap_or(Behavior::Succeed) {
            Behavior::Succeed => Ok(json!({"handled": key, "by": agent_id})),
            Behavior::Fail(message) => Err(MaestroError::Agent(message.to_string())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!(null))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config(agents: Vec<AgentSpec>) -> OrchestratorConfig {
    OrchestratorConfig {
        dispatch_interval_ms: 10,
        timeout_scan_interval_ms: 50,
        workflow_poll_interval_ms: 10,
        agents,
        ..OrchestratorConfig::default()
    }
}

fn agent_node(id: &str) -> WorkflowNode {
    WorkflowNode::new(id, NodeKind::Agent, id.to_uppercase())
}

fn diamond(id: &str) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(id, "Diamond");
    for node in ["a", "b", "c", "d"] {
        def.add_node(agent_node(node)).unwrap();
    }
    for (from, to) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
        def.add_connection(WorkflowConnection::new(from, to)).unwrap();
    }
    def
}

async fn scripted(connector: ScriptedConnector) -> (Orchestrator, Arc<ScriptedConnector>) {
    let connector = Arc::new(connector);
    let orchestrator = Orchestrator::new(
        fast_config(vec![AgentSpec::new("worker", &[])]),
        connector.clone(),
    )
    .await
    .unwrap();
    orchestrator.start();
    (orchestrator, connector)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_research_pipeline_with_loopback_agents() {
    let config = fast_config(vec![
        AgentSpec::new("researcher", &["search"]),
        AgentSpec::new("writer", &["write"]),
    ]);
    let orchestrator = Orchestrator::new(config, Arc::new(LoopbackConnector::new()))
        .await
        .unwrap();
    orchestrator.start();

    let def = WorkflowDefinition::from_toml_str(
        r#"
        [workflow]
        id = "research"
        name = "Research pipeline"

        [variables]
        topic = "borrow checker"

        [[nodes]]
        id = "search"
        kind = "agent"
        name = "Search"
        config = { required_capabilities = ["search"], priority = "high" }

        [[nodes]]
        id = "check"
        kind = "condition"
        name = "Check"
        config = { condition = "results.search.agent_id == 'researcher' && exists(topic)" }

        [[nodes]]
        id = "write"
        kind = "agent"
        name = "Write"
        config = { required_capabilities = ["write"] }

        [[connections]]
        from = "search"
        to = "check"

        [[connections]]
        from = "check"
        to = "write"
        "#,
    )
    .unwrap();
    let workflows = orchestrator.workflows();
    workflows.register_workflow(def).unwrap();

    let input = json!({"audience": "beginners"}).as_object().cloned().unwrap();
    let id = workflows.execute_workflow("research", input).unwrap();
    let status = workflows
        .wait_for_completion(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    let exec = workflows.get_execution(id).unwrap();
    let search = exec.node_result("search").unwrap();
    assert_eq!(search["agent_id"], "researcher");
    assert_eq!(search["output"]["echo"]["context"]["topic"], "borrow checker");
    assert_eq!(search["output"]["echo"]["context"]["audience"], "beginners");
    assert_eq!(exec.node_result("check").unwrap()["condition_result"], true);
    assert_eq!(exec.node_result("write").unwrap()["agent_id"], "writer");

    let progress = exec.progress();
    assert_eq!(progress.completed_nodes, 3);
    assert_eq!(progress.progress_percentage, 100.0);

    let stats = orchestrator.tasks().system_stats();
    assert_eq!(stats.queue.completed_tasks, 2);
    assert_eq!(stats.pending_callbacks, 0);
    assert!(stats.agents.iter().all(|a| a.in_flight == 0));

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_diamond_fan_in_runs_last() {
    let (orchestrator, connector) = scripted(ScriptedConnector::default()).await;
    let workflows = orchestrator.workflows();
    workflows.register_workflow(diamond("diamond")).unwrap();

    let id = workflows.execute_workflow("diamond", Payload::new()).unwrap();
    let status = workflows
        .wait_for_completion(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    let calls = connector.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0], "a");
    let mut middle = calls[1..3].to_vec();
    middle.sort();
    assert_eq!(middle, vec!["b", "c"]);
    assert_eq!(calls[3], "d");

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_failing_node_fails_whole_execution() {
    let connector = ScriptedConnector::default().with("b", Behavior::Fail("tool crashed"));
    let (orchestrator, connector) = scripted(connector).await;
    let workflows = orchestrator.workflows();
    workflows.register_workflow(diamond("diamond")).unwrap();

    let id = workflows.execute_workflow("diamond", Payload::new()).unwrap();
    let status = workflows
        .wait_for_completion(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);

    let exec = workflows.get_execution(id).unwrap();
    assert_eq!(
        exec.error().as_deref(),
        Some("Node b failed: Agent error: tool crashed")
    );
    assert_eq!(exec.node_state("b").unwrap().status, NodeStatus::Failed);
    assert!(!connector.calls().contains(&"d".to_string()));

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_timed_out_agent_node_fails_after_retries() {
    let connector = ScriptedConnector::default().with("slow", Behavior::Hang);
    let (orchestrator, connector) = scripted(connector).await;
    let workflows = orchestrator.workflows();

    let mut def = WorkflowDefinition::new("slow", "Slow");
    def.add_node(
        agent_node("slow")
            .with_config("timeout_seconds", json!(1))
            .with_config("max_retries", json!(1)),
    )
    .unwrap();
    workflows.register_workflow(def).unwrap();

    let id = workflows.execute_workflow("slow", Payload::new()).unwrap();
    let status = workflows
        .wait_for_completion(id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);

    let exec = workflows.get_execution(id).unwrap();
    assert!(exec.error().unwrap().contains("timed out after 1 retries"));
    assert_eq!(connector.calls(), vec!["slow", "slow"]);

    let tasks = orchestrator.tasks();
    let timed_out = tasks.tasks_by_status(TaskStatus::Timeout);
    assert_eq!(timed_out.len(), 2);
    assert_eq!(orchestrator.tasks().registry().load("worker"), 0);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_cancel_execution_cancels_queued_agent_task() {
    let (orchestrator, connector) = scripted(ScriptedConnector::default()).await;
    let workflows = orchestrator.workflows();

    let mut def = WorkflowDefinition::new("pinned", "Pinned");
    def.add_node(agent_node("wait").with_config("agent_id", json!("offline")))
        .unwrap();
    workflows.register_workflow(def).unwrap();

    let id = workflows.execute_workflow("pinned", Payload::new()).unwrap();
    let exec = workflows.get_execution(id).unwrap();
    let mut task_id = None;
    for _ in 0..100 {
        task_id = exec.node_state("wait").unwrap().task_id;
        if task_id.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let task_id = task_id.unwrap();
    assert_eq!(orchestrator.tasks().get_task_status(task_id), Some(TaskStatus::Queued));

    workflows.cancel_execution(id).unwrap();
    assert_eq!(workflows.get_execution_status(id), Some(ExecutionStatus::Cancelled));
    assert_eq!(
        orchestrator.tasks().get_task_status(task_id),
        Some(TaskStatus::Cancelled)
    );
    assert!(connector.calls().is_empty());
    assert!(workflows.remove_execution(id).is_ok());

    orchestrator.stop().await;
}

fn slow_workflow() -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new("slow", "Slow");
    def.add_node(
        agent_node("slow")
            .with_config("timeout_seconds", json!(1))
            .with_config("max_retries", json!(1)),
    )
    .unwrap();
    def
}

async fn dispatched_once(connector: &ScriptedConnector) {
    for _ in 0..200 {
        if !connector.calls().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("agent never called");
}

#[tokio::test]
async fn test_cancel_execution_reaches_queued_retry() {
    let connector = Arc::new(ScriptedConnector::default().with("slow", Behavior::Hang));
    let orchestrator = Orchestrator::new(
        fast_config(vec![AgentSpec::new("worker", &[])]),
        connector.clone(),
    )
    .await
    .unwrap();
    // loops stay off; every pass is stepped by hand
    let workflows = orchestrator.workflows();
    let tasks = orchestrator.tasks();
    workflows.register_workflow(slow_workflow()).unwrap();

    let id = workflows.execute_workflow("slow", Payload::new()).unwrap();
    assert_eq!(workflows.process_executions(), 1);
    let exec = workflows.get_execution(id).unwrap();
    let original = exec.node_state("slow").unwrap().task_id.unwrap();
    assert_eq!(tasks.dispatch_pending(), 1);
    dispatched_once(&connector).await;

    let outcomes = tasks.check_timeouts(chrono::Utc::now() + chrono::Duration::seconds(5));
    assert_eq!(outcomes.len(), 1);
    let retry = outcomes[0].retry.unwrap();
    assert_eq!(exec.node_state("slow").unwrap().task_id, Some(retry));
    assert_eq!(exec.task_ids(), vec![retry]);
    assert_eq!(tasks.get_task_status(retry), Some(TaskStatus::Queued));

    workflows.cancel_execution(id).unwrap();
    assert_eq!(tasks.get_task_status(original), Some(TaskStatus::Timeout));
    assert_eq!(tasks.get_task_status(retry), Some(TaskStatus::Cancelled));
    assert_eq!(tasks.dispatch_pending(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.calls(), vec!["slow"]);
    assert_eq!(tasks.get_task_status(retry), Some(TaskStatus::Cancelled));
    assert_eq!(workflows.get_execution_status(id), Some(ExecutionStatus::Cancelled));
    assert_eq!(tasks.system_stats().pending_callbacks, 0);
}

#[tokio::test]
async fn test_no_retry_for_cancelled_execution() {
    let connector = Arc::new(ScriptedConnector::default().with("slow", Behavior::Hang));
    let orchestrator = Orchestrator::new(
        fast_config(vec![AgentSpec::new("worker", &[])]),
        connector.clone(),
    )
    .await
    .unwrap();
    let workflows = orchestrator.workflows();
    let tasks = orchestrator.tasks();
    workflows.register_workflow(slow_workflow()).unwrap();

    let id = workflows.execute_workflow("slow", Payload::new()).unwrap();
    assert_eq!(workflows.process_executions(), 1);
    let exec = workflows.get_execution(id).unwrap();
    let original = exec.node_state("slow").unwrap().task_id.unwrap();
    assert_eq!(tasks.dispatch_pending(), 1);
    dispatched_once(&connector).await;

    // running tasks cannot be cancelled, so only the execution stops here
    workflows.cancel_execution(id).unwrap();
    assert_eq!(tasks.get_task_status(original), Some(TaskStatus::Running));

    let outcomes = tasks.check_timeouts(chrono::Utc::now() + chrono::Duration::seconds(5));
    assert_eq!(
        outcomes,
        vec![TimeoutOutcome {
            expired: original,
            retry: None
        }]
    );
    assert_eq!(tasks.get_task_status(original), Some(TaskStatus::Timeout));
    assert!(tasks.tasks_by_status(TaskStatus::Queued).is_empty());
    assert_eq!(exec.task_ids(), vec![original]);
    assert_eq!(tasks.system_stats().pending_callbacks, 0);
    assert_eq!(tasks.registry().load("worker"), 0);
}

#[tokio::test]
async fn test_pause_holds_back_new_nodes() {
    let connector = Arc::new(ScriptedConnector::default());
    let orchestrator = Orchestrator::new(
        fast_config(vec![AgentSpec::new("worker", &[])]),
        connector.clone(),
    )
    .await
    .unwrap();
    // only the task loops run; the workflow driver is stepped by hand
    orchestrator.tasks().start();
    let workflows = orchestrator.workflows();

    let mut def = WorkflowDefinition::new("chain", "Chain");
    def.add_node(agent_node("first")).unwrap();
    def.add_node(agent_node("second")).unwrap();
    def.add_connection(WorkflowConnection::new("first", "second"))
        .unwrap();
    workflows.register_workflow(def).unwrap();

    let id = workflows.execute_workflow("chain", Payload::new()).unwrap();
    assert_eq!(workflows.process_executions(), 1);
    workflows.pause_execution(id).unwrap();

    let exec = workflows.get_execution(id).unwrap();
    for _ in 0..200 {
        if exec.node_state("first").unwrap().status == NodeStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // the in-flight result landed, but nothing new is handed out
    assert_eq!(exec.node_state("first").unwrap().status, NodeStatus::Completed);
    assert_eq!(workflows.process_executions(), 0);
    assert_eq!(connector.calls(), vec!["first"]);

    workflows.resume_execution(id).unwrap();
    assert_eq!(workflows.process_executions(), 1);
    let status = workflows
        .wait_for_completion(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_priority_and_dependencies_decide_dispatch_order() {
    let connector = Arc::new(ScriptedConnector::default());
    let config = OrchestratorConfig {
        max_tasks_per_agent: Some(1),
        ..fast_config(vec![AgentSpec::new("solo", &[])])
    };
    let orchestrator = Orchestrator::new(config, connector.clone()).await.unwrap();
    let tasks = orchestrator.tasks();

    let labelled = |label: &str| json!({ "label": label }).as_object().cloned().unwrap();
    let setup = tasks
        .submit(TaskRequest::new(labelled("setup")).with_priority(TaskPriority::Low))
        .unwrap();
    tasks
        .submit(
            TaskRequest::new(labelled("after-setup"))
                .with_priority(TaskPriority::Urgent)
                .with_dependencies(vec![setup]),
        )
        .unwrap();
    tasks
        .submit(TaskRequest::new(labelled("normal")).with_priority(TaskPriority::Normal))
        .unwrap();
    tasks
        .submit(TaskRequest::new(labelled("high")).with_priority(TaskPriority::High))
        .unwrap();

    for _ in 0..4 {
        assert_eq!(tasks.dispatch_pending(), 1);
        for _ in 0..200 {
            if tasks.registry().load("solo") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    assert_eq!(
        connector.calls(),
        vec!["high", "normal", "setup", "after-setup"]
    );
    assert_eq!(tasks.system_stats().queue.completed_tasks, 4);
}

#[tokio::test]
async fn test_registering_cyclic_workflow_fails() {
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(LoopbackConnector::new()),
    )
    .await
    .unwrap();
    let mut def = WorkflowDefinition::new("loop", "Loop");
    def.add_node(agent_node("a")).unwrap();
    def.add_node(agent_node("b")).unwrap();
    def.add_connection(WorkflowConnection::new("a", "b")).unwrap();
    def.add_connection(WorkflowConnection::new("b", "a")).unwrap();

    let err = orchestrator.workflows().register_workflow(def).unwrap_err();
    assert!(err.to_string().contains("cycle"));
    assert!(orchestrator.workflows().get_workflow("loop").is_none());
}
