//! The sample config and workflow shipped under `demos/` must stay loadable
//! and runnable.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use maestro_orchestrator::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../demos")
        .join(name)
}

#[test]
fn test_demo_config_loads() {
    let config = OrchestratorConfig::load(&demo("maestro.toml")).unwrap();
    assert_eq!(config.agents.len(), 2);
    assert_eq!(config.default_max_retries, 2);
}

#[test]
fn test_demo_workflow_is_valid() {
    let def = WorkflowDefinition::load(&demo("research.toml")).unwrap();
    assert!(check_workflow(&def).is_empty());
    assert_eq!(def.entry_nodes(), vec!["search"]);
    assert_eq!(def.previous_nodes("mark_stage"), vec!["summarize", "enough_sources"]);
}

#[tokio::test]
async fn test_demo_workflow_runs_to_completion() {
    let mut config = OrchestratorConfig::load(&demo("maestro.toml")).unwrap();
    config.dispatch_interval_ms = 10;
    config.workflow_poll_interval_ms = 10;
    let orchestrator = Orchestrator::new(config, Arc::new(LoopbackConnector::new()))
        .await
        .unwrap();
    orchestrator.start();

    let workflows = orchestrator.workflows();
    workflows
        .register_workflow(WorkflowDefinition::load(&demo("research.toml")).unwrap())
        .unwrap();
    let id = workflows.execute_workflow("research", Payload::new()).unwrap();
    let status = workflows
        .wait_for_completion(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    let exec = workflows.get_execution(id).unwrap();
    assert_eq!(exec.context()["stage"], "drafting");
    assert_eq!(
        exec.node_result("enough_sources").unwrap()["condition_result"],
        true
    );
    assert_eq!(exec.node_result("draft").unwrap()["agent_id"], "writer");

    orchestrator.stop().await;
}
