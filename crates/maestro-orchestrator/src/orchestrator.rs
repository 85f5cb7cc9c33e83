use crate::agent::{AgentConnector, AgentSpec};
use crate::config::OrchestratorConfig;
use crate::distribution::TaskDistributionEngine;
use crate::workflow_engine::WorkflowEngine;
use maestro_core::MaestroResult;
use std::sync::Arc;
use tracing::info;

/// Composition root: owns both engines and the agents behind the connector.
pub struct Orchestrator {
    config: OrchestratorConfig,
    tasks: Arc<TaskDistributionEngine>,
    workflows: Arc<WorkflowEngine>,
}

impl Orchestrator {
    /// Wire the engines and bring up every agent declared in the config.
    pub async fn new(
        config: OrchestratorConfig,
        connector: Arc<dyn AgentConnector>,
    ) -> MaestroResult<Self> {
        config.validate()?;
        let tasks = Arc::new(TaskDistributionEngine::new(config.clone(), connector));
        let workflows = Arc::new(WorkflowEngine::new(
            Arc::clone(&tasks),
            config.workflow_poll_interval(),
        ));

        let orchestrator = Self {
            config,
            tasks,
            workflows,
        };
        for spec in orchestrator.config.agents.clone() {
            orchestrator.add_agent(spec).await?;
        }
        Ok(orchestrator)
    }

    /// Create and start an agent on the connector, then make it schedulable.
    pub async fn add_agent(&self, spec: AgentSpec) -> MaestroResult<()> {
        let connector = self.tasks.connector();
        let agent_id = connector.create_agent(spec.clone()).await?;
        connector.start_agent(&agent_id).await?;
        self.tasks
            .register_agent_capabilities(&agent_id, spec.capabilities);
        info!(agent = %agent_id, framework = %connector.framework(), "Agent ready");
        Ok(())
    }

    /// Unschedule an agent and stop it on the connector.
    pub async fn remove_agent(&self, agent_id: &str) -> MaestroResult<()> {
        self.tasks.unregister_agent(agent_id);
        let connector = self.tasks.connector();
        connector.stop_agent(agent_id).await?;
        connector.delete_agent(agent_id).await
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tasks(&self) -> &Arc<TaskDistributionEngine> {
        &self.tasks
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn start(&self) {
        self.tasks.start();
        self.workflows.start();
    }

    pub async fn stop(&self) {
        self.workflows.stop().await;
        self.tasks.stop().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::{AgentStatus, LoopbackConnector};

    #[tokio::test]
    async fn test_configured_agents_are_started_and_registered() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [[agents]]
            id = "researcher"
            capabilities = ["search"]
            "#,
        )
        .unwrap();
        let connector = Arc::new(LoopbackConnector::new());
        let orchestrator = Orchestrator::new(config, connector.clone()).await.unwrap();

        assert_eq!(
            connector.agent_status("researcher").await.unwrap(),
            AgentStatus::Active
        );
        assert_eq!(
            orchestrator.tasks().registry().capabilities("researcher").unwrap(),
            vec!["search"]
        );

        orchestrator.remove_agent("researcher").await.unwrap();
        assert!(!orchestrator.tasks().registry().is_registered("researcher"));
        assert!(connector.agent_status("researcher").await.is_err());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(LoopbackConnector::new()),
        )
        .await
        .unwrap();
        orchestrator.start();
        orchestrator.start();
        orchestrator.stop().await;
    }
}
