//! Dependency-gated task distribution and DAG workflow execution.
//!
//! Tasks wait in a priority queue until their dependencies complete, then
//! go to the least-loaded agent whose capabilities cover them. Workflows are
//! validated graphs of typed nodes; agent nodes become tasks, the others
//! run in-process.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Composition root wiring both engines and the configured agents.
//! - [`TaskDistributionEngine`]: Capability matching, load balancing, timeouts and retries.
//! - [`TaskQueue`]: Priority store with a blocked index for unmet dependencies.
//! - [`WorkflowEngine`]: Registers workflow definitions and drives their executions.
//! - [`WorkflowDefinition`]: Nodes, connections and structural validation.
//! - [`AgentConnector`]: Boundary to whatever actually runs agents.

/// Agent execution interface and the in-process loopback connector.
pub mod agent;
/// Restricted predicate language for condition nodes.
pub mod condition;
/// Engine configuration loaded from TOML.
pub mod config;
/// Workflow graph structure and validation.
pub mod definition;
/// Task distribution engine and its background loops.
pub mod distribution;
/// Live workflow executions.
pub mod execution;
/// Per-kind node handlers.
pub mod handlers;
/// Composition root.
pub mod orchestrator;
/// Agent capability and load registry.
pub mod registry;
/// Dependency-gated priority task queue.
pub mod task_queue;
/// Task model shared by the queue and the engines.
pub mod types;
/// Workflow registration and the execution driver.
pub mod workflow_engine;

pub use agent::{AgentConnector, AgentSpec, AgentStatus, LoopbackConnector, TaskDescriptor};
pub use condition::Condition;
pub use config::OrchestratorConfig;
pub use definition::{NodeKind, WorkflowConnection, WorkflowDefinition, WorkflowNode};
pub use distribution::{
    RetryHook, SystemStats, TaskCallback, TaskDistributionEngine, TaskRequest, TimeoutOutcome,
};
pub use execution::{
    ExecutionProgress, ExecutionSnapshot, ExecutionStatus, NodeRun, NodeStatus, WorkflowExecution,
};
pub use handlers::{NodeHandler, NodeOutcome};
pub use orchestrator::Orchestrator;
pub use registry::{AgentLoad, AgentRegistry};
pub use task_queue::{QueueStats, TaskQueue};
pub use types::{Payload, Task, TaskId, TaskPriority, TaskStatus};
pub use workflow_engine::{check_workflow, WorkflowEngine};
