use crate::definition::WorkflowDefinition;
use crate::distribution::TaskDistributionEngine;
use crate::execution::{ExecutionProgress, ExecutionStatus, WorkflowExecution};
use crate::handlers::{NodeHandler, NodeOutcome};
use crate::types::Payload;
use maestro_core::{MaestroError, MaestroResult, ValidationError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Handlers = Arc<HashMap<String, NodeHandler>>;

struct RegisteredWorkflow {
    definition: Arc<WorkflowDefinition>,
    handlers: Handlers,
}

struct ExecutionEntry {
    execution: Arc<WorkflowExecution>,
    handlers: Handlers,
}

/// Registers workflow definitions and drives their executions.
///
/// The driver invokes each running node's handler exactly once. Synchronous
/// handlers complete the node on the spot; agent nodes complete later, when
/// their task's callback fires and wakes the driver again.
pub struct WorkflowEngine {
    tasks: Arc<TaskDistributionEngine>,
    workflows: RwLock<HashMap<String, RegisteredWorkflow>>,
    executions: RwLock<HashMap<Uuid, ExecutionEntry>>,
    wake: Arc<Notify>,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn new(tasks: Arc<TaskDistributionEngine>, poll_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks,
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            wake: Arc::new(Notify::new()),
            poll_interval,
            shutdown,
            worker: Mutex::new(None),
        }
    }

    pub fn tasks(&self) -> &Arc<TaskDistributionEngine> {
        &self.tasks
    }

    /// Validate the graph and every node's config, then make the workflow
    /// available under its id. Registering an id again replaces the
    /// definition for future executions only.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> MaestroResult<()> {
        let mut errors = definition.validate();
        let mut handlers = HashMap::new();
        for node in definition.nodes() {
            match NodeHandler::build(node) {
                Ok(handler) => {
                    handlers.insert(node.id.clone(), handler);
                }
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            warn!(workflow = %definition.id, errors = errors.len(), "Workflow rejected");
            return Err(MaestroError::Validation(errors));
        }

        info!(
            workflow = %definition.id,
            nodes = definition.node_count(),
            connections = definition.connections().len(),
            "Workflow registered"
        );
        let id = definition.id.clone();
        self.workflows.write().insert(
            id,
            RegisteredWorkflow {
                definition: Arc::new(definition),
                handlers: Arc::new(handlers),
            },
        );
        Ok(())
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .get(workflow_id)
            .map(|w| Arc::clone(&w.definition))
    }

    /// Registered workflow ids, sorted.
    pub fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a new execution and return its id without waiting for it.
    pub fn execute_workflow(&self, workflow_id: &str, input: Payload) -> MaestroResult<Uuid> {
        let (definition, handlers) = {
            let workflows = self.workflows.read();
            let registered = workflows
                .get(workflow_id)
                .ok_or_else(|| MaestroError::WorkflowNotFound(workflow_id.to_string()))?;
            (
                Arc::clone(&registered.definition),
                Arc::clone(&registered.handlers),
            )
        };

        let execution = Arc::new(WorkflowExecution::new(definition, input));
        execution.start()?;
        let id = execution.id();
        self.executions
            .write()
            .insert(id, ExecutionEntry { execution, handlers });
        self.wake.notify_one();
        Ok(id)
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Option<Arc<WorkflowExecution>> {
        self.executions
            .read()
            .get(&execution_id)
            .map(|e| Arc::clone(&e.execution))
    }

    pub fn get_execution_status(&self, execution_id: Uuid) -> Option<ExecutionStatus> {
        self.get_execution(execution_id).map(|e| e.status())
    }

    pub fn get_execution_progress(&self, execution_id: Uuid) -> Option<ExecutionProgress> {
        self.get_execution(execution_id).map(|e| e.progress())
    }

    pub fn execution_ids(&self) -> Vec<Uuid> {
        self.executions.read().keys().copied().collect()
    }

    pub fn pause_execution(&self, execution_id: Uuid) -> MaestroResult<()> {
        self.require(execution_id)?.pause()
    }

    pub fn resume_execution(&self, execution_id: Uuid) -> MaestroResult<()> {
        self.require(execution_id)?.resume()?;
        self.wake.notify_one();
        Ok(())
    }

    /// Cancel the execution and any of its agent tasks still waiting in the
    /// queue. Tasks already running are left to finish; their results are
    /// ignored.
    pub fn cancel_execution(&self, execution_id: Uuid) -> MaestroResult<()> {
        let execution = self.require(execution_id)?;
        execution.cancel()?;
        for task_id in execution.task_ids() {
            if self.tasks.cancel_task(task_id).is_ok() {
                debug!(
                    execution_id = %execution_id,
                    task_id = %task_id,
                    "Cancelled queued agent task"
                );
            }
        }
        Ok(())
    }

    /// Drop a finished execution. Live executions cannot be removed.
    pub fn remove_execution(&self, execution_id: Uuid) -> MaestroResult<Arc<WorkflowExecution>> {
        let mut executions = self.executions.write();
        let entry = executions
            .get(&execution_id)
            .ok_or(MaestroError::ExecutionNotFound(execution_id))?;
        let status = entry.execution.status();
        if !status.is_terminal() {
            return Err(MaestroError::CancellationRejected(format!(
                "execution {execution_id} is still {status}"
            )));
        }
        executions
            .remove(&execution_id)
            .map(|e| e.execution)
            .ok_or(MaestroError::ExecutionNotFound(execution_id))
    }

    /// Wait until the execution ends or `timeout` elapses, returning the
    /// status at that point.
    pub async fn wait_for_completion(
        &self,
        execution_id: Uuid,
        timeout: Duration,
    ) -> MaestroResult<ExecutionStatus> {
        let execution = self.require(execution_id)?;
        match tokio::time::timeout(timeout, execution.wait_terminal()).await {
            Ok(status) => Ok(status),
            Err(_) => Ok(execution.status()),
        }
    }

    /// One driver pass: invoke the handler of every running node not yet
    /// handled, in every running execution. Returns the number of handlers
    /// invoked.
    pub fn process_executions(&self) -> usize {
        let live: Vec<(Arc<WorkflowExecution>, Handlers)> = self
            .executions
            .read()
            .values()
            .filter(|e| e.execution.status() == ExecutionStatus::Running)
            .map(|e| (Arc::clone(&e.execution), Arc::clone(&e.handlers)))
            .collect();

        let mut invoked = 0;
        for (execution, handlers) in live {
            // synchronous handlers can activate successors, so keep claiming
            loop {
                let claimed = execution.claim_runnable();
                if claimed.is_empty() {
                    break;
                }
                for node_id in claimed {
                    invoked += 1;
                    self.run_node(&execution, &handlers, &node_id);
                }
            }
        }
        invoked
    }

    fn run_node(&self, execution: &Arc<WorkflowExecution>, handlers: &Handlers, node_id: &str) {
        let (Some(node), Some(handler)) =
            (execution.definition().node(node_id), handlers.get(node_id))
        else {
            execution.fail_node(node_id, format!("No handler for node {node_id}"));
            return;
        };

        debug!(execution_id = %execution.id(), node = %node_id, kind = %node.kind, "Running node");
        match handler.run(node, execution, &self.tasks, &self.wake) {
            Ok(NodeOutcome::Completed(result)) => {
                execution.complete_node(node_id, result);
            }
            Ok(NodeOutcome::Pending) => {}
            Err(error) => {
                execution.fail_node(node_id, error);
            }
        }
    }

    /// Spawn the driver loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.shutdown.send_replace(false);

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *worker = Some(tokio::spawn(async move {
            loop {
                engine.process_executions();
                tokio::select! {
                    _ = tokio::time::sleep(engine.poll_interval) => {}
                    _ = engine.wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Workflow driver stopped");
        }));
        info!("Workflow engine started");
    }

    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Workflow driver ended abnormally");
            }
        }
        info!("Workflow engine stopped");
    }

    fn require(&self, execution_id: Uuid) -> MaestroResult<Arc<WorkflowExecution>> {
        self.get_execution(execution_id)
            .ok_or(MaestroError::ExecutionNotFound(execution_id))
    }
}

/// Validate a definition the same way registration does, without
/// registering it.
pub fn check_workflow(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = definition.validate();
    errors.extend(
        definition
            .nodes()
            .filter_map(|node| NodeHandler::build(node).err()),
    );
    errors
}
