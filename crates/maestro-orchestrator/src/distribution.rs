use crate::agent::{AgentConnector, TaskDescriptor};
use crate::config::OrchestratorConfig;
use crate::registry::{AgentLoad, AgentRegistry};
use crate::task_queue::{QueueStats, TaskQueue};
use crate::types::{Payload, Task, TaskId, TaskPriority, TaskStatus};
use chrono::{DateTime, Utc};
use maestro_core::MaestroResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Invoked once when a task reaches a final state. A task that times out
/// and is retried hands its callback to the retry instead.
pub type TaskCallback = Box<dyn FnOnce(&Task) + Send + 'static>;

/// Consulted when a timed-out task is about to be replaced, with the id the
/// retry will carry. Returning `false` drops the retry and the task finishes
/// as timed out.
pub type RetryHook = Box<dyn FnMut(TaskId) -> bool + Send + 'static>;

struct TaskHooks {
    on_finish: Option<TaskCallback>,
    on_retry: Option<RetryHook>,
}

/// Everything a submitter can say about a new task.
pub struct TaskRequest {
    pub id: Option<TaskId>,
    pub payload: Payload,
    pub agent_id: Option<String>,
    pub priority: TaskPriority,
    /// Falls back to the engine's configured default.
    pub timeout_secs: Option<u64>,
    /// Falls back to the engine's configured default.
    pub max_retries: Option<u32>,
    pub dependencies: Vec<TaskId>,
    pub callback: Option<TaskCallback>,
    pub retry_hook: Option<RetryHook>,
}

impl TaskRequest {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: None,
            payload,
            agent_id: None,
            priority: TaskPriority::Normal,
            timeout_secs: None,
            max_retries: None,
            dependencies: Vec::new(),
            callback: None,
            retry_hook: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
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
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn on_finish(mut self, callback: impl FnOnce(&Task) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn on_retry(mut self, hook: impl FnMut(TaskId) -> bool + Send + 'static) -> Self {
        self.retry_hook = Some(Box::new(hook));
        self
    }
}

/// Result of one expired task found by a timeout scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutOutcome {
    pub expired: TaskId,
    /// The replacement task, if the retry budget allowed one.
    pub retry: Option<TaskId>,
}

/// Aggregate view of the queue and the agent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub queue: QueueStats,
    pub registered_agents: usize,
    pub agents: Vec<AgentLoad>,
    pub pending_callbacks: usize,
    pub in_flight_calls: usize,
}

/// Binds queued tasks to capable agents and drives them to a final state.
///
/// Two background loops run once [`start`](Self::start) is called: a
/// dispatcher that drains the ready queue whenever a task is submitted or
/// finishes, and a timeout monitor that sleeps until the earliest running
/// deadline. Both also wake on a bounded interval.
pub struct TaskDistributionEngine {
    queue: Mutex<TaskQueue>,
    registry: AgentRegistry,
    connector: Arc<dyn AgentConnector>,
    callbacks: Mutex<HashMap<TaskId, TaskHooks>>,
    deadlines: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, TaskId)>>>,
    in_flight: Mutex<HashMap<TaskId, AbortHandle>>,
    dispatch_signal: Notify,
    deadline_signal: Notify,
    config: OrchestratorConfig,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskDistributionEngine {
    pub fn new(config: OrchestratorConfig, connector: Arc<dyn AgentConnector>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue: Mutex::new(TaskQueue::new()),
            registry: AgentRegistry::new(config.max_tasks_per_agent),
            connector,
            callbacks: Mutex::new(HashMap::new()),
            deadlines: Mutex::new(BinaryHeap::new()),
            in_flight: Mutex::new(HashMap::new()),
            dispatch_signal: Notify::new(),
            deadline_signal: Notify::new(),
            config,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Get a reference to the agent registry.
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn connector(&self) -> &Arc<dyn AgentConnector> {
        &self.connector
    }

    pub fn register_agent_capabilities(&self, agent_id: &str, capabilities: Vec<String>) {
        self.registry.register(agent_id, capabilities);
        self.dispatch_signal.notify_one();
    }

    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        self.registry.unregister(agent_id)
    }

    /// Queue a task and return its id without waiting for dispatch.
    pub fn submit_task(
        &self,
        payload: Payload,
        agent_id: Option<String>,
        priority: TaskPriority,
        timeout_secs: u64,
        dependencies: Vec<TaskId>,
    ) -> MaestroResult<TaskId> {
        let mut request = TaskRequest::new(payload)
            .with_priority(priority)
            .with_timeout(timeout_secs)
            .with_dependencies(dependencies);
        request.agent_id = agent_id;
        self.submit(request)
    }

    /// Queue a task described by a [`TaskRequest`].
    pub fn submit(&self, request: TaskRequest) -> MaestroResult<TaskId> {
        let mut task = Task::new(request.payload)
            .with_priority(request.priority)
            .with_timeout(request.timeout_secs.unwrap_or(self.config.default_timeout_secs))
            .with_max_retries(request.max_retries.unwrap_or(self.config.default_max_retries))
            .with_dependencies(request.dependencies);
        if let Some(id) = request.id {
            task = task.with_id(id);
        }
        task.agent_id = request.agent_id;

        let priority = task.priority;
        let id = {
            let mut queue = self.queue.lock();
            let id = queue.add(task)?;
            // registered under the queue lock so a fast completion cannot miss it
            if request.callback.is_some() || request.retry_hook.is_some() {
                let hooks = TaskHooks {
                    on_finish: request.callback,
                    on_retry: request.retry_hook,
                };
                self.callbacks.lock().insert(id, hooks);
            }
            id
        };

        info!(task_id = %id, priority = %priority, "Task submitted");
        self.dispatch_signal.notify_one();
        Ok(id)
    }

    pub fn get_task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.queue.lock().get(id).map(|t| t.status)
    }

    /// The result of a completed task. `None` for any other state.
    pub fn get_task_result(&self, id: TaskId) -> Option<serde_json::Value> {
        let queue = self.queue.lock();
        queue
            .get(id)
            .filter(|t| t.status == TaskStatus::Completed)
            .and_then(|t| t.result.clone())
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.queue.lock().get(id).cloned()
    }

    /// Tasks pinned or dispatched to an agent.
    pub fn agent_tasks(&self, agent_id: &str) -> Vec<Task> {
        self.queue
            .lock()
            .tasks_by_agent(agent_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.queue
            .lock()
            .tasks_by_status(status)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Cancel a task that has not been dispatched yet.
    pub fn cancel_task(&self, id: TaskId) -> MaestroResult<()> {
        let task = {
            let mut queue = self.queue.lock();
            queue.cancel(id)?;
            queue.get(id).cloned()
        };
        info!(task_id = %id, "Task cancelled");
        if let Some(task) = task {
            self.fire_callback(&task);
        }
        Ok(())
    }

    /// One scheduling pass over the ready queue. Tasks without a capable,
    /// available agent stay queued for the next pass. Returns how many
    /// tasks were dispatched.
    pub fn dispatch_pending(self: &Arc<Self>) -> usize {
        let candidates: Vec<(TaskId, Option<String>, Vec<String>)> = self
            .queue
            .lock()
            .ready_tasks()
            .into_iter()
            .map(|t| (t.id, t.agent_id.clone(), t.required_capabilities()))
            .collect();

        let mut dispatched = 0;
        for (id, pinned, required) in candidates {
            let agent = match pinned {
                Some(agent) if self.registry.has_capacity(&agent) => agent,
                Some(agent) => {
                    debug!(
                        task_id = %id,
                        agent = %agent,
                        "Pinned agent unavailable, task stays queued"
                    );
                    continue;
                }
                None => match self.registry.find_suitable_agent(&required) {
                    Some(agent) => agent,
                    None => {
                        debug!(
                            task_id = %id,
                            required = ?required,
                            "No suitable agent, task stays queued"
                        );
                        continue;
                    }
                },
            };
            if self.dispatch(id, agent) {
                dispatched += 1;
            }
        }
        dispatched
    }

    fn dispatch(self: &Arc<Self>, id: TaskId, agent: String) -> bool {
        let descriptor = {
            let mut queue = self.queue.lock();
            if let Err(e) = queue.mark_running(id, Some(&agent)) {
                debug!(task_id = %id, error = %e, "Dispatch skipped");
                return false;
            }
            let Some(task) = queue.get(id) else {
                return false;
            };
            if let Some(deadline) = task.deadline() {
                self.deadlines.lock().push(Reverse((deadline, id)));
                self.deadline_signal.notify_one();
            }
            TaskDescriptor::from(task)
        };
        self.registry.increment(&agent);
        info!(task_id = %id, agent = %agent, "Task dispatched");

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = engine.connector.execute_task(&agent, descriptor).await;
            engine.in_flight.lock().remove(&id);
            let reported = match outcome {
                Ok(result) => engine.complete_task(id, result),
                Err(e) => engine.fail_task(id, e.to_string()),
            };
            if let Err(e) = reported {
                debug!(task_id = %id, error = %e, "Late agent result ignored");
            }
        });

        self.in_flight.lock().insert(id, handle.abort_handle());
        if self.get_task_status(id) != Some(TaskStatus::Running) {
            // finished before the handle was recorded
            self.in_flight.lock().remove(&id);
        }
        true
    }

    /// Record a successful result for a running task.
    pub fn complete_task(&self, id: TaskId, result: serde_json::Value) -> MaestroResult<()> {
        let task = {
            let mut queue = self.queue.lock();
            queue.mark_completed(id, Some(result))?;
            queue.get(id).cloned()
        };
        let Some(task) = task else {
            return Ok(());
        };
        self.release(&task);
        info!(task_id = %id, execution_ms = ?task.execution_time_ms, "Task completed");
        self.dispatch_signal.notify_one();
        self.fire_callback(&task);
        Ok(())
    }

    /// Record a failure reported for a running task.
    pub fn fail_task(&self, id: TaskId, error: impl Into<String>) -> MaestroResult<()> {
        let error = error.into();
        let task = {
            let mut queue = self.queue.lock();
            queue.mark_failed(id, error.clone())?;
            queue.get(id).cloned()
        };
        let Some(task) = task else {
            return Ok(());
        };
        self.release(&task);
        error!(task_id = %id, error = %error, "Task failed");
        self.dispatch_signal.notify_one();
        self.fire_callback(&task);
        Ok(())
    }

    /// Expire every running task whose deadline passed before `now`,
    /// queueing a retry where the budget allows.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<TimeoutOutcome> {
        let due: Vec<TaskId> = {
            let mut deadlines = self.deadlines.lock();
            let mut due = Vec::new();
            while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
                if deadline >= now {
                    break;
                }
                deadlines.pop();
                due.push(id);
            }
            due
        };

        let mut outcomes = Vec::new();
        for id in due {
            let (task, retry) = {
                let mut queue = self.queue.lock();
                // stale entry: finished before its deadline
                if !queue.get(id).is_some_and(|t| t.is_expired(now)) {
                    continue;
                }
                if queue.mark_timed_out(id).is_err() {
                    continue;
                }
                let Some(task) = queue.get(id).cloned() else {
                    continue;
                };
                let retry = if task.can_retry() {
                    let retry = task.retry();
                    let mut callbacks = self.callbacks.lock();
                    let wanted = match callbacks.get_mut(&id).and_then(|h| h.on_retry.as_mut()) {
                        Some(hook) => hook(retry.id),
                        None => true,
                    };
                    if !wanted {
                        debug!(task_id = %id, "Retry declined by submitter");
                        None
                    } else {
                        match queue.add(retry) {
                            Ok(retry_id) => {
                                if let Some(hooks) = callbacks.remove(&id) {
                                    callbacks.insert(retry_id, hooks);
                                }
                                Some(retry_id)
                            }
                            Err(e) => {
                                error!(task_id = %id, error = %e, "Failed to queue retry");
                                None
                            }
                        }
                    }
                } else {
                    None
                };
                (task, retry)
            };

            if let Some(handle) = self.in_flight.lock().remove(&id) {
                handle.abort();
            }
            self.release(&task);

            match retry {
                Some(retry_id) => warn!(
                    task_id = %id,
                    retry_id = %retry_id,
                    attempt = task.retry_count + 1,
                    "Task timed out, retrying"
                ),
                None => {
                    warn!(
                        task_id = %id,
                        retries = task.retry_count,
                        "Task timed out, no retry queued"
                    );
                    self.fire_callback(&task);
                }
            }
            outcomes.push(TimeoutOutcome { expired: id, retry });
        }

        if outcomes.iter().any(|o| o.retry.is_some()) {
            self.dispatch_signal.notify_one();
        }
        outcomes
    }

    pub fn system_stats(&self) -> SystemStats {
        SystemStats {
            queue: self.queue.lock().stats(),
            registered_agents: self.registry.agent_count(),
            agents: self.registry.snapshot(),
            pending_callbacks: self.callbacks.lock().len(),
            in_flight_calls: self.in_flight.lock().len(),
        }
    }

    /// Spawn the dispatcher and timeout monitor. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            let interval = engine.config.dispatch_interval();
            loop {
                engine.dispatch_pending();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = engine.dispatch_signal.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Dispatch loop stopped");
        }));

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            let max_wait = engine.config.timeout_scan_interval();
            loop {
                let wait = engine.next_deadline_wait().unwrap_or(max_wait).min(max_wait);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = engine.deadline_signal.notified() => {}
                    _ = shutdown.changed() => break,
                }
                engine.check_timeouts(Utc::now());
            }
            debug!("Timeout monitor stopped");
        }));

        info!("Task distribution engine started");
    }

    /// Stop the background loops. In-flight agent calls are left to finish.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Engine loop ended abnormally");
            }
        }
        info!("Task distribution engine stopped");
    }

    fn next_deadline_wait(&self) -> Option<Duration> {
        let Reverse((deadline, _)) = self.deadlines.lock().peek().copied()?;
        // expiry is strict, so wake just past the deadline
        let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
        Some(wait + Duration::from_millis(1))
    }

    fn release(&self, task: &Task) {
        if let Some(agent) = &task.assigned_agent {
            self.registry.decrement(agent);
        }
    }

    fn fire_callback(&self, task: &Task) {
        let hooks = self.callbacks.lock().remove(&task.id);
        if let Some(callback) = hooks.and_then(|h| h.on_finish) {
            callback(task);
        }
    }
}
