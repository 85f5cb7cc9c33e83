use crate::types::{Task, TaskId, TaskPriority, TaskStatus};
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Position of a task in the ready ordering: higher priority first, then
/// creation time, then admission order, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<TaskPriority>,
    created_at: DateTime<Utc>,
    seq: u64,
    id: TaskId,
}

/// Counters describing the queue contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_tasks: usize,
    /// Queued tasks whose dependencies are all complete.
    pub ready_tasks: usize,
    /// Queued tasks still waiting on at least one dependency.
    pub blocked_tasks: usize,
    pub completed_tasks: usize,
    pub status_breakdown: BTreeMap<String, usize>,
    /// Ready depth of each per-agent sub-queue.
    pub agent_queues: BTreeMap<String, usize>,
}

/// A priority task queue with dependency gating.
///
/// Ready tasks live in an ordered set. A task admitted with unmet
/// dependencies is parked in a blocked index keyed by each missing
/// dependency and is promoted into the ready set the moment its last
/// dependency completes, so nothing is ever dropped or rescanned.
pub struct TaskQueue {
    tasks: HashMap<TaskId, Task>,
    keys: HashMap<TaskId, QueueKey>,
    ready: BTreeSet<QueueKey>,
    agent_ready: HashMap<String, BTreeSet<QueueKey>>,
    /// dependency id -> tasks waiting on it
    waiting_on: HashMap<TaskId, Vec<TaskId>>,
    /// blocked task id -> number of dependencies not yet completed
    unmet: HashMap<TaskId, usize>,
    completed: HashSet<TaskId>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            keys: HashMap::new(),
            ready: BTreeSet::new(),
            agent_ready: HashMap::new(),
            waiting_on: HashMap::new(),
            unmet: HashMap::new(),
            completed: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Admit a task. Rejects an id that is already known and leaves the
    /// queue untouched in that case.
    pub fn add(&mut self, mut task: Task) -> MaestroResult<TaskId> {
        let id = task.id;
        if self.tasks.contains_key(&id) {
            return Err(MaestroError::DuplicateTask(id));
        }

        task.status = TaskStatus::Queued;
        task.queued_at = Some(Utc::now());

        let key = QueueKey {
            priority: Reverse(task.priority),
            created_at: task.created_at,
            seq: self.next_seq,
            id,
        };
        self.next_seq += 1;
        self.keys.insert(id, key);

        let missing: Vec<TaskId> = task
            .dependencies
            .iter()
            .filter(|dep| !self.completed.contains(dep))
            .copied()
            .collect();

        if missing.is_empty() {
            self.insert_ready(key, task.agent_id.as_deref());
        } else {
            debug!(task_id = %id, blocked_on = missing.len(), "Task blocked on dependencies");
            self.unmet.insert(id, missing.len());
            for dep in missing {
                self.waiting_on.entry(dep).or_default().push(id);
            }
        }

        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Highest-priority ready task. With `agent_id`, only tasks pinned to
    /// that agent are considered. The task stays queued until
    /// [`mark_running`](Self::mark_running) is called.
    pub fn next_task(&self, agent_id: Option<&str>) -> Option<&Task> {
        let key = match agent_id {
            Some(agent) => self.agent_ready.get(agent)?.first()?,
            None => self.ready.first()?,
        };
        self.tasks.get(&key.id)
    }

    /// Every ready task in dispatch order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.ready
            .iter()
            .filter_map(|key| self.tasks.get(&key.id))
            .collect()
    }

    /// QUEUED -> RUNNING. `agent_id` records where the task was dispatched;
    /// it defaults to the pinned agent.
    pub fn mark_running(&mut self, id: TaskId, agent_id: Option<&str>) -> MaestroResult<()> {
        let task = self.tasks.get(&id).ok_or(MaestroError::TaskNotFound(id))?;
        if task.status != TaskStatus::Queued || !task.dependencies_met(&self.completed) {
            return Err(invalid_transition(task, TaskStatus::Running));
        }
        self.remove_ready(id);

        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.assigned_agent = agent_id.map(str::to_string).or_else(|| task.agent_id.clone());
        }
        Ok(())
    }

    /// RUNNING -> COMPLETED. Promotes every task whose last unmet dependency
    /// was this one.
    pub fn mark_completed(
        &mut self,
        id: TaskId,
        result: Option<serde_json::Value>,
    ) -> MaestroResult<()> {
        let task = self.tasks.get_mut(&id).ok_or(MaestroError::TaskNotFound(id))?;
        if task.status != TaskStatus::Running {
            return Err(invalid_transition(task, TaskStatus::Completed));
        }
        task.status = TaskStatus::Completed;
        task.result = result;
        stamp_finished(task);

        self.completed.insert(id);
        self.promote_waiters(id);
        Ok(())
    }

    /// RUNNING -> FAILED.
    pub fn mark_failed(&mut self, id: TaskId, error: impl Into<String>) -> MaestroResult<()> {
        let task = self.tasks.get_mut(&id).ok_or(MaestroError::TaskNotFound(id))?;
        if task.status != TaskStatus::Running {
            return Err(invalid_transition(task, TaskStatus::Failed));
        }
        task.status = TaskStatus::Failed;
        task.error = Some(error.into());
        stamp_finished(task);
        Ok(())
    }

    /// RUNNING -> TIMEOUT.
    pub fn mark_timed_out(&mut self, id: TaskId) -> MaestroResult<()> {
        let task = self.tasks.get_mut(&id).ok_or(MaestroError::TaskNotFound(id))?;
        if task.status != TaskStatus::Running {
            return Err(invalid_transition(task, TaskStatus::Timeout));
        }
        task.status = TaskStatus::Timeout;
        task.error = Some(format!("timed out after {}s", task.timeout_secs));
        stamp_finished(task);
        Ok(())
    }

    /// PENDING/QUEUED -> CANCELLED. A cancelled task never becomes ready.
    pub fn cancel(&mut self, id: TaskId) -> MaestroResult<()> {
        let task = self.tasks.get(&id).ok_or(MaestroError::TaskNotFound(id))?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Queued) {
            return Err(MaestroError::CancellationRejected(format!(
                "task {id} is {}",
                task.status
            )));
        }
        self.remove_ready(id);
        self.unmet.remove(&id);

        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn is_completed(&self, id: TaskId) -> bool {
        self.completed.contains(&id)
    }

    /// Tasks in the given state, oldest first.
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.sorted(|t| t.status == status)
    }

    /// Tasks pinned or dispatched to the given agent, oldest first.
    pub fn tasks_by_agent(&self, agent_id: &str) -> Vec<&Task> {
        self.sorted(|t| {
            t.agent_id.as_deref() == Some(agent_id) || t.assigned_agent.as_deref() == Some(agent_id)
        })
    }

    /// List all tasks.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.sorted(|_| true)
    }

    /// Queued or running tasks.
    pub fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Running))
            .count()
    }

    /// Total number of tasks.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn stats(&self) -> QueueStats {
        let mut status_breakdown = BTreeMap::new();
        for task in self.tasks.values() {
            *status_breakdown.entry(task.status.to_string()).or_insert(0) += 1;
        }
        QueueStats {
            total_tasks: self.tasks.len(),
            ready_tasks: self.ready.len(),
            blocked_tasks: self.unmet.len(),
            completed_tasks: self.completed.len(),
            status_breakdown,
            agent_queues: self
                .agent_ready
                .iter()
                .map(|(agent, keys)| (agent.clone(), keys.len()))
                .collect(),
        }
    }

    fn sorted(&self, keep: impl Fn(&Task) -> bool) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().filter(|t| keep(t)).collect();
        tasks.sort_by_key(|t| (t.created_at, self.keys.get(&t.id).map(|k| k.seq)));
        tasks
    }

    fn insert_ready(&mut self, key: QueueKey, pinned: Option<&str>) {
        self.ready.insert(key);
        if let Some(agent) = pinned {
            self.agent_ready
                .entry(agent.to_string())
                .or_default()
                .insert(key);
        }
    }

    fn remove_ready(&mut self, id: TaskId) {
        let Some(key) = self.keys.get(&id).copied() else {
            return;
        };
        self.ready.remove(&key);
        let pinned = self.tasks.get(&id).and_then(|t| t.agent_id.clone());
        if let Some(agent) = pinned {
            if let Some(queue) = self.agent_ready.get_mut(&agent) {
                queue.remove(&key);
                if queue.is_empty() {
                    self.agent_ready.remove(&agent);
                }
            }
        }
    }

    fn promote_waiters(&mut self, completed: TaskId) {
        let Some(waiters) = self.waiting_on.remove(&completed) else {
            return;
        };
        for waiter in waiters {
            let Some(remaining) = self.unmet.get_mut(&waiter) else {
                // cancelled while blocked
                continue;
            };
            *remaining = remaining.saturating_sub(1);
            if *remaining > 0 {
                continue;
            }
            self.unmet.remove(&waiter);

            let Some(task) = self.tasks.get(&waiter) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }
            let pinned = task.agent_id.clone();
            if let Some(key) = self.keys.get(&waiter).copied() {
                debug!(task_id = %waiter, "Task unblocked");
                self.insert_ready(key, pinned.as_deref());
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn stamp_finished(task: &mut Task) {
    let now = Utc::now();
    task.completed_at = Some(now);
    task.execution_time_ms = task.started_at.map(|start| (now - start).num_milliseconds());
}

fn invalid_transition(task: &Task, to: TaskStatus) -> MaestroError {
    MaestroError::InvalidTransition {
        id: task.id,
        from: task.status.to_string(),
        to: to.to_string(),
    }
}
