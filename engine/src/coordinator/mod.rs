//! Task coordinator
//!
//! This module implements the task lifecycle that keeps the worker pool
//! productive despite unreliable workers:
//!
//! 1. Tasks are created Pending; urgent (High/Critical) tasks are
//!    assigned synchronously, the rest wait for the next sweep
//! 2. Assignment routes by task kind through a fixed routing table and
//!    dispatches a kind-specific event to the assignee over the bus
//! 3. A periodic loop re-classifies worker health and sweeps the queue:
//!    Pending tasks get assigned, overdue InProgress tasks get delegated
//! 4. Completion/failure reports update the moving averages and record
//!    one experience entry per outcome; failed urgent tasks are
//!    re-delegated, which is the only automatic retry path
//!
//! Delegation never hands a task back to its current assignee or to the
//! agent that most recently delegated it; when no candidate remains the
//! task fails terminally with a descriptive message.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sdk::errors::{MeshError, MeshResult};
use sdk::subscriber::EventHandler;
use sdk::types::{
    AgentId, Event, EventFilter, EventKind, EventPriority, TaskKind, COORDINATOR_ID,
};

use crate::config::CoordinatorConfig;
use crate::event_bus::EventBus;
use crate::experience::{ExperienceBuffer, NewExperience};

pub mod health;
pub mod metrics;
pub mod task;

pub use health::{HealthStatus, WorkerHealth};
pub use metrics::PerformanceMetrics;
pub use task::{Task, TaskFilter, TaskStatus};

/// Buffer priority derived from a task's priority
fn experience_priority(priority: EventPriority) -> f64 {
    match priority {
        EventPriority::Low => 0.25,
        EventPriority::Medium => 0.5,
        EventPriority::High => 0.75,
        EventPriority::Critical => 1.0,
    }
}

/// Coordinates task assignment, worker health, and outcome recording
///
/// Shared via `Arc`; the poll loop, the bus intake handler, and the
/// public API all operate on the same instance.
pub struct TaskCoordinator {
    bus: Arc<EventBus>,
    buffer: Arc<ExperienceBuffer>,
    config: CoordinatorConfig,
    failure_reward: f64,

    tasks: RwLock<HashMap<Uuid, Task>>,
    workers: RwLock<HashMap<AgentId, WorkerHealth>>,
    metrics: RwLock<PerformanceMetrics>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskCoordinator {
    /// Create a coordinator wired to the given bus and buffer
    pub fn new(
        bus: Arc<EventBus>,
        buffer: Arc<ExperienceBuffer>,
        config: CoordinatorConfig,
        failure_reward: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            buffer,
            config,
            failure_reward,
            tasks: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            metrics: RwLock::new(PerformanceMetrics::default()),
            poll_handle: Mutex::new(None),
        })
    }

    /// Subscribe the coordinator's intake handler to worker-published
    /// completion, failure, and heartbeat events
    pub async fn attach(self: &Arc<Self>) {
        for kind in [
            EventKind::TaskCompleted,
            EventKind::TaskFailed,
            EventKind::Heartbeat,
        ] {
            let handler: Arc<dyn EventHandler> = Arc::new(CoordinatorInbox {
                coordinator: Arc::clone(self),
            });
            self.bus
                .subscribe(COORDINATOR_ID, EventFilter::Kind(kind), handler)
                .await;
        }
    }

    /// Spawn the periodic health-poll / queue-sweep loop; idempotent
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.poll_handle.lock().await;
        if guard.is_some() {
            return;
        }
        let coordinator = Arc::clone(self);
        let interval = self.config.poll_interval();
        info!(interval_secs = interval.as_secs(), "starting coordinator poll loop");
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so creation-time
            // state settles before the first sweep.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                coordinator.check_worker_health().await;
                coordinator.sweep_task_queue().await;
            }
        }));
    }

    /// Stop the poll loop; safe to call repeatedly
    pub async fn stop(&self) {
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
            info!("coordinator poll loop stopped");
        }
    }

    /// Ensure a health record exists for a worker, creating it lazily
    pub async fn register_worker(&self, worker_id: &str) {
        let mut workers = self.workers.write().await;
        workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerHealth::new(worker_id));
    }

    /// Create a task and, for High/Critical priorities, assign it now
    ///
    /// Assignment errors are absorbed here: a task that cannot be
    /// dispatched is marked Failed, never surfaced to the creator.
    pub async fn create_task(
        &self,
        kind: TaskKind,
        parameters: serde_json::Value,
        priority: EventPriority,
        explicit_assignee: Option<AgentId>,
    ) -> Task {
        let mut task = Task::new(kind, parameters, priority);
        task.assigned_to = explicit_assignee;
        let id = task.id;

        info!(task_id = %id, kind = %kind, ?priority, "task created");
        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(id, task.clone());
        }
        self.metrics.write().await.tasks_created += 1;
        self.prune_tasks().await;

        if priority.is_urgent() {
            if let Err(e) = self.assign_task(id).await {
                error!(task_id = %id, error = %e, "synchronous assignment failed");
            }
        }

        self.get_task(id).await.unwrap_or(task)
    }

    /// Convenience wrapper creating a High-priority assistance task
    pub async fn request_agent_assistance(
        &self,
        worker_id: &str,
        issue: &str,
        context: serde_json::Value,
    ) -> Uuid {
        self.metrics.write().await.assistance_requests += 1;
        let task = self
            .create_task(
                TaskKind::AssistWorker,
                json!({
                    "worker_id": worker_id,
                    "issue": issue,
                    "context": context,
                }),
                EventPriority::High,
                None,
            )
            .await;
        task.id
    }

    /// Assign a task to its routed (or explicit) worker
    ///
    /// If the target's health forbids assignment the task is delegated
    /// instead. Routing failure is terminal for the task.
    ///
    /// Crate-private: assignment happens through `create_task` and the
    /// sweep, never at an external caller's discretion.
    pub(crate) async fn assign_task(&self, task_id: Uuid) -> Result<()> {
        let (kind, parameters, hint) = {
            let tasks = self.tasks.read().await;
            let task = tasks
                .get(&task_id)
                .ok_or(MeshError::TaskNotFound(task_id))?;
            (task.kind, task.parameters.clone(), task.assigned_to.clone())
        };

        let target = match hint {
            Some(t) => t,
            None => match self.route(kind, &parameters).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "no route for task");
                    self.fail_task_internal(task_id, &e.to_string(), true).await;
                    return Ok(());
                }
            },
        };

        self.register_worker(&target).await;
        let target_status = self
            .workers
            .read()
            .await
            .get(&target)
            .map(|w| w.status)
            .unwrap_or_default();

        if !target_status.is_assignable() {
            debug!(task_id = %task_id, worker = %target, ?target_status, "target unassignable, delegating");
            // Record the intended assignee so delegation preserves it
            // as original_agent and excludes it from candidates. The
            // transient InProgress keeps the move on a state-machine
            // edge; the matching load bump is released by delegation.
            {
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(&task_id) {
                    task.assigned_to = Some(target.clone());
                    if task.status == TaskStatus::Pending {
                        task.status = TaskStatus::InProgress;
                        task.updated_at = Utc::now();
                    }
                }
            }
            {
                let mut workers = self.workers.write().await;
                if let Some(worker) = workers.get_mut(&target) {
                    worker.task_count += 1;
                    worker.is_active = true;
                }
            }
            return self.delegate_task(task_id, "assignee unhealthy").await;
        }

        self.activate(task_id, target).await
    }

    /// Hand an in-flight task to the healthiest remaining candidate
    ///
    /// Excludes the current assignee and the most recent delegator.
    /// No candidate means the task fails terminally; it is never
    /// retried after that.
    ///
    /// Crate-private: only the sweep (timeout) and the failure handler
    /// (urgent retry) may move a task through `Delegated`, so a
    /// terminally Failed task cannot be revived from outside.
    pub(crate) async fn delegate_task(&self, task_id: Uuid, reason: &str) -> Result<()> {
        let (current, previous_delegator, prior_status) = {
            let tasks = self.tasks.read().await;
            let task = tasks
                .get(&task_id)
                .ok_or(MeshError::TaskNotFound(task_id))?;
            if !task.status.can_transition(TaskStatus::Delegated) {
                return Err(MeshError::InvalidTransition {
                    from: task.status.to_string(),
                    to: TaskStatus::Delegated.to_string(),
                }
                .into());
            }
            (
                task.assigned_to.clone(),
                task.delegated_by.clone(),
                task.status,
            )
        };

        let mut exclude: Vec<&str> = Vec::new();
        if let Some(c) = &current {
            exclude.push(c);
        }
        if let Some(d) = &previous_delegator {
            exclude.push(d);
        }
        let candidate = self.healthiest_excluding(&exclude).await;

        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(&task_id) {
                if task.original_agent.is_none() {
                    task.original_agent = current.clone();
                }
                task.status = TaskStatus::Delegated;
                task.delegated_by = current.clone();
                task.updated_at = Utc::now();
            }
        }
        // A task delegated out of Failed already had its load released
        // by the failure handler.
        if prior_status != TaskStatus::Failed {
            if let Some(worker_id) = &current {
                self.release_worker(worker_id).await;
            }
        }
        self.metrics.write().await.tasks_delegated += 1;

        match candidate {
            Some(next) => {
                info!(task_id = %task_id, from = ?current, to = %next, reason, "task delegated");
                self.activate(task_id, next).await
            }
            None => {
                let message = format!(
                    "delegation exhausted ({}): no healthy candidate remains",
                    reason
                );
                warn!(task_id = %task_id, "{}", message);
                self.fail_task_internal(task_id, &message, prior_status != TaskStatus::Failed)
                    .await;
                Ok(())
            }
        }
    }

    /// Terminal success transition reported by (or for) the assignee
    pub async fn handle_task_completion(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
        reward: f64,
        quality: Option<f64>,
    ) -> Result<()> {
        let now = Utc::now();
        let (assignee, elapsed_ms, parameters, kind, priority, correlation_id) = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&task_id)
                .ok_or(MeshError::TaskNotFound(task_id))?;
            if !task.status.can_transition(TaskStatus::Completed) {
                return Err(MeshError::InvalidTransition {
                    from: task.status.to_string(),
                    to: TaskStatus::Completed.to_string(),
                }
                .into());
            }
            let elapsed_ms = (now - task.updated_at).num_milliseconds().max(0) as f64;
            task.status = TaskStatus::Completed;
            task.result = Some(result.clone());
            task.updated_at = now;
            (
                task.assigned_to.clone(),
                elapsed_ms,
                task.parameters.clone(),
                task.kind,
                task.priority,
                task.correlation_id,
            )
        };

        info!(task_id = %task_id, elapsed_ms, "task completed");
        self.metrics.write().await.record_outcome(true, elapsed_ms);

        if let Some(worker_id) = &assignee {
            let mut workers = self.workers.write().await;
            if let Some(worker) = workers.get_mut(worker_id) {
                worker.record_response_time(elapsed_ms);
                worker.record_heartbeat(None);
                if let Some(q) = quality {
                    worker.record_quality(q);
                }
                worker.task_count = worker.task_count.saturating_sub(1);
                worker.is_active = worker.task_count > 0;
            }
        }

        if let Some(worker_id) = assignee {
            self.buffer
                .add(NewExperience {
                    worker_id,
                    state: parameters,
                    action: kind.to_string(),
                    result: result.clone(),
                    next_state: result,
                    reward,
                    priority: Some(experience_priority(priority)),
                    metadata: json!({
                        "task_id": task_id,
                        "correlation_id": correlation_id,
                    }),
                })
                .await;
        }
        Ok(())
    }

    /// Terminal failure transition; urgent tasks are re-delegated
    pub async fn handle_task_failure(&self, task_id: Uuid, error_message: &str) -> Result<()> {
        let now = Utc::now();
        let (assignee, elapsed_ms, parameters, kind, priority, correlation_id) = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&task_id)
                .ok_or(MeshError::TaskNotFound(task_id))?;
            if !task.status.can_transition(TaskStatus::Failed) {
                return Err(MeshError::InvalidTransition {
                    from: task.status.to_string(),
                    to: TaskStatus::Failed.to_string(),
                }
                .into());
            }
            let elapsed_ms = (now - task.updated_at).num_milliseconds().max(0) as f64;
            task.status = TaskStatus::Failed;
            task.error_message = Some(error_message.to_string());
            task.updated_at = now;
            (
                task.assigned_to.clone(),
                elapsed_ms,
                task.parameters.clone(),
                task.kind,
                task.priority,
                task.correlation_id,
            )
        };

        warn!(task_id = %task_id, error = error_message, "task failed");
        self.metrics.write().await.record_outcome(false, elapsed_ms);

        if let Some(worker_id) = &assignee {
            let mut workers = self.workers.write().await;
            if let Some(worker) = workers.get_mut(worker_id) {
                worker.record_response_time(elapsed_ms);
                worker.error_count += 1;
                worker.task_count = worker.task_count.saturating_sub(1);
                worker.is_active = worker.task_count > 0;
            }
        }

        if let Some(worker_id) = assignee {
            self.buffer
                .add(NewExperience {
                    worker_id,
                    state: parameters,
                    action: kind.to_string(),
                    result: json!({ "error": error_message }),
                    next_state: serde_json::Value::Null,
                    reward: self.failure_reward,
                    priority: Some(experience_priority(priority)),
                    metadata: json!({
                        "task_id": task_id,
                        "correlation_id": correlation_id,
                    }),
                })
                .await;
        }

        // The only automatic retry path: failed High/Critical tasks are
        // re-delegated; Medium/Low failures stay failed for the caller.
        if priority.is_urgent() {
            self.delegate_task(task_id, "urgent task failed").await?;
        }
        Ok(())
    }

    /// Re-classify every known worker and sweep the task queue once
    ///
    /// Exposed for tests; the poll loop calls this on its interval.
    pub async fn check_worker_health(&self) {
        let now = Utc::now();
        let mut newly_unhealthy = Vec::new();
        {
            let mut workers = self.workers.write().await;
            for (worker_id, worker) in workers.iter_mut() {
                match health_snapshot(
                    worker,
                    now,
                    self.config.stale_after(),
                    self.config.max_worker_errors,
                ) {
                    Ok(status) => {
                        if status == HealthStatus::Unhealthy
                            && worker.status != HealthStatus::Unhealthy
                        {
                            newly_unhealthy.push(worker_id.clone());
                        }
                        worker.status = status;
                    }
                    Err(e) => {
                        warn!(worker = %worker_id, error = %e, "health check failed, marking offline");
                        worker.status = HealthStatus::Offline;
                    }
                }
            }
        }

        for worker_id in newly_unhealthy {
            info!(worker = %worker_id, "worker unhealthy, requesting assistance");
            let error_count = self
                .workers
                .read()
                .await
                .get(&worker_id)
                .map(|w| w.error_count)
                .unwrap_or(0);
            self.request_agent_assistance(
                &worker_id,
                "unhealthy",
                json!({ "error_count": error_count }),
            )
            .await;
        }
    }

    /// Assign every Pending task and delegate every overdue one
    ///
    /// Exposed for tests; the poll loop calls this on its interval.
    pub async fn sweep_task_queue(&self) {
        let now = Utc::now();
        let timeout = self.config.task_timeout();
        let (pending, overdue): (Vec<Uuid>, Vec<Uuid>) = {
            let tasks = self.tasks.read().await;
            let pending = tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .map(|t| t.id)
                .collect();
            let overdue = tasks
                .values()
                .filter(|t| t.status == TaskStatus::InProgress && t.age_since_update(now) > timeout)
                .map(|t| t.id)
                .collect();
            (pending, overdue)
        };

        for task_id in pending {
            if let Err(e) = self.assign_task(task_id).await {
                error!(task_id = %task_id, error = %e, "sweep assignment failed");
            }
        }
        for task_id in overdue {
            debug!(task_id = %task_id, "task overdue, delegating");
            if let Err(e) = self.delegate_task(task_id, "timeout").await {
                error!(task_id = %task_id, error = %e, "sweep delegation failed");
            }
        }
    }

    /// Look up one task by id
    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    /// All tasks passing the filter, most recently updated first
    pub async fn get_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        matched
    }

    /// Health records: one worker's, or every worker's
    pub async fn get_worker_health(&self, worker_id: Option<&str>) -> Vec<WorkerHealth> {
        let workers = self.workers.read().await;
        match worker_id {
            Some(id) => workers.get(id).cloned().into_iter().collect(),
            None => workers.values().cloned().collect(),
        }
    }

    /// Ids of every worker the coordinator has seen
    pub async fn known_workers(&self) -> Vec<AgentId> {
        self.workers.read().await.keys().cloned().collect()
    }

    /// Snapshot of the process-wide metrics
    pub async fn get_performance_metrics(&self) -> PerformanceMetrics {
        self.metrics.read().await.clone()
    }

    // --- internal ---

    /// Resolve the responsible worker for a task kind
    async fn route(&self, kind: TaskKind, parameters: &serde_json::Value) -> MeshResult<AgentId> {
        if kind == TaskKind::AssistWorker {
            let struggling = parameters
                .get("worker_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            return self
                .healthiest_excluding(&[struggling])
                .await
                .ok_or_else(|| {
                    MeshError::DelegationExhausted(format!(
                        "no healthy worker available to assist {}",
                        struggling
                    ))
                });
        }
        self.config
            .routing
            .get(&kind)
            .cloned()
            .ok_or_else(|| MeshError::NoRoute(kind.to_string()))
    }

    /// Healthiest assignable worker not in `exclude`: Healthy before
    /// Degraded, then fewest active tasks, then lowest error count
    async fn healthiest_excluding(&self, exclude: &[&str]) -> Option<AgentId> {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| w.status.is_assignable())
            .filter(|w| !exclude.contains(&w.worker_id.as_str()))
            .min_by_key(|w| (w.status.preference_rank(), w.task_count, w.error_count))
            .map(|w| w.worker_id.clone())
    }

    /// Move a task to InProgress on `target` and dispatch the event
    ///
    /// A dispatch error marks the task Failed and bumps the worker's
    /// error counter; it is not propagated.
    async fn activate(&self, task_id: Uuid, target: AgentId) -> Result<()> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&task_id)
                .ok_or(MeshError::TaskNotFound(task_id))?;
            if !task.status.can_transition(TaskStatus::InProgress) {
                return Err(MeshError::InvalidTransition {
                    from: task.status.to_string(),
                    to: TaskStatus::InProgress.to_string(),
                }
                .into());
            }
            task.status = TaskStatus::InProgress;
            task.assigned_to = Some(target.clone());
            task.updated_at = Utc::now();
            task.clone()
        };

        self.register_worker(&target).await;
        {
            let mut workers = self.workers.write().await;
            if let Some(worker) = workers.get_mut(&target) {
                worker.task_count += 1;
                worker.is_active = true;
            }
        }

        if let Err(e) = self.send_task_to_agent(&task).await {
            warn!(task_id = %task_id, worker = %target, error = %e, "dispatch failed");
            {
                let mut workers = self.workers.write().await;
                if let Some(worker) = workers.get_mut(&target) {
                    worker.error_count += 1;
                    worker.task_count = worker.task_count.saturating_sub(1);
                    worker.is_active = worker.task_count > 0;
                }
            }
            self.fail_task_internal(task_id, &format!("dispatch failed: {}", e), true)
                .await;
        }
        Ok(())
    }

    /// Publish the kind-specific dispatch event to the assignee
    async fn send_task_to_agent(&self, task: &Task) -> Result<()> {
        let assignee = task
            .assigned_to
            .clone()
            .ok_or_else(|| anyhow!("task {} has no assignee", task.id))?;

        let params = &task.parameters;
        let payload = match task.kind {
            TaskKind::Validation => json!({
                "task_id": task.id,
                "record": params.get("record").cloned().unwrap_or_else(|| params.clone()),
                "rules": params.get("rules").cloned().unwrap_or(serde_json::Value::Null),
            }),
            TaskKind::Analysis => json!({
                "task_id": task.id,
                "dataset": params.get("dataset").cloned().unwrap_or_else(|| params.clone()),
                "window": params.get("window").cloned().unwrap_or(serde_json::Value::Null),
            }),
            TaskKind::Estimation => json!({
                "task_id": task.id,
                "subject": params.get("subject").cloned().unwrap_or_else(|| params.clone()),
                "basis": params.get("basis").cloned().unwrap_or(serde_json::Value::Null),
            }),
            TaskKind::AssistWorker => json!({
                "task_id": task.id,
                "struggling_worker": params.get("worker_id").cloned().unwrap_or(serde_json::Value::Null),
                "issue": params.get("issue").cloned().unwrap_or(serde_json::Value::Null),
                "context": params.get("context").cloned().unwrap_or(serde_json::Value::Null),
            }),
        };

        self.bus
            .publish(
                Event::new(EventKind::for_task(task.kind), COORDINATOR_ID)
                    .with_target(assignee)
                    .with_priority(task.priority)
                    .with_correlation(task.correlation_id)
                    .with_payload(payload),
            )
            .await;
        Ok(())
    }

    /// Mark a task Failed outside the normal failure handler (routing
    /// and dispatch errors, delegation exhaustion)
    ///
    /// `count_failure` is false when the task already went through
    /// `record_outcome` for this failure, so each failure is counted
    /// exactly once.
    async fn fail_task_internal(&self, task_id: Uuid, message: &str, count_failure: bool) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(&task_id) {
            task.status = TaskStatus::Failed;
            // Keep the root cause when a later step adds its own message.
            task.error_message = Some(match task.error_message.take() {
                Some(prev) => format!("{}; {}", prev, message),
                None => message.to_string(),
            });
            task.updated_at = Utc::now();
        }
        drop(tasks);
        if count_failure {
            self.metrics.write().await.tasks_failed += 1;
        }
    }

    /// Drop one unit of load from a worker's bookkeeping
    async fn release_worker(&self, worker_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(worker_id) {
            worker.task_count = worker.task_count.saturating_sub(1);
            worker.is_active = worker.task_count > 0;
        }
    }

    /// Evict tasks past the retention cap, oldest-updated first,
    /// preferring terminal tasks over live ones
    async fn prune_tasks(&self) {
        let mut tasks = self.tasks.write().await;
        if tasks.len() <= self.config.task_retention {
            return;
        }
        let mut excess = tasks.len() - self.config.task_retention;

        let mut terminal: Vec<(Uuid, chrono::DateTime<Utc>)> = tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.id, t.updated_at))
            .collect();
        terminal.sort_by_key(|(_, updated)| *updated);
        for (id, _) in terminal.into_iter().take(excess) {
            tasks.remove(&id);
        }

        excess = tasks.len().saturating_sub(self.config.task_retention);
        if excess > 0 {
            let mut live: Vec<(Uuid, chrono::DateTime<Utc>)> =
                tasks.values().map(|t| (t.id, t.updated_at)).collect();
            live.sort_by_key(|(_, updated)| *updated);
            for (id, _) in live.into_iter().take(excess) {
                debug!(task_id = %id, "pruning non-terminal task");
                tasks.remove(&id);
            }
        }
    }

    /// Refresh a worker's heartbeat bookkeeping from a bus event
    async fn record_heartbeat(&self, worker_id: &str, memory_usage: Option<f64>) {
        self.register_worker(worker_id).await;
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(worker_id) {
            worker.record_heartbeat(memory_usage);
        }
    }
}

/// Fallible per-worker health check; an error marks the worker Offline
fn health_snapshot(
    worker: &WorkerHealth,
    now: chrono::DateTime<Utc>,
    stale_after: chrono::Duration,
    max_errors: usize,
) -> Result<HealthStatus> {
    if !worker.average_response_ms.is_finite() || !worker.memory_usage.is_finite() {
        return Err(anyhow!(
            "worker {} reported non-finite metrics",
            worker.worker_id
        ));
    }
    Ok(worker.classify(now, stale_after, max_errors))
}

/// Routes worker-published bus events into the coordinator
struct CoordinatorInbox {
    coordinator: Arc<TaskCoordinator>,
}

#[async_trait::async_trait]
impl EventHandler for CoordinatorInbox {
    async fn handle(&self, event: Event) -> MeshResult<()> {
        match event.kind {
            EventKind::TaskCompleted => {
                let task_id = parse_task_id(&event)?;
                let result = event
                    .payload
                    .get("result")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                let reward = event.payload_f64("reward").unwrap_or(1.0);
                let quality = event.payload_f64("quality");
                self.coordinator
                    .handle_task_completion(task_id, result, reward, quality)
                    .await
                    .map_err(|e| MeshError::HandlerFailed(e.to_string()))
            }
            EventKind::TaskFailed => {
                let task_id = parse_task_id(&event)?;
                let message = event.payload_str("error").unwrap_or("unspecified failure");
                self.coordinator
                    .handle_task_failure(task_id, message)
                    .await
                    .map_err(|e| MeshError::HandlerFailed(e.to_string()))
            }
            EventKind::Heartbeat => {
                let memory = event.payload_f64("memory_usage");
                self.coordinator.record_heartbeat(&event.source, memory).await;
                Ok(())
            }
            other => {
                debug!(kind = ?other, "coordinator inbox ignoring event");
                Ok(())
            }
        }
    }
}

fn parse_task_id(event: &Event) -> MeshResult<Uuid> {
    event
        .payload_str("task_id")
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| MeshError::HandlerFailed("missing or invalid task_id".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval_secs: 1,
            stale_after_secs: 60,
            max_worker_errors: 5,
            task_timeout_secs: 30,
            task_retention: 100,
            routing: HashMap::from([
                (TaskKind::Validation, "validator".to_string()),
                (TaskKind::Analysis, "analyst".to_string()),
                (TaskKind::Estimation, "estimator".to_string()),
            ]),
        }
    }

    fn setup() -> Arc<TaskCoordinator> {
        let bus = Arc::new(EventBus::new());
        let buffer = Arc::new(ExperienceBuffer::new(1000, 0.5));
        TaskCoordinator::new(bus, buffer, test_config(), -0.5)
    }

    async fn set_status(coordinator: &TaskCoordinator, worker: &str, status: HealthStatus) {
        coordinator.register_worker(worker).await;
        let mut workers = coordinator.workers.write().await;
        workers
            .get_mut(worker)
            .expect("worker registered")
            .status = status;
    }

    #[tokio::test]
    async fn test_urgent_task_assigned_synchronously() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;

        let task = coordinator
            .create_task(
                TaskKind::Validation,
                json!({ "record": "r-1" }),
                EventPriority::High,
                None,
            )
            .await;

        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_to.as_deref(), Some("validator"));
    }

    #[tokio::test]
    async fn test_medium_task_waits_for_sweep() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;

        let task = coordinator
            .create_task(
                TaskKind::Validation,
                json!({}),
                EventPriority::Medium,
                None,
            )
            .await;
        assert_eq!(task.status, TaskStatus::Pending);

        coordinator.sweep_task_queue().await;
        let task = coordinator.get_task(task.id).await.expect("task exists");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_to.as_deref(), Some("validator"));
    }

    #[tokio::test]
    async fn test_unhealthy_target_is_delegated_with_original_agent() {
        let coordinator = setup();
        set_status(&coordinator, "validator", HealthStatus::Unhealthy).await;
        coordinator.register_worker("analyst").await;

        let task = coordinator
            .create_task(
                TaskKind::Validation,
                json!({}),
                EventPriority::High,
                None,
            )
            .await;

        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_to.as_deref(), Some("analyst"));
        assert_eq!(task.original_agent.as_deref(), Some("validator"));
        assert_eq!(task.delegated_by.as_deref(), Some("validator"));
    }

    #[tokio::test]
    async fn test_delegation_exhaustion_is_terminal() {
        let coordinator = setup();
        set_status(&coordinator, "validator", HealthStatus::Unhealthy).await;

        let task = coordinator
            .create_task(
                TaskKind::Validation,
                json!({}),
                EventPriority::Critical,
                None,
            )
            .await;

        assert_eq!(task.status, TaskStatus::Failed);
        let message = task.error_message.expect("failure message");
        assert!(message.contains("no healthy candidate"));
    }

    #[tokio::test]
    async fn test_delegation_excludes_current_and_delegator() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;
        coordinator.register_worker("analyst").await;

        let task = coordinator
            .create_task(
                TaskKind::Validation,
                json!({}),
                EventPriority::High,
                None,
            )
            .await;
        assert_eq!(task.assigned_to.as_deref(), Some("validator"));

        coordinator
            .delegate_task(task.id, "test")
            .await
            .expect("first delegation");
        let task = coordinator.get_task(task.id).await.expect("task exists");
        assert_eq!(task.assigned_to.as_deref(), Some("analyst"));
        assert_eq!(task.delegated_by.as_deref(), Some("validator"));

        // Second delegation excludes analyst (current) and validator
        // (most recent delegator); with no third worker it must fail.
        coordinator
            .delegate_task(task.id, "test")
            .await
            .expect("second delegation");
        let task = coordinator.get_task(task.id).await.expect("task exists");
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_completion_updates_metrics_and_buffer() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;

        let task = coordinator
            .create_task(
                TaskKind::Validation,
                json!({ "record": "r-9" }),
                EventPriority::High,
                None,
            )
            .await;

        coordinator
            .handle_task_completion(task.id, json!({ "valid": true }), 0.9, Some(0.8))
            .await
            .expect("completion");

        let task = coordinator.get_task(task.id).await.expect("task exists");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({ "valid": true })));

        let metrics = coordinator.get_performance_metrics().await;
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.average_success_rate, 1.0);

        assert_eq!(coordinator.buffer.len().await, 1);
        let health = coordinator.get_worker_health(Some("validator")).await;
        assert_eq!(health[0].task_count, 0);
        assert!(health[0].output_quality > 0.0);
    }

    #[tokio::test]
    async fn test_terminal_task_rejects_further_transitions() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;
        let task = coordinator
            .create_task(TaskKind::Validation, json!({}), EventPriority::High, None)
            .await;

        coordinator
            .handle_task_completion(task.id, json!({}), 1.0, None)
            .await
            .expect("completion");

        let err = coordinator
            .handle_task_completion(task.id, json!({}), 1.0, None)
            .await
            .expect_err("already terminal");
        assert!(err.to_string().contains("Invalid task transition"));

        let err = coordinator
            .handle_task_failure(task.id, "late failure")
            .await
            .expect_err("already terminal");
        assert!(err.to_string().contains("Invalid task transition"));
    }

    #[tokio::test]
    async fn test_urgent_failure_is_redelegated() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;
        coordinator.register_worker("analyst").await;

        let task = coordinator
            .create_task(
                TaskKind::Validation,
                json!({}),
                EventPriority::Critical,
                None,
            )
            .await;
        assert_eq!(task.assigned_to.as_deref(), Some("validator"));

        coordinator
            .handle_task_failure(task.id, "worker crashed")
            .await
            .expect("failure handling");

        let task = coordinator.get_task(task.id).await.expect("task exists");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_to.as_deref(), Some("analyst"));
        assert_eq!(task.original_agent.as_deref(), Some("validator"));
    }

    #[tokio::test]
    async fn test_exhausted_urgent_failure_counts_once() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;

        let task = coordinator
            .create_task(
                TaskKind::Validation,
                json!({}),
                EventPriority::Critical,
                None,
            )
            .await;
        assert_eq!(task.status, TaskStatus::InProgress);

        coordinator
            .handle_task_failure(task.id, "worker crashed")
            .await
            .expect("failure handling");

        // Re-delegation finds no candidate besides the failed worker,
        // so the task stays down. One failure, one count.
        let task = coordinator.get_task(task.id).await.expect("task exists");
        assert_eq!(task.status, TaskStatus::Failed);

        let metrics = coordinator.get_performance_metrics().await;
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.tasks_delegated, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_preserves_root_cause_message() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;

        let task = coordinator
            .create_task(
                TaskKind::Validation,
                json!({}),
                EventPriority::Critical,
                None,
            )
            .await;
        coordinator
            .handle_task_failure(task.id, "worker crashed")
            .await
            .expect("failure handling");

        let task = coordinator.get_task(task.id).await.expect("task exists");
        let message = task.error_message.expect("failure message");
        assert!(message.contains("worker crashed"));
        assert!(message.contains("no healthy candidate"));
    }

    #[tokio::test]
    async fn test_medium_failure_stays_failed() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;
        coordinator.register_worker("analyst").await;

        let task = coordinator
            .create_task(TaskKind::Validation, json!({}), EventPriority::Medium, None)
            .await;
        coordinator.sweep_task_queue().await;

        coordinator
            .handle_task_failure(task.id, "bad input")
            .await
            .expect("failure handling");

        let task = coordinator.get_task(task.id).await.expect("task exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("bad input"));
    }

    #[tokio::test]
    async fn test_assist_routes_to_healthiest_excluding_struggler() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;
        coordinator.register_worker("analyst").await;
        // Load the analyst so the validator is the healthier pick.
        {
            let mut workers = coordinator.workers.write().await;
            workers.get_mut("analyst").expect("analyst").task_count = 3;
        }

        let task_id = coordinator
            .request_agent_assistance("analyst", "unhealthy", json!({}))
            .await;
        let task = coordinator.get_task(task_id).await.expect("task exists");
        assert_eq!(task.kind, TaskKind::AssistWorker);
        assert_eq!(task.priority, EventPriority::High);
        assert_eq!(task.assigned_to.as_deref(), Some("validator"));
    }

    #[tokio::test]
    async fn test_unhealthy_worker_triggers_assistance() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;
        coordinator.register_worker("analyst").await;
        {
            let mut workers = coordinator.workers.write().await;
            workers.get_mut("analyst").expect("analyst").error_count = 6;
        }

        coordinator.check_worker_health().await;

        let health = coordinator.get_worker_health(Some("analyst")).await;
        assert_eq!(health[0].status, HealthStatus::Unhealthy);

        let assists = coordinator
            .get_tasks(&TaskFilter {
                kind: Some(TaskKind::AssistWorker),
                ..Default::default()
            })
            .await;
        assert_eq!(assists.len(), 1);

        // A second poll must not create a duplicate assist task.
        coordinator.check_worker_health().await;
        let assists = coordinator
            .get_tasks(&TaskFilter {
                kind: Some(TaskKind::AssistWorker),
                ..Default::default()
            })
            .await;
        assert_eq!(assists.len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_error_marks_offline() {
        let coordinator = setup();
        coordinator.register_worker("validator").await;
        {
            let mut workers = coordinator.workers.write().await;
            workers
                .get_mut("validator")
                .expect("validator")
                .memory_usage = f64::NAN;
        }

        coordinator.check_worker_health().await;
        let health = coordinator.get_worker_health(Some("validator")).await;
        assert_eq!(health[0].status, HealthStatus::Offline);
    }

    #[tokio::test]
    async fn test_pruning_prefers_terminal_tasks() {
        let bus = Arc::new(EventBus::new());
        let buffer = Arc::new(ExperienceBuffer::new(1000, 0.5));
        let mut config = test_config();
        config.task_retention = 2;
        let coordinator = TaskCoordinator::new(bus, buffer, config, -0.5);
        coordinator.register_worker("validator").await;

        let done = coordinator
            .create_task(TaskKind::Validation, json!({}), EventPriority::High, None)
            .await;
        coordinator
            .handle_task_completion(done.id, json!({}), 1.0, None)
            .await
            .expect("completion");

        let live_1 = coordinator
            .create_task(TaskKind::Validation, json!({}), EventPriority::Medium, None)
            .await;
        let live_2 = coordinator
            .create_task(TaskKind::Validation, json!({}), EventPriority::Medium, None)
            .await;

        // The terminal task was evicted, the live ones survive.
        assert!(coordinator.get_task(done.id).await.is_none());
        assert!(coordinator.get_task(live_1.id).await.is_some());
        assert!(coordinator.get_task(live_2.id).await.is_some());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let coordinator = setup();
        coordinator.start().await;
        coordinator.stop().await;
        coordinator.stop().await;
    }
}
