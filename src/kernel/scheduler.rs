//! Task scheduler.
//!
//! Owns the ready queue (ordered by the configured [`SchedulingAlgorithm`]),
//! the side table of waiting/blocked tasks, the running set and a bounded
//! history of finished tasks. Terminal outcomes are also kept per id, so
//! dependencies on tasks evicted from history still resolve. Dependencies are
//! resolved whenever a task reaches a terminal state, and a periodic boost pass promotes tasks that
//! have sat in the ready queue past the starvation threshold.
//!
//! NOT a separate actor - owned by Kernel and called via &mut self.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::algorithms::SchedulingAlgorithm;
use super::clock::{to_chrono, KernelContext};
use super::priority_queue::PriorityQueue;
use super::types::{ResourceCost, SchedulableTask, TaskPriority, TaskSpec, TaskState, WaitReason};
use crate::events::{BusEvent, EventBus, SubscriptionId};
use crate::types::{Error, Result, TaskId};

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub algorithm: SchedulingAlgorithm,
    /// Maximum tasks in the running set at once.
    pub max_concurrent_tasks: usize,
    /// Maximum ready + waiting tasks.
    pub max_queue_size: usize,
    /// Finished tasks retained for lookup and dependency resolution.
    pub completed_history_limit: usize,
    pub starvation_prevention: bool,
    /// Ready-queue wait after which a task is boosted one level.
    #[serde(with = "humantime_serde")]
    pub starvation_threshold: Duration,
    /// Period of the boost ticker.
    #[serde(with = "humantime_serde")]
    pub boost_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            algorithm: SchedulingAlgorithm::Priority,
            max_concurrent_tasks: 10,
            max_queue_size: 1000,
            completed_history_limit: 1000,
            starvation_prevention: true,
            starvation_threshold: Duration::from_secs(60),
            boost_interval: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Task lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Scheduled {
        task_id: TaskId,
        owner_id: String,
        priority: TaskPriority,
        state: TaskState,
    },
    Started {
        task_id: TaskId,
    },
    Completed {
        task_id: TaskId,
        duration_ms: i64,
    },
    Failed {
        task_id: TaskId,
        error: String,
    },
    Preempted {
        task_id: TaskId,
    },
    Blocked {
        task_id: TaskId,
        reason: String,
    },
    Unblocked {
        task_id: TaskId,
    },
    Waiting {
        task_id: TaskId,
    },
    Cancelled {
        task_id: TaskId,
    },
    Boosted {
        task_id: TaskId,
        from: TaskPriority,
        to: TaskPriority,
    },
    QueueEmpty,
    QueueFull {
        size: usize,
    },
}

impl BusEvent for TaskEvent {
    fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Scheduled { .. } => "task:scheduled",
            TaskEvent::Started { .. } => "task:started",
            TaskEvent::Completed { .. } => "task:completed",
            TaskEvent::Failed { .. } => "task:failed",
            TaskEvent::Preempted { .. } => "task:preempted",
            TaskEvent::Blocked { .. } => "task:blocked",
            TaskEvent::Unblocked { .. } => "task:unblocked",
            TaskEvent::Waiting { .. } => "task:waiting",
            TaskEvent::Cancelled { .. } => "task:cancelled",
            TaskEvent::Boosted { .. } => "task:boosted",
            TaskEvent::QueueEmpty => "queue:empty",
            TaskEvent::QueueFull { .. } => "queue:full",
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub algorithm: SchedulingAlgorithm,
    pub ready: usize,
    pub waiting: usize,
    pub running: usize,
    pub history: usize,
    pub total_scheduled: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_boosts: u64,
}

/// Where a dependency currently stands.
enum DependencyStatus {
    Satisfied,
    Pending,
    Broken(TaskId),
}

// =============================================================================
// Scheduler
// =============================================================================

#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    ctx: KernelContext,
    algorithm: SchedulingAlgorithm,
    ready: PriorityQueue<SchedulableTask>,
    /// Waiting and blocked tasks, keyed by id.
    parked: HashMap<TaskId, SchedulableTask>,
    running: HashMap<TaskId, SchedulableTask>,
    history: VecDeque<SchedulableTask>,
    /// Terminal state of every finished task, including evicted ones.
    outcomes: HashMap<TaskId, TaskState>,
    owner_usage: HashMap<String, u64>,
    next_sequence: u64,
    stats: SchedulerStats,
    events: EventBus<TaskEvent>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, ctx: KernelContext) -> Self {
        let algorithm = config.algorithm;
        Self {
            ready: PriorityQueue::new(algorithm.comparator(Arc::new(HashMap::new()))),
            config,
            ctx,
            algorithm,
            parked: HashMap::new(),
            running: HashMap::new(),
            history: VecDeque::new(),
            outcomes: HashMap::new(),
            owner_usage: HashMap::new(),
            next_sequence: 0,
            stats: SchedulerStats {
                algorithm,
                ..SchedulerStats::default()
            },
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn subscribe<F>(&mut self, kind: &str, handler: F) -> SubscriptionId
    where
        F: FnMut(&TaskEvent) + Send + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn events(&self) -> &EventBus<TaskEvent> {
        &self.events
    }

    // =========================================================================
    // Admission and dispatch
    // =========================================================================

    /// Admit a task. Ready if every dependency already completed, waiting otherwise.
    ///
    /// Admitting an id that is already known returns the existing record. An
    /// id that finished and was evicted from history is rejected.
    pub fn schedule(&mut self, spec: TaskSpec) -> Result<SchedulableTask> {
        if spec.owner_id.trim().is_empty() {
            return Err(Error::validation("task owner_id cannot be empty"));
        }

        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| TaskId::generate(self.ctx.ids.as_ref()));
        if let Some(existing) = self.get_task(&id) {
            return Ok(existing);
        }
        if let Some(state) = self.outcomes.get(&id) {
            return Err(Error::already_exists(format!(
                "task {} already finished as {:?}",
                id, state
            )));
        }

        let queued = self.ready.len() + self.parked.len();
        if queued >= self.config.max_queue_size {
            self.events.emit(TaskEvent::QueueFull { size: queued });
            tracing::warn!("task_rejected_queue_full: id={}, size={}", id, queued);
            return Err(Error::quota_exceeded(format!(
                "scheduler queue full ({} tasks)",
                queued
            )));
        }

        self.next_sequence += 1;
        let mut task = SchedulableTask::from_spec(id.clone(), spec, self.ctx.now(), self.next_sequence);

        let deps_done = task
            .dependencies
            .iter()
            .all(|dep| matches!(self.dependency_status(dep), DependencyStatus::Satisfied));

        if deps_done {
            task.state = TaskState::Ready;
            self.ready.enqueue(task.clone());
        } else {
            task.state = TaskState::Waiting;
            task.wait_reason = Some(WaitReason::Dependencies);
            self.parked.insert(id.clone(), task.clone());
        }
        self.stats.total_scheduled += 1;

        tracing::debug!(
            "task_scheduled: id={}, owner={}, priority={:?}, state={:?}",
            task.id,
            task.owner_id,
            task.priority,
            task.state
        );
        self.events.emit(TaskEvent::Scheduled {
            task_id: id,
            owner_id: task.owner_id.clone(),
            priority: task.priority,
            state: task.state,
        });

        if task.state == TaskState::Waiting {
            // A dependency may already have failed.
            self.resolve_dependencies();
            if let Some(current) = self.get_task(&task.id) {
                return Ok(current);
            }
        }
        Ok(task)
    }

    /// Dequeue the next task to run, honoring the concurrency ceiling.
    pub fn get_next_task(&mut self) -> Option<SchedulableTask> {
        if self.ready.is_empty() && self.parked.is_empty() {
            self.events.emit(TaskEvent::QueueEmpty);
            return None;
        }
        if self.running.len() >= self.config.max_concurrent_tasks {
            tracing::debug!(
                "task_dispatch_deferred: running={}, max={}",
                self.running.len(),
                self.config.max_concurrent_tasks
            );
            return None;
        }

        let mut task = self.ready.dequeue()?;
        task.state = TaskState::Running;
        task.started_at = Some(self.ctx.now());
        self.running.insert(task.id.clone(), task.clone());

        tracing::debug!("task_started: id={}, priority={:?}", task.id, task.priority);
        self.events.emit(TaskEvent::Started {
            task_id: task.id.clone(),
        });
        Some(task)
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    /// Complete a running task. `actual_cost` defaults to the estimate.
    pub fn complete_task(&mut self, id: &TaskId, actual_cost: Option<ResourceCost>) -> Result<()> {
        let task = self.take_running(id, "complete")?;
        self.finish(task, TaskState::Completed, actual_cost, None);
        Ok(())
    }

    /// Fail a running task.
    pub fn fail_task(
        &mut self,
        id: &TaskId,
        error: impl Into<String>,
        actual_cost: Option<ResourceCost>,
    ) -> Result<()> {
        let task = self.take_running(id, "fail")?;
        self.finish(task, TaskState::Failed, actual_cost, Some(error.into()));
        Ok(())
    }

    /// Cancel a task from any non-terminal state.
    pub fn cancel_task(&mut self, id: &TaskId) -> Result<()> {
        let task = if let Some(task) = self.ready.remove_first(|t| &t.id == id) {
            task
        } else if let Some(task) = self.parked.remove(id) {
            task
        } else if let Some(task) = self.running.remove(id) {
            task
        } else {
            return Err(self.missing_or_terminal(id, "cancel"));
        };

        self.finish(task, TaskState::Cancelled, None, None);
        Ok(())
    }

    /// Cancel every unfinished task, parked ones first. Returns how many.
    pub fn cancel_all(&mut self) -> usize {
        let mut ids: Vec<TaskId> = self.parked.keys().cloned().collect();
        ids.sort();
        ids.extend(self.ready_tasks().into_iter().map(|t| t.id));
        let mut running: Vec<TaskId> = self.running.keys().cloned().collect();
        running.sort();
        ids.extend(running);

        ids.iter().filter(|id| self.cancel_task(id).is_ok()).count()
    }

    fn finish(
        &mut self,
        mut task: SchedulableTask,
        state: TaskState,
        actual_cost: Option<ResourceCost>,
        error: Option<String>,
    ) {
        let now = self.ctx.now();
        task.state = state;
        task.completed_at = Some(now);
        task.wait_reason = None;
        task.error = error;

        // Only work that actually ran is charged to its owner.
        if task.started_at.is_some() {
            let cost = actual_cost.unwrap_or(task.estimated_cost);
            task.actual_cost = Some(cost);
            *self.owner_usage.entry(task.owner_id.clone()).or_default() += cost.units();
            if self.algorithm.uses_owner_usage() {
                self.refresh_comparator();
            }
        }

        let event = match state {
            TaskState::Completed => {
                self.stats.total_completed += 1;
                TaskEvent::Completed {
                    task_id: task.id.clone(),
                    duration_ms: task.run_duration().map_or(0, |d| d.num_milliseconds()),
                }
            }
            TaskState::Failed => {
                self.stats.total_failed += 1;
                TaskEvent::Failed {
                    task_id: task.id.clone(),
                    error: task.error.clone().unwrap_or_default(),
                }
            }
            _ => {
                self.stats.total_cancelled += 1;
                TaskEvent::Cancelled {
                    task_id: task.id.clone(),
                }
            }
        };

        tracing::debug!("task_finished: id={}, state={:?}", task.id, state);
        self.push_history(task);
        self.events.emit(event);
        self.resolve_dependencies();
    }

    fn push_history(&mut self, task: SchedulableTask) {
        self.outcomes.insert(task.id.clone(), task.state);
        self.history.push_back(task);
        while self.history.len() > self.config.completed_history_limit {
            self.history.pop_front();
        }
    }

    // =========================================================================
    // Parking transitions
    // =========================================================================

    /// Move a running task to the blocked side table.
    pub fn block_task(&mut self, id: &TaskId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let mut task = self.take_running(id, "block")?;
        task.state = TaskState::Blocked;
        task.wait_reason = Some(WaitReason::Blocked(reason.clone()));
        self.parked.insert(id.clone(), task);

        tracing::debug!("task_blocked: id={}, reason={}", id, reason);
        self.events.emit(TaskEvent::Blocked {
            task_id: id.clone(),
            reason,
        });
        Ok(())
    }

    /// Move a running task to the waiting side table.
    pub fn wait_task(&mut self, id: &TaskId) -> Result<()> {
        let mut task = self.take_running(id, "wait")?;
        task.state = TaskState::Waiting;
        task.wait_reason = Some(WaitReason::Yielded);
        self.parked.insert(id.clone(), task);

        self.events.emit(TaskEvent::Waiting {
            task_id: id.clone(),
        });
        Ok(())
    }

    /// Return a blocked or yielded task to the ready queue.
    ///
    /// Tasks waiting on dependencies are released only by dependency resolution.
    pub fn unblock_task(&mut self, id: &TaskId) -> Result<()> {
        match self.parked.get(id).and_then(|t| t.wait_reason.as_ref()) {
            Some(WaitReason::Blocked(_)) | Some(WaitReason::Yielded) => {}
            Some(WaitReason::Dependencies) => {
                return Err(Error::state_transition(format!(
                    "cannot unblock task {}: waiting on dependencies",
                    id
                )));
            }
            None => return Err(self.missing_or_terminal(id, "unblock")),
        }

        if let Some(task) = self.parked.remove(id) {
            self.make_ready(task);
        }
        Ok(())
    }

    /// Return a running task to the ready queue.
    pub fn preempt_task(&mut self, id: &TaskId) -> Result<()> {
        let mut task = self.take_running(id, "preempt")?;
        task.state = TaskState::Ready;
        task.enqueued_at = self.ctx.now();
        self.ready.enqueue(task);

        self.events.emit(TaskEvent::Preempted {
            task_id: id.clone(),
        });
        Ok(())
    }

    fn make_ready(&mut self, mut task: SchedulableTask) {
        let id = task.id.clone();
        task.state = TaskState::Ready;
        task.wait_reason = None;
        task.enqueued_at = self.ctx.now();
        self.ready.enqueue(task);

        tracing::debug!("task_unblocked: id={}", id);
        self.events.emit(TaskEvent::Unblocked { task_id: id });
    }

    // =========================================================================
    // Dependency resolution
    // =========================================================================

    fn dependency_status(&self, dep: &TaskId) -> DependencyStatus {
        match self.outcomes.get(dep).copied() {
            Some(TaskState::Completed) => DependencyStatus::Satisfied,
            Some(_) => DependencyStatus::Broken(dep.clone()),
            None => DependencyStatus::Pending,
        }
    }

    /// Release waiting tasks whose dependencies completed, fail those whose
    /// dependencies ended any other way. Repeats until nothing changes.
    fn resolve_dependencies(&mut self) {
        loop {
            let mut released = Vec::new();
            let mut broken = Vec::new();

            for task in self.parked.values() {
                if task.wait_reason != Some(WaitReason::Dependencies) {
                    continue;
                }
                let mut satisfied = true;
                for dep in &task.dependencies {
                    match self.dependency_status(dep) {
                        DependencyStatus::Satisfied => {}
                        DependencyStatus::Pending => satisfied = false,
                        DependencyStatus::Broken(dep) => {
                            broken.push((task.id.clone(), dep));
                            satisfied = false;
                            break;
                        }
                    }
                }
                if satisfied {
                    released.push(task.id.clone());
                }
            }

            if released.is_empty() && broken.is_empty() {
                return;
            }

            released.sort_by_key(|id| self.parked.get(id).map_or(0, |t| t.sequence));
            for id in released {
                if let Some(task) = self.parked.remove(&id) {
                    self.make_ready(task);
                }
            }
            for (id, dep) in broken {
                if let Some(task) = self.parked.remove(&id) {
                    let error = format!("dependency {} did not complete", dep);
                    self.finish_without_resolve(task, error);
                }
            }
        }
    }

    /// Fail a parked task without re-entering dependency resolution (the
    /// caller's loop picks up any knock-on effects).
    fn finish_without_resolve(&mut self, mut task: SchedulableTask, error: String) {
        task.state = TaskState::Failed;
        task.completed_at = Some(self.ctx.now());
        task.wait_reason = None;
        task.error = Some(error.clone());
        self.stats.total_failed += 1;

        let task_id = task.id.clone();
        tracing::debug!("task_dependency_failed: id={}, error={}", task_id, error);
        self.push_history(task);
        self.events.emit(TaskEvent::Failed { task_id, error });
    }

    // =========================================================================
    // Starvation prevention
    // =========================================================================

    /// Boost every ready task that has waited past the starvation threshold.
    ///
    /// Returns the number of tasks boosted.
    pub fn boost_starved_tasks(&mut self) -> usize {
        if !self.config.starvation_prevention {
            return 0;
        }
        let now = self.ctx.now();
        let threshold = to_chrono(self.config.starvation_threshold);

        let starved = self.ready.remove_where(|t| {
            t.priority != TaskPriority::Critical && now - t.enqueued_at > threshold
        });
        let boosted = starved.len();

        for mut task in starved {
            let from = task.priority;
            task.priority = from.boosted();
            task.boost_count += 1;
            task.enqueued_at = now;

            tracing::debug!("task_boosted: id={}, from={:?}, to={:?}", task.id, from, task.priority);
            self.events.emit(TaskEvent::Boosted {
                task_id: task.id.clone(),
                from,
                to: task.priority,
            });
            self.ready.enqueue(task);
        }

        self.stats.total_boosts += boosted as u64;
        boosted
    }

    // =========================================================================
    // Algorithm
    // =========================================================================

    pub fn algorithm(&self) -> SchedulingAlgorithm {
        self.algorithm
    }

    /// Switch algorithm and re-sort the ready queue under it.
    pub fn set_algorithm(&mut self, algorithm: SchedulingAlgorithm) {
        self.algorithm = algorithm;
        self.stats.algorithm = algorithm;
        self.refresh_comparator();
        tracing::info!("scheduler_algorithm_changed: algorithm={:?}", algorithm);
    }

    fn refresh_comparator(&mut self) {
        let snapshot = Arc::new(self.owner_usage.clone());
        self.ready.set_comparator(self.algorithm.comparator(snapshot));
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Look a task up in every table, newest history entry first.
    pub fn get_task(&self, id: &TaskId) -> Option<SchedulableTask> {
        self.ready
            .find(|t| &t.id == id)
            .or_else(|| self.parked.get(id))
            .or_else(|| self.running.get(id))
            .or_else(|| self.history.iter().rev().find(|t| &t.id == id))
            .cloned()
    }

    pub fn list_tasks(&self, state: TaskState) -> Vec<SchedulableTask> {
        let mut tasks: Vec<SchedulableTask> = self
            .ready
            .iter()
            .chain(self.parked.values())
            .chain(self.running.values())
            .chain(self.history.iter())
            .filter(|t| t.state == state)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Ready tasks in dispatch order.
    pub fn ready_tasks(&self) -> Vec<SchedulableTask> {
        self.ready.iter().cloned().collect()
    }

    pub fn owner_usage(&self, owner_id: &str) -> u64 {
        self.owner_usage.get(owner_id).copied().unwrap_or(0)
    }

    pub fn history(&self) -> impl Iterator<Item = &SchedulableTask> {
        self.history.iter()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            ready: self.ready.len(),
            waiting: self.parked.len(),
            running: self.running.len(),
            history: self.history.len(),
            ..self.stats.clone()
        }
    }

    /// Time the head of the ready queue has been waiting.
    pub fn oldest_wait(&self) -> Option<chrono::Duration> {
        let now: DateTime<Utc> = self.ctx.now();
        self.ready.iter().map(|t| now - t.enqueued_at).max()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn take_running(&mut self, id: &TaskId, op: &str) -> Result<SchedulableTask> {
        match self.running.remove(id) {
            Some(task) => Ok(task),
            None => Err(self.missing_or_terminal(id, op)),
        }
    }

    fn missing_or_terminal(&self, id: &TaskId, op: &str) -> Error {
        match self.get_task(id) {
            Some(task) => Error::state_transition(format!(
                "cannot {} task {}: state is {:?}",
                op, id, task.state
            )),
            None => Error::not_found(format!("unknown task: {}", id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::recorder;
    use crate::kernel::clock::ManualClock;

    fn scheduler_with(config: SchedulerConfig) -> (Scheduler, Arc<ManualClock>) {
        let (ctx, clock) = KernelContext::deterministic();
        (Scheduler::new(config, ctx), clock)
    }

    fn scheduler() -> (Scheduler, Arc<ManualClock>) {
        scheduler_with(SchedulerConfig::default())
    }

    fn spec(id: &str, priority: TaskPriority) -> TaskSpec {
        TaskSpec::new("owner").with_id(TaskId::must(id)).with_priority(priority)
    }

    #[test]
    fn test_priority_dispatch_order() {
        let (mut s, _) = scheduler();
        s.schedule(spec("low", TaskPriority::Low)).unwrap();
        s.schedule(spec("high", TaskPriority::High)).unwrap();
        s.schedule(spec("crit", TaskPriority::Critical)).unwrap();

        assert_eq!(s.get_next_task().unwrap().id.as_str(), "crit");
        assert_eq!(s.get_next_task().unwrap().id.as_str(), "high");
        assert_eq!(s.get_next_task().unwrap().id.as_str(), "low");
        assert!(s.get_next_task().is_none());
    }

    #[test]
    fn test_same_priority_is_fifo() {
        let (mut s, clock) = scheduler();
        s.schedule(spec("a", TaskPriority::Normal)).unwrap();
        clock.advance(Duration::from_millis(5));
        s.schedule(spec("b", TaskPriority::Normal)).unwrap();
        s.schedule(spec("c", TaskPriority::Normal)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| s.get_next_task())
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_schedule_returns_existing() {
        let (mut s, _) = scheduler();
        let first = s.schedule(spec("t", TaskPriority::Low)).unwrap();
        let second = s.schedule(spec("t", TaskPriority::Critical)).unwrap();
        assert_eq!(first, second);
        assert_eq!(s.stats().total_scheduled, 1);
    }

    #[test]
    fn test_empty_owner_rejected() {
        let (mut s, _) = scheduler();
        let err = s.schedule(TaskSpec::new("  ")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_concurrency_ceiling() {
        let (mut s, _) = scheduler_with(SchedulerConfig {
            max_concurrent_tasks: 1,
            ..SchedulerConfig::default()
        });
        s.schedule(spec("a", TaskPriority::Normal)).unwrap();
        s.schedule(spec("b", TaskPriority::Normal)).unwrap();

        let a = s.get_next_task().unwrap();
        assert!(s.get_next_task().is_none());
        s.complete_task(&a.id, None).unwrap();
        assert_eq!(s.get_next_task().unwrap().id.as_str(), "b");
    }

    #[test]
    fn test_queue_empty_and_full_events() {
        let (mut s, _) = scheduler_with(SchedulerConfig {
            max_queue_size: 1,
            ..SchedulerConfig::default()
        });
        let (seen, handler) = recorder::<TaskEvent>();
        s.subscribe("*", handler);

        assert!(s.get_next_task().is_none());
        s.schedule(spec("a", TaskPriority::Normal)).unwrap();
        let err = s.schedule(spec("b", TaskPriority::Normal)).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));

        let kinds: Vec<&str> = seen.lock().unwrap().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["queue:empty", "task:scheduled", "queue:full"]);
    }

    #[test]
    fn test_dependencies_release_on_completion() {
        let (mut s, _) = scheduler();
        s.schedule(spec("parent", TaskPriority::Normal)).unwrap();
        let child = s
            .schedule(spec("child", TaskPriority::Critical).depends_on(TaskId::must("parent")))
            .unwrap();
        assert_eq!(child.state, TaskState::Waiting);

        let parent = s.get_next_task().unwrap();
        assert_eq!(parent.id.as_str(), "parent");
        assert!(s.get_next_task().is_none());

        s.complete_task(&parent.id, None).unwrap();
        let next = s.get_next_task().unwrap();
        assert_eq!(next.id.as_str(), "child");
    }

    #[test]
    fn test_dependency_on_completed_task_is_ready_immediately() {
        let (mut s, _) = scheduler();
        s.schedule(spec("a", TaskPriority::Normal)).unwrap();
        let a = s.get_next_task().unwrap();
        s.complete_task(&a.id, None).unwrap();

        let b = s
            .schedule(spec("b", TaskPriority::Normal).depends_on(TaskId::must("a")))
            .unwrap();
        assert_eq!(b.state, TaskState::Ready);
    }

    #[test]
    fn test_failed_dependency_fails_dependents_transitively() {
        let (mut s, _) = scheduler();
        s.schedule(spec("a", TaskPriority::Normal)).unwrap();
        s.schedule(spec("b", TaskPriority::Normal).depends_on(TaskId::must("a")))
            .unwrap();
        s.schedule(spec("c", TaskPriority::Normal).depends_on(TaskId::must("b")))
            .unwrap();

        let a = s.get_next_task().unwrap();
        s.fail_task(&a.id, "boom", None).unwrap();

        let b = s.get_task(&TaskId::must("b")).unwrap();
        let c = s.get_task(&TaskId::must("c")).unwrap();
        assert_eq!(b.state, TaskState::Failed);
        assert_eq!(c.state, TaskState::Failed);
        assert_eq!(c.error.as_deref(), Some("dependency b did not complete"));
    }

    #[test]
    fn test_complete_requires_running() {
        let (mut s, _) = scheduler();
        s.schedule(spec("a", TaskPriority::Normal)).unwrap();

        let err = s.complete_task(&TaskId::must("a"), None).unwrap_err();
        assert!(err.is_state_transition());
        let err = s.complete_task(&TaskId::must("ghost"), None).unwrap_err();
        assert!(err.is_not_found());

        let a = s.get_next_task().unwrap();
        s.complete_task(&a.id, None).unwrap();
        assert!(s.complete_task(&a.id, None).unwrap_err().is_state_transition());
    }

    #[test]
    fn test_cancel_from_each_state() {
        let (mut s, _) = scheduler();
        s.schedule(spec("ready", TaskPriority::Low)).unwrap();
        s.schedule(spec("running", TaskPriority::Critical)).unwrap();
        s.schedule(spec("waiting", TaskPriority::Normal).depends_on(TaskId::must("never")))
            .unwrap();
        s.get_next_task().unwrap();

        for id in ["ready", "running", "waiting"] {
            s.cancel_task(&TaskId::must(id)).unwrap();
            assert_eq!(s.get_task(&TaskId::must(id)).unwrap().state, TaskState::Cancelled);
        }
        assert!(s.cancel_task(&TaskId::must("ready")).unwrap_err().is_state_transition());
        assert_eq!(s.stats().total_cancelled, 3);
        assert_eq!(s.running_count(), 0);
    }

    #[test]
    fn test_block_wait_unblock_cycle() {
        let (mut s, _) = scheduler();
        s.schedule(spec("a", TaskPriority::Normal)).unwrap();
        let a = s.get_next_task().unwrap();

        s.block_task(&a.id, "rate limited").unwrap();
        assert_eq!(s.get_task(&a.id).unwrap().state, TaskState::Blocked);
        assert!(s.block_task(&a.id, "again").unwrap_err().is_state_transition());

        s.unblock_task(&a.id).unwrap();
        let a = s.get_next_task().unwrap();
        s.wait_task(&a.id).unwrap();
        assert_eq!(s.get_task(&a.id).unwrap().state, TaskState::Waiting);
        s.unblock_task(&a.id).unwrap();
        assert_eq!(s.get_task(&a.id).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn test_unblock_rejects_dependency_wait() {
        let (mut s, _) = scheduler();
        s.schedule(spec("b", TaskPriority::Normal).depends_on(TaskId::must("a")))
            .unwrap();
        let err = s.unblock_task(&TaskId::must("b")).unwrap_err();
        assert!(err.is_state_transition());
    }

    #[test]
    fn test_preempt_returns_task_to_queue() {
        let (mut s, _) = scheduler();
        s.schedule(spec("a", TaskPriority::Normal)).unwrap();
        let a = s.get_next_task().unwrap();
        s.preempt_task(&a.id).unwrap();
        assert_eq!(s.running_count(), 0);
        assert_eq!(s.get_next_task().unwrap().id, a.id);
    }

    #[test]
    fn test_starvation_boost() {
        let (mut s, clock) = scheduler_with(SchedulerConfig {
            starvation_threshold: Duration::from_secs(30),
            ..SchedulerConfig::default()
        });
        s.schedule(spec("old", TaskPriority::Background)).unwrap();
        clock.advance(Duration::from_secs(31));
        s.schedule(spec("new", TaskPriority::Low)).unwrap();

        assert_eq!(s.boost_starved_tasks(), 1);
        let old = s.get_task(&TaskId::must("old")).unwrap();
        assert_eq!(old.priority, TaskPriority::Low);
        assert_eq!(old.base_priority, TaskPriority::Background);
        assert_eq!(old.boost_count, 1);

        // Wait clock restarts after a boost.
        assert_eq!(s.boost_starved_tasks(), 0);

        // Equal priority now; earlier creation wins.
        assert_eq!(s.get_next_task().unwrap().id.as_str(), "old");
    }

    #[test]
    fn test_boost_never_exceeds_critical() {
        let (mut s, clock) = scheduler();
        s.schedule(spec("c", TaskPriority::Critical)).unwrap();
        s.schedule(spec("h", TaskPriority::High)).unwrap();
        clock.advance(Duration::from_secs(120));
        assert_eq!(s.boost_starved_tasks(), 1);
        clock.advance(Duration::from_secs(120));
        assert_eq!(s.boost_starved_tasks(), 0);
        assert!(s
            .ready_tasks()
            .iter()
            .all(|t| t.priority == TaskPriority::Critical));
    }

    #[test]
    fn test_boost_disabled() {
        let (mut s, clock) = scheduler_with(SchedulerConfig {
            starvation_prevention: false,
            ..SchedulerConfig::default()
        });
        s.schedule(spec("a", TaskPriority::Low)).unwrap();
        clock.advance(Duration::from_secs(600));
        assert_eq!(s.boost_starved_tasks(), 0);
    }

    #[test]
    fn test_fair_share_rebalances_after_completion() {
        let (mut s, _) = scheduler_with(SchedulerConfig {
            algorithm: SchedulingAlgorithm::FairShare,
            ..SchedulerConfig::default()
        });
        s.schedule(TaskSpec::new("alice").with_id(TaskId::must("a1")).with_cost(ResourceCost::tokens(100)))
            .unwrap();
        let a1 = s.get_next_task().unwrap();
        s.complete_task(&a1.id, None).unwrap();
        assert_eq!(s.owner_usage("alice"), 100);

        s.schedule(TaskSpec::new("alice").with_id(TaskId::must("a2"))).unwrap();
        s.schedule(TaskSpec::new("bob").with_id(TaskId::must("b1"))).unwrap();
        assert_eq!(s.get_next_task().unwrap().id.as_str(), "b1");
    }

    #[test]
    fn test_set_algorithm_resorts_ready_queue() {
        let (mut s, _) = scheduler();
        s.schedule(spec("bg", TaskPriority::Background)).unwrap();
        s.schedule(spec("crit", TaskPriority::Critical)).unwrap();
        s.set_algorithm(SchedulingAlgorithm::RoundRobin);
        assert_eq!(s.get_next_task().unwrap().id.as_str(), "bg");
        assert_eq!(s.stats().algorithm, SchedulingAlgorithm::RoundRobin);
    }

    #[test]
    fn test_history_is_bounded() {
        let (mut s, _) = scheduler_with(SchedulerConfig {
            completed_history_limit: 2,
            ..SchedulerConfig::default()
        });
        for i in 0..4 {
            s.schedule(spec(&format!("t{i}"), TaskPriority::Normal)).unwrap();
            let t = s.get_next_task().unwrap();
            s.complete_task(&t.id, Some(ResourceCost::tokens(1))).unwrap();
        }
        let kept: Vec<String> = s.history().map(|t| t.id.to_string()).collect();
        assert_eq!(kept, vec!["t2", "t3"]);
        assert!(s.get_task(&TaskId::must("t0")).is_none());
        assert_eq!(s.stats().total_completed, 4);
    }

    #[test]
    fn test_evicted_dependency_still_resolves() {
        let (mut s, _) = scheduler_with(SchedulerConfig {
            completed_history_limit: 1,
            ..SchedulerConfig::default()
        });
        for id in ["a", "b"] {
            s.schedule(spec(id, TaskPriority::Normal)).unwrap();
            let t = s.get_next_task().unwrap();
            s.complete_task(&t.id, None).unwrap();
        }
        assert!(s.get_task(&TaskId::must("a")).is_none());

        let d = s
            .schedule(spec("d", TaskPriority::Normal).depends_on(TaskId::must("a")))
            .unwrap();
        assert_eq!(d.state, TaskState::Ready);

        let again = s.schedule(spec("a", TaskPriority::Normal)).unwrap_err();
        assert!(matches!(again, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_evicted_failed_dependency_breaks_dependent() {
        let (mut s, _) = scheduler_with(SchedulerConfig {
            completed_history_limit: 1,
            ..SchedulerConfig::default()
        });
        s.schedule(spec("a", TaskPriority::Normal)).unwrap();
        let a = s.get_next_task().unwrap();
        s.fail_task(&a.id, "boom", None).unwrap();
        s.schedule(spec("b", TaskPriority::Normal)).unwrap();
        let b = s.get_next_task().unwrap();
        s.complete_task(&b.id, None).unwrap();

        let d = s
            .schedule(spec("d", TaskPriority::Normal).depends_on(TaskId::must("a")))
            .unwrap();
        assert_eq!(d.state, TaskState::Failed);
    }

    #[test]
    fn test_oldest_wait_tracks_queue_head() {
        let (mut s, clock) = scheduler();
        assert!(s.oldest_wait().is_none());
        s.schedule(spec("first", TaskPriority::Low)).unwrap();
        clock.advance(std::time::Duration::from_secs(3));
        s.schedule(spec("second", TaskPriority::High)).unwrap();
        clock.advance(std::time::Duration::from_secs(2));
        assert_eq!(s.oldest_wait(), Some(chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_lifecycle_events_emitted() {
        let (mut s, _) = scheduler();
        let (seen, handler) = recorder::<TaskEvent>();
        s.subscribe("*", handler);

        s.schedule(spec("a", TaskPriority::Normal)).unwrap();
        let a = s.get_next_task().unwrap();
        s.complete_task(&a.id, None).unwrap();

        let kinds: Vec<&str> = seen.lock().unwrap().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["task:scheduled", "task:started", "task:completed"]);
    }
}
