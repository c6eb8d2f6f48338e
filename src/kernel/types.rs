//! Kernel types shared by the scheduler and the process manager:
//! priorities, task states, cost estimates and the schedulable task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::TaskId;

/// Scheduling priority. Declaration order is urgency order, so the derived
/// `Ord` puts `Critical` first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl TaskPriority {
    /// Ordinal value (lower = more urgent).
    pub fn ordinal(self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
            TaskPriority::Background => 4,
        }
    }

    /// One step more urgent, saturating at `Critical`.
    pub fn boosted(self) -> Self {
        match self {
            TaskPriority::Critical | TaskPriority::High => TaskPriority::Critical,
            TaskPriority::Normal => TaskPriority::High,
            TaskPriority::Low => TaskPriority::Normal,
            TaskPriority::Background => TaskPriority::Low,
        }
    }
}

/// Task lifecycle state.
///
/// State transitions:
/// ```text
/// PENDING → READY → RUNNING → {WAITING | BLOCKED} → READY → RUNNING
///    ↓                  ↓
/// WAITING (deps)   {COMPLETED | FAILED | CANCELLED}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Waiting,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Pending, Ready) | (Pending, Waiting) => true,
            (Ready, Running) => true,
            (Running, Ready) => true, // Preempted
            (Running, Waiting) | (Running, Blocked) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Waiting, Ready) | (Blocked, Ready) => true,
            (Waiting, Failed) => true, // Dependency never completed
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Why a task sits in the side table instead of the ready queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum WaitReason {
    /// Admitted before its dependencies completed.
    Dependencies,
    /// Running task yielded via `wait_task`.
    Yielded,
    /// Running task blocked via `block_task`.
    Blocked(String),
}

/// Estimated or measured resource cost of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceCost {
    pub tokens: u64,
    pub tool_calls: u64,
    pub cpu_time_ms: u64,
}

impl ResourceCost {
    pub fn new(tokens: u64, tool_calls: u64, cpu_time_ms: u64) -> Self {
        Self {
            tokens,
            tool_calls,
            cpu_time_ms,
        }
    }

    pub fn tokens(tokens: u64) -> Self {
        Self {
            tokens,
            ..Self::default()
        }
    }

    /// Scalar magnitude used by the fair-share and cost-aware comparators.
    pub fn units(&self) -> u64 {
        self.tokens
            .saturating_add(self.tool_calls)
            .saturating_add(self.cpu_time_ms)
    }
}

/// Caller-side description of a task to admit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Explicit id; generated when absent.
    pub id: Option<TaskId>,
    /// Entity (agent, user, tenant) that owns the task.
    pub owner_id: String,
    pub priority: TaskPriority,
    pub estimated_cost: ResourceCost,
    pub deadline: Option<DateTime<Utc>>,
    pub dependencies: Vec<TaskId>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost(mut self, cost: ResourceCost) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Scheduler's record of an admitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulableTask {
    pub id: TaskId,
    pub owner_id: String,
    pub priority: TaskPriority,
    /// Priority at admission, before any starvation boosts.
    pub base_priority: TaskPriority,
    pub state: TaskState,
    pub estimated_cost: ResourceCost,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<ResourceCost>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    /// When the task last entered the ready queue; starvation is measured from here.
    pub enqueued_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    pub dependencies: Vec<TaskId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<WaitReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub boost_count: u32,
    /// Admission sequence number; final FIFO tie-break.
    pub sequence: u64,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SchedulableTask {
    pub(crate) fn from_spec(
        id: TaskId,
        spec: TaskSpec,
        now: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            id,
            owner_id: spec.owner_id,
            priority: spec.priority,
            base_priority: spec.priority,
            state: TaskState::Pending,
            estimated_cost: spec.estimated_cost,
            actual_cost: None,
            deadline: spec.deadline,
            created_at: now,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
            dependencies: spec.dependencies,
            wait_reason: None,
            error: None,
            boost_count: 0,
            sequence,
            metadata: spec.metadata,
        }
    }

    /// Wall time spent running, once finished.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
