//! Process descriptors and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::kernel::types::TaskPriority;
use crate::types::{GroupId, ProcessId};

/// Process lifecycle state.
///
/// State transitions:
/// ```text
/// CREATED → READY → RUNNING ↔ {WAITING | SUSPENDED | BLOCKED}
///                      ↓
///            {TERMINATED → ZOMBIE | FAILED → READY (recovery)}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Created,
    Ready,
    Running,
    Waiting,
    Suspended,
    Blocked,
    Terminated,
    Failed,
    Zombie,
}

impl ProcessState {
    /// No further work happens in these states (recovery aside).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Terminated | ProcessState::Failed | ProcessState::Zombie
        )
    }

    /// Counted as healthy by the health monitor.
    pub fn is_healthy(self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::Waiting | ProcessState::Ready
        )
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        use ProcessState::*;
        match (self, to) {
            (Created, Ready) | (Created, Running) => true,
            (Ready, Running) | (Ready, Suspended) => true,
            (Running, Waiting) | (Running, Blocked) | (Running, Suspended) => true,
            (Waiting, Running) | (Blocked, Running) => true,
            (Waiting, Suspended) | (Blocked, Suspended) => true,
            (Suspended, Ready) | (Suspended, Running) => true,
            (Suspended, Waiting) | (Suspended, Blocked) => true,
            (Failed, Ready) => true, // Recovery
            (Terminated, Zombie) => true,
            (from, Terminated) | (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    #[default]
    Agent,
    Task,
    Tool,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationMode {
    /// SIGTERM-style: exit code 0.
    Graceful,
    /// SIGKILL-style: exit code 137.
    Forced,
}

impl TerminationMode {
    pub fn exit_code(self) -> i32 {
        match self {
            TerminationMode::Graceful => 0,
            TerminationMode::Forced => 137,
        }
    }
}

/// Resource usage counters tracked per process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tokens: u64,
    pub tool_calls: u64,
    pub cpu_time_ms: u64,
    pub memory_mb: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl ResourceUsage {
    pub fn add(&mut self, other: &ResourceUsage) {
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.tool_calls = self.tool_calls.saturating_add(other.tool_calls);
        self.cpu_time_ms = self.cpu_time_ms.saturating_add(other.cpu_time_ms);
        self.memory_mb = self.memory_mb.max(other.memory_mb);
        self.messages_sent = self.messages_sent.saturating_add(other.messages_sent);
        self.messages_received = self.messages_received.saturating_add(other.messages_received);
    }
}

/// Caller-side description of a process to create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub kind: ProcessKind,
    pub parent: Option<ProcessId>,
    pub priority: TaskPriority,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: ProcessKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn child_of(mut self, parent: ProcessId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Process descriptor - the kernel's record of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub pid: ProcessId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<ProcessId>,
    pub name: String,
    pub kind: ProcessKind,
    pub state: ProcessState,
    pub priority: TaskPriority,

    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,

    pub usage: ResourceUsage,
    pub restart_count: u32,

    /// State to return to on resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_from: Option<ProcessState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ProcessDescriptor {
    pub(crate) fn from_spec(pid: ProcessId, spec: ProcessSpec, now: DateTime<Utc>) -> Self {
        Self {
            pid,
            parent_pid: spec.parent,
            name: spec.name,
            kind: spec.kind,
            state: ProcessState::Created,
            priority: spec.priority,
            created_at: now,
            started_at: None,
            state_changed_at: now,
            terminated_at: None,
            exit_code: None,
            exit_reason: None,
            usage: ResourceUsage::default(),
            restart_count: 0,
            suspended_from: None,
            group_id: None,
            metadata: spec.metadata,
        }
    }
}
