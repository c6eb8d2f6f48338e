//! Per-process execution context and checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::types::{ProcessState, ResourceUsage};
use crate::types::{CheckpointId, ProcessId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub locals: BTreeMap<String, serde_json::Value>,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointReason {
    Manual,
    Periodic,
    Suspend,
}

/// Point-in-time snapshot used for resume and recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCheckpoint {
    pub id: CheckpointId,
    pub pid: ProcessId,
    pub taken_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    pub state: ProcessState,
    pub stack: Vec<StackFrame>,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub usage: ResourceUsage,
}

/// Call stack, variable bindings and the checkpoint ring of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessContext {
    pub stack: Vec<StackFrame>,
    pub variables: BTreeMap<String, serde_json::Value>,
    checkpoints: VecDeque<ProcessCheckpoint>,
    max_checkpoints: usize,
}

impl ProcessContext {
    pub fn new(max_checkpoints: usize) -> Self {
        Self {
            stack: Vec::new(),
            variables: BTreeMap::new(),
            checkpoints: VecDeque::new(),
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    pub fn push_frame(&mut self, name: impl Into<String>, now: DateTime<Utc>) {
        self.stack.push(StackFrame {
            name: name.into(),
            locals: BTreeMap::new(),
            entered_at: now,
        });
    }

    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        self.stack.pop()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.stack.last_mut()
    }

    /// Store a checkpoint, dropping the oldest once the ring is full.
    pub(crate) fn store(&mut self, checkpoint: ProcessCheckpoint) {
        while self.checkpoints.len() >= self.max_checkpoints {
            self.checkpoints.pop_front();
        }
        self.checkpoints.push_back(checkpoint);
    }

    /// Checkpoints, oldest first.
    pub fn checkpoints(&self) -> impl Iterator<Item = &ProcessCheckpoint> {
        self.checkpoints.iter()
    }

    pub fn latest_checkpoint(&self) -> Option<&ProcessCheckpoint> {
        self.checkpoints.back()
    }

    pub fn find_checkpoint(&self, id: &CheckpointId) -> Option<&ProcessCheckpoint> {
        self.checkpoints.iter().find(|c| &c.id == id)
    }

    /// Replace stack and variables with the checkpoint's copies.
    pub(crate) fn restore(&mut self, checkpoint: &ProcessCheckpoint) {
        self.stack = checkpoint.stack.clone();
        self.variables = checkpoint.variables.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn snapshot(ctx: &ProcessContext, n: u32) -> ProcessCheckpoint {
        ProcessCheckpoint {
            id: CheckpointId::must(&format!("ckpt_{n}")),
            pid: ProcessId::must("p"),
            taken_at: now(),
            reason: CheckpointReason::Manual,
            state: ProcessState::Running,
            stack: ctx.stack.clone(),
            variables: ctx.variables.clone(),
            usage: ResourceUsage::default(),
        }
    }

    #[test]
    fn test_ring_keeps_latest() {
        let mut ctx = ProcessContext::new(3);
        for n in 0..5 {
            let cp = snapshot(&ctx, n);
            ctx.store(cp);
        }
        let ids: Vec<&str> = ctx.checkpoints().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["ckpt_2", "ckpt_3", "ckpt_4"]);
        assert_eq!(ctx.latest_checkpoint().unwrap().id.as_str(), "ckpt_4");
    }

    #[test]
    fn test_restore_replaces_stack_and_variables() {
        let mut ctx = ProcessContext::new(10);
        ctx.push_frame("main", now());
        ctx.variables.insert("x".into(), json!(1));
        let cp = snapshot(&ctx, 1);
        ctx.store(cp.clone());

        ctx.push_frame("helper", now());
        ctx.variables.insert("x".into(), json!(2));
        ctx.variables.insert("y".into(), json!("tmp"));

        ctx.restore(&cp);
        assert_eq!(ctx.stack.len(), 1);
        assert_eq!(ctx.variables.get("x"), Some(&json!(1)));
        assert!(ctx.variables.get("y").is_none());
    }
}
