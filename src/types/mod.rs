//! Core types for the kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (TaskId, ProcessId, PrincipalId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: The aggregate kernel configuration document

mod config;
mod errors;
mod ids;

pub use config::{KernelConfig, ObservabilityConfig};
pub use errors::{Error, Result};
pub use ids::{
    AuditEntryId, CapabilityId, CheckpointId, GroupId, MessageId, PolicyId, PoolId, PrincipalId,
    ProcessId, RequestId, RuleId, SandboxId, TaskId,
};
