//! Configuration structures.
//!
//! The kernel is configured through one serde document. Every section and
//! every field has a default, so `{}` is a valid configuration. Durations are
//! written in humantime form ("30s", "5m").

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::errors::Result;
use crate::kernel::process::ProcessConfig;
use crate::kernel::resources::ResourceConfig;
use crate::kernel::scheduler::SchedulerConfig;
use crate::kernel::security::SecurityConfig;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KernelConfig {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Task scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Quota, cost and pool configuration.
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Rate limiting and audit configuration.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Process lifecycle, checkpoint and recovery configuration.
    #[serde(default)]
    pub processes: ProcessConfig,
}

impl KernelConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load a JSON configuration document from disk.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
