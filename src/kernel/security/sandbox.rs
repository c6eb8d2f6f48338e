//! Sandbox constraints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::capability::Permission;
use crate::kernel::resources::ResourceKind;
use crate::types::SandboxId;

/// Constraints applied to every access by a principal bound to the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// When non-empty, path resources must start with one of these.
    pub allowed_paths: Vec<String>,
    pub denied_paths: Vec<String>,
    /// When non-empty, `ToolUse` resources must be one of these.
    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,
    pub network_access: bool,
    /// Resource ceilings advertised to whoever runs the sandboxed work.
    pub limits: BTreeMap<ResourceKind, u64>,
    pub env: BTreeMap<String, String>,
}

impl SandboxConfig {
    /// Check `permission` on `resource` against the sandbox. `Err` carries the denial reason.
    ///
    /// `ToolUse` resources are tool names; every other resource is a path.
    pub fn check(&self, permission: Permission, resource: Option<&str>) -> Result<(), String> {
        if permission.is_network() && !self.network_access {
            return Err("Network access disabled by sandbox".to_string());
        }

        let Some(resource) = resource else {
            return Ok(());
        };

        if permission == Permission::ToolUse {
            if self.denied_tools.iter().any(|t| t == resource) {
                return Err(format!("Tool {} denied by sandbox", resource));
            }
            if !self.allowed_tools.is_empty() && !self.allowed_tools.iter().any(|t| t == resource) {
                return Err(format!("Tool {} not allowed by sandbox", resource));
            }
            return Ok(());
        }

        if self
            .denied_paths
            .iter()
            .any(|prefix| resource.starts_with(prefix.as_str()))
        {
            return Err(format!("Path {} denied by sandbox", resource));
        }
        if !self.allowed_paths.is_empty()
            && !self
                .allowed_paths
                .iter()
                .any(|prefix| resource.starts_with(prefix.as_str()))
        {
            return Err(format!("Path {} outside sandbox", resource));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: SandboxId,
    pub name: String,
    pub config: SandboxConfig,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SandboxConfig {
        SandboxConfig {
            allowed_paths: vec!["/workspace/".into()],
            denied_paths: vec!["/workspace/secrets/".into()],
            allowed_tools: vec!["grep".into(), "ls".into()],
            denied_tools: vec!["rm".into()],
            network_access: false,
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn test_paths() {
        let sb = config();
        assert!(sb.check(Permission::FileRead, Some("/workspace/a.txt")).is_ok());
        assert_eq!(
            sb.check(Permission::FileRead, Some("/workspace/secrets/key")),
            Err("Path /workspace/secrets/key denied by sandbox".to_string())
        );
        assert_eq!(
            sb.check(Permission::FileWrite, Some("/etc/hosts")),
            Err("Path /etc/hosts outside sandbox".to_string())
        );
        assert!(sb.check(Permission::MemoryAccess, None).is_ok());
    }

    #[test]
    fn test_tools() {
        let sb = config();
        assert!(sb.check(Permission::ToolUse, Some("grep")).is_ok());
        assert!(sb.check(Permission::ToolUse, Some("rm")).is_err());
        assert!(sb.check(Permission::ToolUse, Some("curl")).is_err());
    }

    #[test]
    fn test_network_disabled() {
        let sb = config();
        assert!(sb.check(Permission::NetworkRead, None).is_err());
        let open = SandboxConfig {
            network_access: true,
            ..SandboxConfig::default()
        };
        assert!(open.check(Permission::NetworkWrite, Some("https://example.com")).is_ok());
    }
}
