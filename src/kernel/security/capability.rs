//! Permissions, security levels and capabilities.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::kernel::rate_limiter::{RateLimitConfig, SlidingWindow};
use crate::types::{CapabilityId, PrincipalId};

/// Individual permission checked by `check_access`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    FileRead,
    FileWrite,
    FileDelete,
    Execute,
    NetworkRead,
    NetworkWrite,
    ToolUse,
    ToolInstall,
    ProcessSpawn,
    ProcessSignal,
    MemoryAccess,
    ResourceAllocate,
    SystemConfig,
    AuditRead,
    Admin,
}

impl Permission {
    pub const ALL: [Permission; 15] = [
        Permission::FileRead,
        Permission::FileWrite,
        Permission::FileDelete,
        Permission::Execute,
        Permission::NetworkRead,
        Permission::NetworkWrite,
        Permission::ToolUse,
        Permission::ToolInstall,
        Permission::ProcessSpawn,
        Permission::ProcessSignal,
        Permission::MemoryAccess,
        Permission::ResourceAllocate,
        Permission::SystemConfig,
        Permission::AuditRead,
        Permission::Admin,
    ];

    pub fn is_network(self) -> bool {
        matches!(self, Permission::NetworkRead | Permission::NetworkWrite)
    }
}

/// Kind of identity behind a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    Task,
    Agent,
    User,
    System,
}

impl PrincipalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PrincipalKind::Task => "task",
            PrincipalKind::Agent => "agent",
            PrincipalKind::User => "user",
            PrincipalKind::System => "system",
        }
    }
}

/// Trust tier. Each level's default bundle contains every less trusted level's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Unrestricted,
    Trusted,
    Standard,
    Restricted,
    Sandboxed,
}

impl SecurityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::Unrestricted => "unrestricted",
            SecurityLevel::Trusted => "trusted",
            SecurityLevel::Standard => "standard",
            SecurityLevel::Restricted => "restricted",
            SecurityLevel::Sandboxed => "sandboxed",
        }
    }

    /// Permissions granted by the level's default capability.
    pub fn default_permissions(self) -> BTreeSet<Permission> {
        use Permission::*;
        let mut perms: BTreeSet<Permission> = [FileRead].into();
        if self <= SecurityLevel::Restricted {
            perms.extend([ToolUse, MemoryAccess]);
        }
        if self <= SecurityLevel::Standard {
            perms.extend([FileWrite, NetworkRead, ProcessSpawn, ResourceAllocate]);
        }
        if self <= SecurityLevel::Trusted {
            perms.extend([FileDelete, Execute, NetworkWrite, ProcessSignal, ToolInstall]);
        }
        if self == SecurityLevel::Unrestricted {
            perms.extend(Permission::ALL);
        }
        perms
    }
}

/// Daily UTC time-of-day window. `end < start` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let t = at.time();
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Name given to the capability installed by a security level.
pub(crate) fn level_capability_name(level: SecurityLevel) -> String {
    format!("level:{}", level.as_str())
}

/// Revocable permission bundle held by a principal.
///
/// Validity is recomputed on every check from the current time and use counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub name: String,
    pub permissions: BTreeSet<Permission>,
    /// Resource prefix the capability is limited to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u64>,
    pub use_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    /// Maximum granting uses per minute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(skip)]
    recent_uses: SlidingWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_by: Option<PrincipalId>,
    pub granted_at: DateTime<Utc>,
}

impl Capability {
    /// Unconstrained capability. `id` and `granted_at` are replaced on grant.
    pub fn new(name: impl Into<String>, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            id: CapabilityId::new(),
            name: name.into(),
            permissions: permissions.into_iter().collect(),
            scope: None,
            expires_at: None,
            max_uses: None,
            use_count: 0,
            time_window: None,
            rate_limit: None,
            recent_uses: SlidingWindow::new(),
            granted_by: None,
            granted_at: DateTime::<Utc>::default(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_max_uses(mut self, max_uses: u64) -> Self {
        self.max_uses = Some(max_uses);
        self
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit = Some(per_minute);
        self
    }

    pub fn granted_by(mut self, grantor: PrincipalId) -> Self {
        self.granted_by = Some(grantor);
        self
    }

    /// Why the capability cannot be used at `now`, if it cannot.
    pub fn invalid_reason(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if self.expires_at.is_some_and(|at| at <= now) {
            return Some("expired");
        }
        if self.max_uses.is_some_and(|max| self.use_count >= max) {
            return Some("usage limit reached");
        }
        if self.time_window.is_some_and(|w| !w.contains(now)) {
            return Some("outside time window");
        }
        if let Some(limit) = self.rate_limit {
            if !self.recent_uses.would_admit(RateLimitConfig::per_minute(limit), now) {
                return Some("rate limited");
            }
        }
        None
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.invalid_reason(now).is_none()
    }

    /// Does this capability cover `permission` on `resource` at `now`?
    pub fn grants(&self, permission: Permission, resource: Option<&str>, now: DateTime<Utc>) -> bool {
        if !self.permissions.contains(&permission) || !self.is_valid(now) {
            return false;
        }
        match (&self.scope, resource) {
            (None, _) => true,
            (Some(scope), Some(resource)) => resource.starts_with(scope.as_str()),
            (Some(_), None) => false,
        }
    }

    /// Count a granting use.
    pub(crate) fn record_use(&mut self, now: DateTime<Utc>) {
        self.use_count += 1;
        if let Some(limit) = self.rate_limit {
            self.recent_uses.record(RateLimitConfig::per_minute(limit), now);
        }
    }
}
