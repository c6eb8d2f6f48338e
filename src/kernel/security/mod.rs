//! Capability-based security.
//!
//! `check_access` walks a fixed pipeline and stops at the first stage that
//! decides:
//!
//! 1. principal lookup (unknown principals are denied)
//! 2. per-principal rate limit
//! 3. policies, highest priority first (audit rules log and continue)
//! 4. capabilities held by the principal
//! 5. the principal's sandbox, if bound to one
//!
//! Every decision appends one audit entry and emits one access event.
//!
//! NOT a separate actor - owned by Kernel and called via &mut self.

mod audit;
mod capability;
mod policy;
mod sandbox;

pub use audit::{AuditKind, AuditLog, AuditLogEntry, AuditQuery};
pub use capability::{Capability, Permission, PrincipalKind, SecurityLevel, TimeWindow};
pub use policy::{
    ConditionField, ConditionOp, RuleAction, RuleCondition, SecurityPolicy, SecurityRule,
};
pub use sandbox::{Sandbox, SandboxConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::clock::KernelContext;
use super::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::events::{BusEvent, EventBus, SubscriptionId};
use crate::types::{
    AuditEntryId, CapabilityId, Error, PolicyId, PrincipalId, Result, RuleId, SandboxId,
};
use capability::level_capability_name;
use policy::{evaluate, AccessSubject};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    #[serde(with = "humantime_serde")]
    pub rate_limit_window: Duration,
    /// Access checks allowed per principal per window.
    pub rate_limit_max_requests: u32,
    /// Audit entries kept before the oldest are evicted.
    pub audit_retention: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_requests: 100,
            audit_retention: 10_000,
        }
    }
}

// =============================================================================
// Principals, requests, decisions
// =============================================================================

/// Identity that holds capabilities and is the subject of access decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPrincipal {
    pub id: PrincipalId,
    pub kind: PrincipalKind,
    pub level: SecurityLevel,
    pub capabilities: Vec<Capability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<SandboxId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub principal_id: PrincipalId,
    pub permission: Permission,
    /// Path, tool name or URL the permission is exercised on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl AccessRequest {
    pub fn new(principal_id: PrincipalId, permission: Permission) -> Self {
        Self {
            principal_id,
            permission,
            resource: None,
        }
    }

    pub fn on(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Pipeline stage that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStage {
    Principal,
    RateLimit,
    Policy,
    Capability,
    Sandbox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
    pub stage: DecisionStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    pub audit_id: AuditEntryId,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityEvent {
    AccessGranted {
        principal_id: PrincipalId,
        permission: Permission,
        resource: Option<String>,
    },
    AccessDenied {
        principal_id: PrincipalId,
        permission: Permission,
        resource: Option<String>,
        reason: String,
    },
    CapabilityGranted {
        principal_id: PrincipalId,
        capability_id: CapabilityId,
    },
    CapabilityRevoked {
        principal_id: PrincipalId,
        capability_id: CapabilityId,
    },
    SandboxCreated {
        sandbox_id: SandboxId,
    },
    SandboxDestroyed {
        sandbox_id: SandboxId,
    },
    Violation {
        principal_id: PrincipalId,
        severity: ViolationSeverity,
        description: String,
    },
    PolicyUpdated {
        policy_id: PolicyId,
    },
    AuditLogged {
        entry_id: AuditEntryId,
        kind: AuditKind,
    },
}

impl BusEvent for SecurityEvent {
    fn kind(&self) -> &'static str {
        match self {
            SecurityEvent::AccessGranted { .. } => "access:granted",
            SecurityEvent::AccessDenied { .. } => "access:denied",
            SecurityEvent::CapabilityGranted { .. } => "capability:granted",
            SecurityEvent::CapabilityRevoked { .. } => "capability:revoked",
            SecurityEvent::SandboxCreated { .. } => "sandbox:created",
            SecurityEvent::SandboxDestroyed { .. } => "sandbox:destroyed",
            SecurityEvent::Violation { .. } => "security:violation",
            SecurityEvent::PolicyUpdated { .. } => "policy:updated",
            SecurityEvent::AuditLogged { .. } => "audit:logged",
        }
    }
}

/// Audit entry fields other than id and timestamp.
struct AuditRecord {
    kind: AuditKind,
    principal_id: Option<PrincipalId>,
    permission: Option<Permission>,
    resource: Option<String>,
    detail: String,
}

impl AuditRecord {
    fn about(kind: AuditKind, principal_id: &PrincipalId, detail: impl Into<String>) -> Self {
        Self {
            kind,
            principal_id: Some(principal_id.clone()),
            permission: None,
            resource: None,
            detail: detail.into(),
        }
    }
}

/// What a pipeline stage concluded.
struct Verdict {
    allowed: bool,
    reason: String,
    stage: DecisionStage,
    capability_id: Option<CapabilityId>,
    policy_id: Option<PolicyId>,
    rule_id: Option<RuleId>,
}

impl Verdict {
    fn deny(stage: DecisionStage, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            stage,
            capability_id: None,
            policy_id: None,
            rule_id: None,
        }
    }
}

// =============================================================================
// SecurityModule
// =============================================================================

#[derive(Debug)]
pub struct SecurityModule {
    config: SecurityConfig,
    ctx: KernelContext,
    principals: HashMap<PrincipalId, SecurityPrincipal>,
    sandboxes: HashMap<SandboxId, Sandbox>,
    policies: Vec<SecurityPolicy>,
    rate_limiter: RateLimiter,
    audit: AuditLog,
    violations: HashMap<PrincipalId, u32>,
    events: EventBus<SecurityEvent>,
}

impl SecurityModule {
    pub fn new(config: SecurityConfig, ctx: KernelContext) -> Self {
        Self {
            rate_limiter: RateLimiter::new(RateLimitConfig::new(
                config.rate_limit_window,
                config.rate_limit_max_requests,
            )),
            audit: AuditLog::new(config.audit_retention),
            config,
            ctx,
            principals: HashMap::new(),
            sandboxes: HashMap::new(),
            policies: Vec::new(),
            violations: HashMap::new(),
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn subscribe<F>(&mut self, kind: &str, handler: F) -> SubscriptionId
    where
        F: FnMut(&SecurityEvent) + Send + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn events(&self) -> &EventBus<SecurityEvent> {
        &self.events
    }

    fn log(&mut self, record: AuditRecord) -> AuditEntryId {
        let id = AuditEntryId::generate(self.ctx.ids.as_ref());
        let kind = record.kind;
        self.audit.append(AuditLogEntry {
            id: id.clone(),
            timestamp: self.ctx.now(),
            kind,
            principal_id: record.principal_id,
            permission: record.permission,
            resource: record.resource,
            detail: record.detail,
        });
        self.events.emit(SecurityEvent::AuditLogged {
            entry_id: id.clone(),
            kind,
        });
        id
    }

    fn principal_mut(&mut self, id: &PrincipalId) -> Result<&mut SecurityPrincipal> {
        self.principals
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("unknown principal: {}", id)))
    }

    // =========================================================================
    // Principals and levels
    // =========================================================================

    /// Register a principal with the default capability bundle of `level`.
    pub fn register_principal(
        &mut self,
        id: PrincipalId,
        kind: PrincipalKind,
        level: SecurityLevel,
    ) -> Result<&SecurityPrincipal> {
        if self.principals.contains_key(&id) {
            return Err(Error::already_exists(format!("principal {} already registered", id)));
        }
        let now = self.ctx.now();
        let bundle = self.level_capability(level, now);
        self.principals.insert(
            id.clone(),
            SecurityPrincipal {
                id: id.clone(),
                kind,
                level,
                capabilities: vec![bundle],
                sandbox_id: None,
                created_at: now,
            },
        );

        tracing::debug!("principal_registered: id={}, kind={:?}, level={:?}", id, kind, level);
        self.log(AuditRecord::about(
            AuditKind::PrincipalRegistered,
            &id,
            format!("registered as {} at level {}", kind.as_str(), level.as_str()),
        ));
        self.principals
            .get(&id)
            .ok_or_else(|| Error::internal("principal vanished during registration"))
    }

    pub fn remove_principal(&mut self, id: &PrincipalId) -> Result<SecurityPrincipal> {
        let removed = self
            .principals
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("unknown principal: {}", id)))?;
        self.rate_limiter.clear(id.as_str());
        self.log(AuditRecord::about(AuditKind::PrincipalRemoved, id, "removed"));
        Ok(removed)
    }

    pub fn get_principal(&self, id: &PrincipalId) -> Option<&SecurityPrincipal> {
        self.principals.get(id)
    }

    fn level_capability(&self, level: SecurityLevel, now: DateTime<Utc>) -> Capability {
        let mut cap = Capability::new(level_capability_name(level), level.default_permissions());
        cap.id = CapabilityId::generate(self.ctx.ids.as_ref());
        cap.granted_at = now;
        cap
    }

    /// Change a principal's level and swap its level bundle. Explicit grants are kept.
    pub fn set_security_level(&mut self, id: &PrincipalId, level: SecurityLevel) -> Result<()> {
        let now = self.ctx.now();
        let bundle = self.level_capability(level, now);
        let principal = self.principal_mut(id)?;
        let previous = principal.level;
        let old_name = level_capability_name(previous);

        principal.capabilities.retain(|c| c.name != old_name);
        principal.capabilities.insert(0, bundle);
        principal.level = level;

        tracing::info!("security_level_changed: principal={}, from={:?}, to={:?}", id, previous, level);
        self.log(AuditRecord::about(
            AuditKind::LevelChanged,
            id,
            format!("{} -> {}", previous.as_str(), level.as_str()),
        ));
        Ok(())
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    /// Grant `capability` to a principal. Returns the id assigned to it.
    pub fn grant_capability(&mut self, id: &PrincipalId, mut capability: Capability) -> Result<CapabilityId> {
        capability.id = CapabilityId::generate(self.ctx.ids.as_ref());
        capability.granted_at = self.ctx.now();
        let capability_id = capability.id.clone();
        let name = capability.name.clone();

        self.principal_mut(id)?.capabilities.push(capability);

        tracing::debug!("capability_granted: principal={}, capability={}, name={}", id, capability_id, name);
        self.log(AuditRecord::about(
            AuditKind::CapabilityGranted,
            id,
            format!("granted {} ({})", name, capability_id),
        ));
        self.events.emit(SecurityEvent::CapabilityGranted {
            principal_id: id.clone(),
            capability_id: capability_id.clone(),
        });
        Ok(capability_id)
    }

    pub fn revoke_capability(&mut self, id: &PrincipalId, capability_id: &CapabilityId) -> Result<()> {
        let principal = self.principal_mut(id)?;
        let before = principal.capabilities.len();
        principal.capabilities.retain(|c| &c.id != capability_id);
        if principal.capabilities.len() == before {
            return Err(Error::not_found(format!(
                "principal {} holds no capability {}",
                id, capability_id
            )));
        }

        tracing::debug!("capability_revoked: principal={}, capability={}", id, capability_id);
        self.log(AuditRecord::about(
            AuditKind::CapabilityRevoked,
            id,
            format!("revoked {}", capability_id),
        ));
        self.events.emit(SecurityEvent::CapabilityRevoked {
            principal_id: id.clone(),
            capability_id: capability_id.clone(),
        });
        Ok(())
    }

    // =========================================================================
    // Sandboxes
    // =========================================================================

    pub fn create_sandbox(&mut self, name: impl Into<String>, config: SandboxConfig) -> SandboxId {
        let id = SandboxId::generate(self.ctx.ids.as_ref());
        let name = name.into();
        self.sandboxes.insert(
            id.clone(),
            Sandbox {
                id: id.clone(),
                name: name.clone(),
                config,
                created_at: self.ctx.now(),
            },
        );

        tracing::debug!("sandbox_created: id={}, name={}", id, name);
        self.log(AuditRecord {
            kind: AuditKind::SandboxCreated,
            principal_id: None,
            permission: None,
            resource: None,
            detail: format!("created sandbox {} ({})", name, id),
        });
        self.events.emit(SecurityEvent::SandboxCreated { sandbox_id: id.clone() });
        id
    }

    pub fn assign_sandbox(&mut self, id: &PrincipalId, sandbox_id: &SandboxId) -> Result<()> {
        if !self.sandboxes.contains_key(sandbox_id) {
            return Err(Error::not_found(format!("unknown sandbox: {}", sandbox_id)));
        }
        self.principal_mut(id)?.sandbox_id = Some(sandbox_id.clone());
        tracing::debug!("sandbox_assigned: principal={}, sandbox={}", id, sandbox_id);
        Ok(())
    }

    /// Destroy a sandbox and unbind every principal using it.
    pub fn destroy_sandbox(&mut self, sandbox_id: &SandboxId) -> Result<()> {
        self.sandboxes
            .remove(sandbox_id)
            .ok_or_else(|| Error::not_found(format!("unknown sandbox: {}", sandbox_id)))?;

        for principal in self.principals.values_mut() {
            if principal.sandbox_id.as_ref() == Some(sandbox_id) {
                principal.sandbox_id = None;
            }
        }

        tracing::debug!("sandbox_destroyed: id={}", sandbox_id);
        self.log(AuditRecord {
            kind: AuditKind::SandboxDestroyed,
            principal_id: None,
            permission: None,
            resource: None,
            detail: format!("destroyed sandbox {}", sandbox_id),
        });
        self.events.emit(SecurityEvent::SandboxDestroyed {
            sandbox_id: sandbox_id.clone(),
        });
        Ok(())
    }

    pub fn get_sandbox(&self, sandbox_id: &SandboxId) -> Option<&Sandbox> {
        self.sandboxes.get(sandbox_id)
    }

    // =========================================================================
    // Policies
    // =========================================================================

    /// Install a policy. Rules without an id get one.
    pub fn add_policy(&mut self, name: impl Into<String>, priority: i32, rules: Vec<SecurityRule>) -> PolicyId {
        let id = PolicyId::generate(self.ctx.ids.as_ref());
        let name = name.into();
        let rules = rules
            .into_iter()
            .map(|mut rule| {
                if rule.id.is_none() {
                    rule.id = Some(RuleId::generate(self.ctx.ids.as_ref()));
                }
                rule
            })
            .collect();

        self.policies.push(SecurityPolicy {
            id: id.clone(),
            name: name.clone(),
            priority,
            enabled: true,
            rules,
        });
        self.policy_updated(&id, format!("added policy {} (priority {})", name, priority));
        id
    }

    pub fn remove_policy(&mut self, id: &PolicyId) -> Result<SecurityPolicy> {
        let idx = self
            .policies
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| Error::not_found(format!("unknown policy: {}", id)))?;
        let removed = self.policies.remove(idx);
        self.policy_updated(id, format!("removed policy {}", removed.name));
        Ok(removed)
    }

    pub fn set_policy_enabled(&mut self, id: &PolicyId, enabled: bool) -> Result<()> {
        let policy = self
            .policies
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| Error::not_found(format!("unknown policy: {}", id)))?;
        policy.enabled = enabled;
        self.policy_updated(id, format!("policy enabled={}", enabled));
        Ok(())
    }

    pub fn policies(&self) -> &[SecurityPolicy] {
        &self.policies
    }

    fn policy_updated(&mut self, id: &PolicyId, detail: String) {
        tracing::info!("policy_updated: id={}, {}", id, detail);
        self.log(AuditRecord {
            kind: AuditKind::PolicyUpdated,
            principal_id: None,
            permission: None,
            resource: None,
            detail,
        });
        self.events.emit(SecurityEvent::PolicyUpdated { policy_id: id.clone() });
    }

    // =========================================================================
    // Access checks
    // =========================================================================

    /// Decide an access request. Denials are data, never errors.
    pub fn check_access(&mut self, request: &AccessRequest) -> AccessDecision {
        let now = self.ctx.now();
        let verdict = self.decide(request, now);

        let resource = request.resource.clone();
        let audit_id = self.log(AuditRecord {
            kind: if verdict.allowed {
                AuditKind::AccessGranted
            } else {
                AuditKind::AccessDenied
            },
            principal_id: Some(request.principal_id.clone()),
            permission: Some(request.permission),
            resource: resource.clone(),
            detail: verdict.reason.clone(),
        });

        if verdict.allowed {
            tracing::debug!(
                "access_granted: principal={}, permission={:?}, resource={:?}, stage={:?}",
                request.principal_id,
                request.permission,
                resource,
                verdict.stage
            );
            self.events.emit(SecurityEvent::AccessGranted {
                principal_id: request.principal_id.clone(),
                permission: request.permission,
                resource,
            });
        } else {
            tracing::warn!(
                "access_denied: principal={}, permission={:?}, resource={:?}, reason={}",
                request.principal_id,
                request.permission,
                resource,
                verdict.reason
            );
            self.events.emit(SecurityEvent::AccessDenied {
                principal_id: request.principal_id.clone(),
                permission: request.permission,
                resource,
                reason: verdict.reason.clone(),
            });
        }

        AccessDecision {
            allowed: verdict.allowed,
            reason: verdict.reason,
            stage: verdict.stage,
            capability_id: verdict.capability_id,
            policy_id: verdict.policy_id,
            rule_id: verdict.rule_id,
            audit_id,
            decided_at: now,
        }
    }

    /// True if `check_access` would allow. Still audited and rate limited.
    pub fn is_allowed(&mut self, request: &AccessRequest) -> bool {
        self.check_access(request).allowed
    }

    fn decide(&mut self, request: &AccessRequest, now: DateTime<Utc>) -> Verdict {
        let Some(principal) = self.principals.get(&request.principal_id) else {
            return Verdict::deny(DecisionStage::Principal, "Unknown principal");
        };
        let (kind, level, sandbox_id) = (principal.kind, principal.level, principal.sandbox_id.clone());

        if self
            .rate_limiter
            .check_rate_limit(request.principal_id.as_str(), now)
            .is_err()
        {
            return Verdict::deny(DecisionStage::RateLimit, "Rate limit exceeded");
        }

        let subject = AccessSubject {
            principal_id: &request.principal_id,
            kind,
            level,
            permission: request.permission,
            resource: request.resource.as_deref(),
        };
        let policy_verdict = evaluate(&self.policies, &subject);

        for hit in &policy_verdict.audited {
            self.log(AuditRecord {
                kind: AuditKind::PolicyAudit,
                principal_id: Some(request.principal_id.clone()),
                permission: Some(request.permission),
                resource: request.resource.clone(),
                detail: format!("matched audit rule in policy {}", hit.policy_name),
            });
        }

        if let Some(hit) = policy_verdict.decision {
            let allowed = hit.action == RuleAction::Allow;
            return Verdict {
                allowed,
                reason: if allowed {
                    format!("Allowed by policy {}", hit.policy_name)
                } else {
                    format!("Denied by policy {}", hit.policy_name)
                },
                stage: DecisionStage::Policy,
                capability_id: None,
                policy_id: Some(hit.policy_id),
                rule_id: hit.rule_id,
            };
        }

        let resource = request.resource.as_deref();
        let Some(capability_id) = self.principals.get(&request.principal_id).and_then(|p| {
            p.capabilities
                .iter()
                .find(|c| c.grants(request.permission, resource, now))
                .map(|c| c.id.clone())
        }) else {
            return Verdict::deny(DecisionStage::Capability, "Permission not granted");
        };

        if let Some(sandbox) = sandbox_id.as_ref().and_then(|id| self.sandboxes.get(id)) {
            if let Err(reason) = sandbox.config.check(request.permission, resource) {
                return Verdict {
                    capability_id: Some(capability_id),
                    ..Verdict::deny(DecisionStage::Sandbox, reason)
                };
            }
        }

        if let Some(cap) = self
            .principals
            .get_mut(&request.principal_id)
            .and_then(|p| p.capabilities.iter_mut().find(|c| c.id == capability_id))
        {
            cap.record_use(now);
        }

        Verdict {
            allowed: true,
            reason: "Access granted".to_string(),
            stage: if sandbox_id.is_some() {
                DecisionStage::Sandbox
            } else {
                DecisionStage::Capability
            },
            capability_id: Some(capability_id),
            policy_id: None,
            rule_id: None,
        }
    }

    // =========================================================================
    // Violations and audit
    // =========================================================================

    /// Record a violation. A critical violation drops the principal to `Sandboxed`.
    pub fn report_violation(
        &mut self,
        id: &PrincipalId,
        severity: ViolationSeverity,
        description: impl Into<String>,
    ) -> Result<()> {
        if !self.principals.contains_key(id) {
            return Err(Error::not_found(format!("unknown principal: {}", id)));
        }
        let description = description.into();
        *self.violations.entry(id.clone()).or_default() += 1;

        tracing::warn!(
            "security_violation: principal={}, severity={:?}, description={}",
            id,
            severity,
            description
        );
        self.log(AuditRecord::about(
            AuditKind::Violation,
            id,
            format!("{:?}: {}", severity, description),
        ));
        self.events.emit(SecurityEvent::Violation {
            principal_id: id.clone(),
            severity,
            description,
        });

        if severity == ViolationSeverity::Critical {
            self.set_security_level(id, SecurityLevel::Sandboxed)?;
        }
        Ok(())
    }

    pub fn violation_count(&self, id: &PrincipalId) -> u32 {
        self.violations.get(id).copied().unwrap_or(0)
    }

    pub fn audit_log(&self, query: &AuditQuery) -> Vec<&AuditLogEntry> {
        self.audit.query(query)
    }

    pub fn audit_len(&self) -> usize {
        self.audit.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::recorder;
    use crate::kernel::clock::ManualClock;
    use std::sync::Arc;

    fn module_with(config: SecurityConfig) -> (SecurityModule, Arc<ManualClock>) {
        let (ctx, clock) = KernelContext::deterministic();
        (SecurityModule::new(config, ctx), clock)
    }

    fn module() -> (SecurityModule, Arc<ManualClock>) {
        module_with(SecurityConfig::default())
    }

    fn pid(s: &str) -> PrincipalId {
        PrincipalId::must(s)
    }

    fn register(sm: &mut SecurityModule, id: &str, level: SecurityLevel) -> PrincipalId {
        sm.register_principal(pid(id), PrincipalKind::Agent, level).unwrap();
        pid(id)
    }

    #[test]
    fn test_unknown_principal_denied() {
        let (mut sm, _) = module();
        let decision = sm.check_access(&AccessRequest::new(pid("ghost"), Permission::FileRead));
        assert!(!decision.allowed);
        assert_eq!(decision.stage, DecisionStage::Principal);
        assert_eq!(decision.reason, "Unknown principal");
    }

    #[test]
    fn test_restricted_cannot_write() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "agent", SecurityLevel::Restricted);

        let write = sm.check_access(&AccessRequest::new(p.clone(), Permission::FileWrite));
        assert!(!write.allowed);
        assert_eq!(write.reason, "Permission not granted");

        let read = sm.check_access(&AccessRequest::new(p, Permission::FileRead));
        assert!(read.allowed);
        assert_eq!(read.stage, DecisionStage::Capability);
    }

    #[test]
    fn test_duplicate_registration() {
        let (mut sm, _) = module();
        register(&mut sm, "a", SecurityLevel::Standard);
        let err = sm
            .register_principal(pid("a"), PrincipalKind::User, SecurityLevel::Trusted)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_rate_limit_denies() {
        let (mut sm, clock) = module_with(SecurityConfig {
            rate_limit_max_requests: 2,
            rate_limit_window: Duration::from_secs(10),
            ..SecurityConfig::default()
        });
        let p = register(&mut sm, "a", SecurityLevel::Standard);
        let req = AccessRequest::new(p, Permission::FileRead);

        assert!(sm.check_access(&req).allowed);
        assert!(sm.check_access(&req).allowed);
        let third = sm.check_access(&req);
        assert_eq!(third.stage, DecisionStage::RateLimit);
        assert!(!third.allowed);

        clock.advance(Duration::from_secs(11));
        assert!(sm.check_access(&req).allowed);
    }

    #[test]
    fn test_deny_rule_overrides_capability() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "a", SecurityLevel::Trusted);
        sm.add_policy(
            "no-etc",
            10,
            vec![SecurityRule::deny([Permission::FileWrite]).when(
                ConditionField::Resource,
                ConditionOp::StartsWith,
                "/etc/",
            )],
        );

        let denied = sm.check_access(&AccessRequest::new(p.clone(), Permission::FileWrite).on("/etc/passwd"));
        assert!(!denied.allowed);
        assert_eq!(denied.stage, DecisionStage::Policy);
        assert!(denied.rule_id.is_some());

        let allowed = sm.check_access(&AccessRequest::new(p, Permission::FileWrite).on("/tmp/x"));
        assert!(allowed.allowed);
    }

    #[test]
    fn test_allow_rule_short_circuits() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "a", SecurityLevel::Sandboxed);
        sm.add_policy(
            "agents-may-install",
            1,
            vec![SecurityRule::allow([Permission::ToolInstall]).when(
                ConditionField::PrincipalKind,
                ConditionOp::Equals,
                "agent",
            )],
        );
        let decision = sm.check_access(&AccessRequest::new(p, Permission::ToolInstall));
        assert!(decision.allowed);
        assert_eq!(decision.stage, DecisionStage::Policy);
    }

    #[test]
    fn test_disabled_policy_is_skipped() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "a", SecurityLevel::Standard);
        let policy = sm.add_policy("block", 1, vec![SecurityRule::deny([Permission::FileRead])]);
        sm.set_policy_enabled(&policy, false).unwrap();
        assert!(sm.is_allowed(&AccessRequest::new(p.clone(), Permission::FileRead)));
        sm.remove_policy(&policy).unwrap();
        assert!(sm.remove_policy(&policy).unwrap_err().is_not_found());
    }

    #[test]
    fn test_audit_rules_log_and_continue() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "a", SecurityLevel::Standard);
        sm.add_policy("watch", 5, vec![SecurityRule::audit([Permission::FileRead])]);

        assert!(sm.is_allowed(&AccessRequest::new(p.clone(), Permission::FileRead)));
        let audits = sm.audit_log(&AuditQuery::for_principal(p).of_kind(AuditKind::PolicyAudit));
        assert_eq!(audits.len(), 1);
    }

    #[test]
    fn test_expired_capability_does_not_grant() {
        let (mut sm, clock) = module();
        let p = register(&mut sm, "a", SecurityLevel::Sandboxed);
        let expiry = sm.ctx.now() + chrono::Duration::seconds(30);
        sm.grant_capability(&p, Capability::new("net", [Permission::NetworkRead]).with_expiry(expiry))
            .unwrap();

        let req = AccessRequest::new(p, Permission::NetworkRead);
        assert!(sm.is_allowed(&req));
        clock.advance(Duration::from_secs(30));
        let decision = sm.check_access(&req);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "Permission not granted");
    }

    #[test]
    fn test_capability_uses_counted_and_capped() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "a", SecurityLevel::Sandboxed);
        let cap = sm
            .grant_capability(&p, Capability::new("once", [Permission::Execute]).with_max_uses(1))
            .unwrap();
        let req = AccessRequest::new(p.clone(), Permission::Execute);

        let first = sm.check_access(&req);
        assert_eq!(first.capability_id.as_ref(), Some(&cap));
        assert!(!sm.is_allowed(&req));

        let held = &sm.get_principal(&p).unwrap().capabilities;
        assert_eq!(held.iter().find(|c| c.id == cap).unwrap().use_count, 1);
    }

    #[test]
    fn test_revoke_capability() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "a", SecurityLevel::Sandboxed);
        let cap = sm
            .grant_capability(&p, Capability::new("exec", [Permission::Execute]))
            .unwrap();
        sm.revoke_capability(&p, &cap).unwrap();
        assert!(!sm.is_allowed(&AccessRequest::new(p.clone(), Permission::Execute)));
        assert!(sm.revoke_capability(&p, &cap).unwrap_err().is_not_found());
    }

    #[test]
    fn test_sandbox_constraints() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "a", SecurityLevel::Trusted);
        let sandbox = sm.create_sandbox(
            "workspace",
            SandboxConfig {
                allowed_paths: vec!["/workspace/".into()],
                network_access: false,
                ..SandboxConfig::default()
            },
        );
        sm.assign_sandbox(&p, &sandbox).unwrap();

        let outside = sm.check_access(&AccessRequest::new(p.clone(), Permission::FileRead).on("/etc/hosts"));
        assert_eq!(outside.stage, DecisionStage::Sandbox);
        assert!(!outside.allowed);
        assert!(!sm.is_allowed(&AccessRequest::new(p.clone(), Permission::NetworkRead)));
        assert!(sm.is_allowed(&AccessRequest::new(p.clone(), Permission::FileRead).on("/workspace/a")));

        sm.destroy_sandbox(&sandbox).unwrap();
        assert!(sm.get_principal(&p).unwrap().sandbox_id.is_none());
        assert!(sm.is_allowed(&AccessRequest::new(p, Permission::NetworkRead)));
    }

    #[test]
    fn test_critical_violation_downgrades() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "a", SecurityLevel::Trusted);
        let extra = sm
            .grant_capability(&p, Capability::new("extra", [Permission::AuditRead]))
            .unwrap();

        sm.report_violation(&p, ViolationSeverity::High, "odd").unwrap();
        assert_eq!(sm.get_principal(&p).unwrap().level, SecurityLevel::Trusted);

        sm.report_violation(&p, ViolationSeverity::Critical, "escape attempt").unwrap();
        let principal = sm.get_principal(&p).unwrap();
        assert_eq!(principal.level, SecurityLevel::Sandboxed);
        assert_eq!(sm.violation_count(&p), 2);
        // Explicit grants survive the downgrade; the level bundle is replaced.
        assert!(principal.capabilities.iter().any(|c| c.id == extra));
        assert!(!sm.is_allowed(&AccessRequest::new(p, Permission::FileWrite)));
    }

    #[test]
    fn test_every_decision_is_audited_and_emitted() {
        let (mut sm, _) = module();
        let p = register(&mut sm, "a", SecurityLevel::Restricted);
        let (seen, handler) = recorder::<SecurityEvent>();
        sm.subscribe("*", handler);
        let before = sm.audit_len();

        sm.check_access(&AccessRequest::new(p.clone(), Permission::FileRead));
        sm.check_access(&AccessRequest::new(p, Permission::Admin));

        assert_eq!(sm.audit_len(), before + 2);
        let kinds: Vec<&str> = seen.lock().unwrap().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["audit:logged", "access:granted", "audit:logged", "access:denied"]
        );
    }
}
