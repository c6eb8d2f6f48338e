//! Policies, rules and their evaluation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::capability::{Permission, PrincipalKind, SecurityLevel};
use crate::types::{PolicyId, PrincipalId, RuleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
    /// Log the match and keep evaluating.
    Audit,
}

/// Attribute of the access request a condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    PrincipalKind,
    SecurityLevel,
    PrincipalId,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    NotEquals,
    StartsWith,
    EndsWith,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: ConditionField,
    pub op: ConditionOp,
    pub value: String,
}

impl RuleCondition {
    pub fn new(field: ConditionField, op: ConditionOp, value: impl Into<String>) -> Self {
        Self {
            field,
            op,
            value: value.into(),
        }
    }

    /// A condition on an absent attribute never holds.
    fn holds(&self, subject: &AccessSubject<'_>) -> bool {
        let actual = match self.field {
            ConditionField::PrincipalKind => Some(subject.kind.as_str()),
            ConditionField::SecurityLevel => Some(subject.level.as_str()),
            ConditionField::PrincipalId => Some(subject.principal_id.as_str()),
            ConditionField::Resource => subject.resource,
        };
        let Some(actual) = actual else {
            return false;
        };
        let expected = self.value.as_str();
        match self.op {
            ConditionOp::Equals => actual == expected,
            ConditionOp::NotEquals => actual != expected,
            ConditionOp::StartsWith => actual.starts_with(expected),
            ConditionOp::EndsWith => actual.ends_with(expected),
            ConditionOp::Contains => actual.contains(expected),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityRule {
    /// Assigned when the owning policy is added, if not set.
    pub id: Option<RuleId>,
    pub action: RuleAction,
    pub permissions: BTreeSet<Permission>,
    pub conditions: Vec<RuleCondition>,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SecurityRule {
    pub fn new(action: RuleAction, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            id: None,
            action,
            permissions: permissions.into_iter().collect(),
            conditions: Vec::new(),
            priority: 0,
            description: None,
        }
    }

    pub fn allow(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self::new(RuleAction::Allow, permissions)
    }

    pub fn deny(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self::new(RuleAction::Deny, permissions)
    }

    pub fn audit(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self::new(RuleAction::Audit, permissions)
    }

    pub fn when(mut self, field: ConditionField, op: ConditionOp, value: impl Into<String>) -> Self {
        self.conditions.push(RuleCondition::new(field, op, value));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn matches(&self, subject: &AccessSubject<'_>) -> bool {
        self.permissions.contains(&subject.permission)
            && self.conditions.iter().all(|c| c.holds(subject))
    }
}

/// Ordered rule set. Higher priority policies are evaluated first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub id: PolicyId,
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub rules: Vec<SecurityRule>,
}

/// The facts about an access request that rules can test.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AccessSubject<'a> {
    pub principal_id: &'a PrincipalId,
    pub kind: PrincipalKind,
    pub level: SecurityLevel,
    pub permission: Permission,
    pub resource: Option<&'a str>,
}

/// A rule that matched during evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RuleMatch {
    pub policy_id: PolicyId,
    pub policy_name: String,
    pub rule_id: Option<RuleId>,
    pub action: RuleAction,
}

#[derive(Debug, Default)]
pub(crate) struct PolicyVerdict {
    /// First matching allow/deny rule.
    pub decision: Option<RuleMatch>,
    /// Audit rules matched before the decision.
    pub audited: Vec<RuleMatch>,
}

/// Walk enabled policies by descending priority, rules likewise, stopping at
/// the first matching allow or deny. Equal priorities keep insertion order.
pub(crate) fn evaluate(policies: &[SecurityPolicy], subject: &AccessSubject<'_>) -> PolicyVerdict {
    let mut ordered: Vec<&SecurityPolicy> = policies.iter().filter(|p| p.enabled).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut verdict = PolicyVerdict::default();
    for policy in ordered {
        let mut rules: Vec<&SecurityRule> = policy.rules.iter().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in rules.into_iter().filter(|r| r.matches(subject)) {
            let hit = RuleMatch {
                policy_id: policy.id.clone(),
                policy_name: policy.name.clone(),
                rule_id: rule.id.clone(),
                action: rule.action,
            };
            if rule.action == RuleAction::Audit {
                verdict.audited.push(hit);
            } else {
                verdict.decision = Some(hit);
                return verdict;
            }
        }
    }
    verdict
}
