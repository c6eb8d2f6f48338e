//! Append-only, size-bounded audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::capability::Permission;
use crate::types::{AuditEntryId, PrincipalId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AccessGranted,
    AccessDenied,
    PolicyAudit,
    CapabilityGranted,
    CapabilityRevoked,
    SandboxCreated,
    SandboxDestroyed,
    PolicyUpdated,
    PrincipalRegistered,
    PrincipalRemoved,
    LevelChanged,
    Violation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: AuditEntryId,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<PrincipalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<Permission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub detail: String,
}

/// Filter for [`AuditLog::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub principal_id: Option<PrincipalId>,
    pub kind: Option<AuditKind>,
    pub since: Option<DateTime<Utc>>,
    /// Most recent N matches.
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn for_principal(principal_id: PrincipalId) -> Self {
        Self {
            principal_id: Some(principal_id),
            ..Self::default()
        }
    }

    pub fn of_kind(mut self, kind: AuditKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.principal_id
            .as_ref()
            .map_or(true, |p| entry.principal_id.as_ref() == Some(p))
            && self.kind.map_or(true, |k| entry.kind == k)
            && self.since.map_or(true, |t| entry.timestamp >= t)
    }
}

#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<AuditLogEntry>,
    retention: usize,
    evicted: u64,
}

impl AuditLog {
    pub fn new(retention: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            retention: retention.max(1),
            evicted: 0,
        }
    }

    /// Append, evicting the oldest entry once retention is reached.
    pub fn append(&mut self, entry: AuditLogEntry) {
        if self.entries.len() >= self.retention {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);
    }

    /// Matches in chronological order.
    pub fn query(&self, query: &AuditQuery) -> Vec<&AuditLogEntry> {
        let mut hits: Vec<&AuditLogEntry> = self.entries.iter().filter(|e| query.matches(e)).collect();
        if let Some(limit) = query.limit {
            let skip = hits.len().saturating_sub(limit);
            hits.drain(..skip);
        }
        hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(n: u32, kind: AuditKind, principal: &str) -> AuditLogEntry {
        AuditLogEntry {
            id: AuditEntryId::must(&format!("audit_{n}")),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, n).unwrap(),
            kind,
            principal_id: Some(PrincipalId::must(principal)),
            permission: None,
            resource: None,
            detail: String::new(),
        }
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let mut log = AuditLog::new(2);
        for n in 0..3 {
            log.append(entry(n, AuditKind::AccessGranted, "p"));
        }
        let ids: Vec<&str> = log.query(&AuditQuery::default()).iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["audit_1", "audit_2"]);
        assert_eq!(log.evicted(), 1);
    }

    #[test]
    fn test_query_filters_and_limit() {
        let mut log = AuditLog::new(100);
        log.append(entry(0, AuditKind::AccessGranted, "a"));
        log.append(entry(1, AuditKind::AccessDenied, "a"));
        log.append(entry(2, AuditKind::AccessDenied, "b"));
        log.append(entry(3, AuditKind::AccessDenied, "a"));

        let denied_a = AuditQuery::for_principal(PrincipalId::must("a")).of_kind(AuditKind::AccessDenied);
        assert_eq!(log.query(&denied_a).len(), 2);

        let latest = AuditQuery {
            limit: Some(1),
            ..denied_a
        };
        assert_eq!(log.query(&latest)[0].id.as_str(), "audit_3");
    }
}
