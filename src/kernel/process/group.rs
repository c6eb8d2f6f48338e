//! Process groups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GroupId, ProcessId};

/// Named set of processes with a leader. Members keep insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGroup {
    pub id: GroupId,
    pub name: String,
    pub leader: ProcessId,
    pub members: Vec<ProcessId>,
    pub created_at: DateTime<Utc>,
}

impl ProcessGroup {
    pub fn new(id: GroupId, name: String, leader: ProcessId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            members: vec![leader.clone()],
            leader,
            created_at: now,
        }
    }

    pub fn contains(&self, pid: &ProcessId) -> bool {
        self.members.contains(pid)
    }

    /// Returns false if already a member.
    pub(crate) fn add(&mut self, pid: ProcessId) -> bool {
        if self.contains(&pid) {
            return false;
        }
        self.members.push(pid);
        true
    }

    /// Remove a member, handing leadership to the oldest remaining member.
    pub(crate) fn remove(&mut self, pid: &ProcessId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != pid);
        if self.members.len() == before {
            return false;
        }
        if &self.leader == pid {
            if let Some(next) = self.members.first() {
                self.leader = next.clone();
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_leader_handoff() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut group = ProcessGroup::new(
            GroupId::must("g"),
            "workers".into(),
            ProcessId::must("a"),
            now,
        );
        assert!(group.add(ProcessId::must("b")));
        assert!(!group.add(ProcessId::must("b")));
        assert!(group.remove(&ProcessId::must("a")));
        assert_eq!(group.leader.as_str(), "b");
        assert!(group.remove(&ProcessId::must("b")));
        assert!(group.is_empty());
    }
}
