//! Scheduling algorithms.
//!
//! Each algorithm is a comparator over [`SchedulableTask`]; `Ordering::Less`
//! means the left task runs first. Every comparator ends with the admission
//! sequence number so ordering is total and deterministic even when two
//! tasks share a creation timestamp.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use super::priority_queue::Comparator;
use super::types::{SchedulableTask, TaskPriority};

/// Interchangeable ready-queue ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAlgorithm {
    /// Lower priority ordinal first, FIFO within a level.
    #[default]
    Priority,
    /// Owner with the least cumulative usage first.
    FairShare,
    /// Earliest deadline first; deadlined tasks precede the rest.
    Deadline,
    /// Urgent work by priority, everything else cheapest first.
    CostAware,
    /// Pure FIFO by creation time.
    RoundRobin,
}

impl SchedulingAlgorithm {
    /// Build the comparator for this algorithm.
    ///
    /// `owner_usage` is a snapshot of cumulative usage per owner; only the
    /// fair-share comparator reads it, and the scheduler rebuilds the
    /// comparator whenever usage changes.
    pub fn comparator(self, owner_usage: Arc<HashMap<String, u64>>) -> Comparator<SchedulableTask> {
        match self {
            SchedulingAlgorithm::Priority => Box::new(priority_order),
            SchedulingAlgorithm::FairShare => {
                Box::new(move |a: &SchedulableTask, b: &SchedulableTask| {
                    fair_share_order(a, b, &owner_usage)
                })
            }
            SchedulingAlgorithm::Deadline => Box::new(deadline_order),
            SchedulingAlgorithm::CostAware => Box::new(cost_aware_order),
            SchedulingAlgorithm::RoundRobin => Box::new(round_robin_order),
        }
    }

    /// True if the comparator depends on per-owner usage.
    pub fn uses_owner_usage(self) -> bool {
        self == SchedulingAlgorithm::FairShare
    }
}

/// Priority, then creation time, then admission order.
pub fn priority_order(a: &SchedulableTask, b: &SchedulableTask) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.sequence.cmp(&b.sequence))
}

pub fn fair_share_order(
    a: &SchedulableTask,
    b: &SchedulableTask,
    owner_usage: &HashMap<String, u64>,
) -> Ordering {
    let usage_a = owner_usage.get(&a.owner_id).copied().unwrap_or(0);
    let usage_b = owner_usage.get(&b.owner_id).copied().unwrap_or(0);
    usage_a
        .cmp(&usage_b)
        .then_with(|| priority_order(a, b))
}

pub fn deadline_order(a: &SchedulableTask, b: &SchedulableTask) -> Ordering {
    match (a.deadline, b.deadline) {
        (Some(da), Some(db)) => da.cmp(&db).then_with(|| priority_order(a, b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => priority_order(a, b),
    }
}

pub fn cost_aware_order(a: &SchedulableTask, b: &SchedulableTask) -> Ordering {
    let urgent = a.priority <= TaskPriority::High || b.priority <= TaskPriority::High;
    if urgent && a.priority != b.priority {
        return a.priority.cmp(&b.priority);
    }
    a.estimated_cost
        .units()
        .cmp(&b.estimated_cost.units())
        .then_with(|| priority_order(a, b))
}

pub fn round_robin_order(a: &SchedulableTask, b: &SchedulableTask) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.sequence.cmp(&b.sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::types::{ResourceCost, TaskSpec};
    use crate::types::TaskId;
    use chrono::{Duration, TimeZone, Utc};

    fn task(seq: u64, owner: &str, priority: TaskPriority) -> SchedulableTask {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let spec = TaskSpec::new(owner).with_priority(priority);
        SchedulableTask::from_spec(TaskId::must(&format!("t{seq}")), spec, now, seq)
    }

    #[test]
    fn test_priority_breaks_ties_fifo() {
        let a = task(1, "o", TaskPriority::Normal);
        let b = task(2, "o", TaskPriority::Normal);
        let c = task(3, "o", TaskPriority::High);
        assert_eq!(priority_order(&a, &b), Ordering::Less);
        assert_eq!(priority_order(&c, &a), Ordering::Less);
    }

    #[test]
    fn test_fair_share_prefers_light_owner() {
        let heavy = task(1, "heavy", TaskPriority::Critical);
        let light = task(2, "light", TaskPriority::Low);
        let usage = HashMap::from([("heavy".to_string(), 500), ("light".to_string(), 10)]);
        assert_eq!(fair_share_order(&light, &heavy, &usage), Ordering::Less);

        let empty = HashMap::new();
        assert_eq!(fair_share_order(&heavy, &light, &empty), Ordering::Less);
    }

    #[test]
    fn test_deadline_tasks_come_first() {
        let mut soon = task(1, "o", TaskPriority::Low);
        let mut later = task(2, "o", TaskPriority::Critical);
        let none = task(3, "o", TaskPriority::Critical);
        soon.deadline = Some(soon.created_at + Duration::seconds(10));
        later.deadline = Some(later.created_at + Duration::seconds(60));

        assert_eq!(deadline_order(&soon, &later), Ordering::Less);
        assert_eq!(deadline_order(&later, &none), Ordering::Less);
        assert_eq!(deadline_order(&none, &soon), Ordering::Greater);
    }

    #[test]
    fn test_cost_aware_urgent_priority_dominates() {
        let mut urgent_expensive = task(1, "o", TaskPriority::High);
        urgent_expensive.estimated_cost = ResourceCost::tokens(10_000);
        let mut cheap_low = task(2, "o", TaskPriority::Low);
        cheap_low.estimated_cost = ResourceCost::tokens(1);
        assert_eq!(cost_aware_order(&urgent_expensive, &cheap_low), Ordering::Less);

        let mut normal_expensive = task(3, "o", TaskPriority::Normal);
        normal_expensive.estimated_cost = ResourceCost::tokens(500);
        assert_eq!(cost_aware_order(&cheap_low, &normal_expensive), Ordering::Less);
    }

    #[test]
    fn test_round_robin_ignores_priority() {
        let first = task(1, "o", TaskPriority::Background);
        let second = task(2, "o", TaskPriority::Critical);
        assert_eq!(round_robin_order(&first, &second), Ordering::Less);
    }

    #[test]
    fn test_serde_names() {
        let alg: SchedulingAlgorithm = serde_json::from_str("\"cost_aware\"").unwrap();
        assert_eq!(alg, SchedulingAlgorithm::CostAware);
        assert!(SchedulingAlgorithm::FairShare.uses_owner_usage());
    }
}
