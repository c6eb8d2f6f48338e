//! Property tests for scheduler ordering, quota bounds, capability expiry,
//! checkpoint fidelity and recovery backoff.

use agentos_kernel::kernel::process::{ProcessConfig, ProcessSpec, ProcessState};
use agentos_kernel::kernel::resources::{AllocationRequest, ResourceKind};
use agentos_kernel::kernel::scheduler::SchedulerConfig;
use agentos_kernel::kernel::security::{
    AccessRequest, Capability, Permission, PrincipalKind, SecurityLevel,
};
use agentos_kernel::kernel::types::{TaskPriority, TaskSpec};
use agentos_kernel::kernel::{Kernel, KernelContext, ManualClock};
use agentos_kernel::types::{PrincipalId, TaskId};
use agentos_kernel::KernelConfig;
use proptest::prelude::*;
use proptest::sample::select;
use std::sync::Arc;
use std::time::Duration;

fn kernel(config: KernelConfig) -> (Kernel, Arc<ManualClock>) {
    let (ctx, clock) = KernelContext::deterministic();
    (Kernel::with_context(config, ctx), clock)
}

fn priority() -> impl Strategy<Value = TaskPriority> {
    select(vec![
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
        TaskPriority::Background,
    ])
}

proptest! {
    #[test]
    fn priority_dequeue_is_ordinal_then_fifo(priorities in prop::collection::vec(priority(), 1..40)) {
        let config = KernelConfig {
            scheduler: SchedulerConfig {
                max_concurrent_tasks: 100,
                starvation_prevention: false,
                ..SchedulerConfig::default()
            },
            ..KernelConfig::default()
        };
        let (mut k, _) = kernel(config);
        for (n, p) in priorities.iter().enumerate() {
            let id = TaskId::from_string(format!("t{n:03}")).unwrap();
            k.scheduler.schedule(TaskSpec::new("owner").with_id(id).with_priority(*p)).unwrap();
        }

        let mut expected: Vec<(u8, usize)> = priorities
            .iter()
            .enumerate()
            .map(|(n, p)| (p.ordinal(), n))
            .collect();
        expected.sort();

        let actual: Vec<(u8, usize)> = std::iter::from_fn(|| k.scheduler.get_next_task())
            .map(|t| {
                let n: usize = t.id.as_str()[1..].parse().unwrap();
                (t.priority.ordinal(), n)
            })
            .collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn allocations_never_exceed_overcommitted_limit(
        limit in 1u64..10_000,
        amounts in prop::collection::vec(1u64..5_000, 1..30),
    ) {
        let (mut k, _) = kernel(KernelConfig::default());
        k.resources.set_quota(ResourceKind::Memory, limit, None);
        let ceiling = k.resources.get_quota(ResourceKind::Memory).unwrap().capacity(1.2);
        prop_assert!(ceiling <= limit * 6 / 5);

        for (n, amount) in amounts.into_iter().enumerate() {
            let task = TaskId::from_string(format!("t{n}")).unwrap();
            k.resources
                .allocate(AllocationRequest::new(task, ResourceKind::Memory, amount))
                .unwrap();
            let quota = k.resources.get_quota(ResourceKind::Memory).unwrap();
            prop_assert!(quota.used + quota.reserved <= ceiling);
        }
    }

    #[test]
    fn expired_capabilities_never_grant(
        permission in select(
            Permission::ALL
                .into_iter()
                .filter(|p| *p != Permission::FileRead)
                .collect::<Vec<_>>()
        ),
        expired_for in 1i64..86_400,
    ) {
        let (mut k, _) = kernel(KernelConfig::default());
        let id = PrincipalId::from_string("p").unwrap();
        k.security
            .register_principal(id.clone(), PrincipalKind::Agent, SecurityLevel::Sandboxed)
            .unwrap();

        let expired_at = k.context().now() - chrono::Duration::seconds(expired_for);
        k.security
            .grant_capability(&id, Capability::new("all", Permission::ALL).with_expiry(expired_at))
            .unwrap();

        let decision = k.security.check_access(&AccessRequest::new(id, permission));
        prop_assert!(!decision.allowed);
    }

    #[test]
    fn checkpoint_restore_round_trips_context(
        frames in prop::collection::vec("[a-z]{1,8}", 0..6),
        vars in prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..8),
    ) {
        let (mut k, _) = kernel(KernelConfig::default());
        let pid = k.processes.create(ProcessSpec::new("p")).unwrap();
        k.processes.start(&pid).unwrap();
        for frame in &frames {
            k.processes.push_frame(&pid, frame.clone()).unwrap();
        }
        for (key, value) in &vars {
            k.processes.set_variable(&pid, key.clone(), serde_json::json!(value)).unwrap();
        }
        let before = k.processes.context(&pid).unwrap().clone();
        let checkpoint = k.processes.checkpoint(&pid).unwrap();

        k.processes.push_frame(&pid, "scratch").unwrap();
        k.processes.set_variable(&pid, "scratch", serde_json::json!(true)).unwrap();
        k.processes.restore_from_checkpoint(&pid, Some(&checkpoint)).unwrap();

        let after = k.processes.context(&pid).unwrap();
        prop_assert_eq!(&after.stack, &before.stack);
        prop_assert_eq!(&after.variables, &before.variables);
    }

    #[test]
    fn recovery_is_bounded_with_increasing_delays(max_attempts in 0u32..6) {
        let config = KernelConfig {
            processes: ProcessConfig {
                max_restart_attempts: max_attempts,
                restart_delay: Duration::from_millis(100),
                ..ProcessConfig::default()
            },
            ..KernelConfig::default()
        };
        let (mut k, clock) = kernel(config);
        let pid = k.processes.create(ProcessSpec::new("flaky")).unwrap();
        k.processes.start(&pid).unwrap();

        let mut delays = Vec::new();
        for _ in 0..(max_attempts + 3) {
            if k.processes.get_process(&pid).unwrap().state != ProcessState::Running {
                break;
            }
            k.processes.fail(&pid, "again").unwrap();
            let Some(pending) = k.processes.pending_recoveries().pop() else {
                break;
            };
            delays.push(pending.delay);
            clock.advance(pending.delay);
            k.run_due_recoveries();
        }

        prop_assert_eq!(delays.len() as u32, max_attempts);
        prop_assert!(delays.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(k.processes.get_process(&pid).unwrap().restart_count, max_attempts);
    }
}
