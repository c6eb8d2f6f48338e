//! End-to-end kernel scenarios across scheduler, resources, security and processes.

use agentos_kernel::kernel::process::{ProcessSpec, ProcessState, Signal};
use agentos_kernel::kernel::resources::{AllocationRequest, AllocationStatus, ResourceKind};
use agentos_kernel::kernel::security::{
    AccessRequest, AuditKind, AuditQuery, Capability, Permission, PrincipalKind, SecurityLevel,
    SecurityRule,
};
use agentos_kernel::kernel::types::{TaskPriority, TaskSpec, TaskState};
use agentos_kernel::kernel::{Kernel, KernelContext, KernelRuntime, ManualClock};
use agentos_kernel::types::{PrincipalId, TaskId};
use agentos_kernel::KernelConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn deterministic_kernel(config: KernelConfig) -> (Kernel, Arc<ManualClock>) {
    let (ctx, clock) = KernelContext::deterministic();
    (Kernel::with_context(config, ctx), clock)
}

fn task_id(raw: &str) -> TaskId {
    TaskId::from_string(raw).unwrap()
}

fn principal(raw: &str) -> PrincipalId {
    PrincipalId::from_string(raw).unwrap()
}

#[test]
fn priority_order_critical_high_low() {
    let (mut k, _) = deterministic_kernel(KernelConfig::default());
    for (id, priority) in [
        ("low", TaskPriority::Low),
        ("high", TaskPriority::High),
        ("critical", TaskPriority::Critical),
    ] {
        k.scheduler
            .schedule(TaskSpec::new("agent").with_id(task_id(id)).with_priority(priority))
            .unwrap();
    }

    let order: Vec<String> = std::iter::from_fn(|| k.scheduler.get_next_task())
        .map(|t| t.id.to_string())
        .collect();
    assert_eq!(order, vec!["critical", "high", "low"]);
}

#[test]
fn overcommit_allows_115_then_denies_121() {
    let (mut k, _) = deterministic_kernel(KernelConfig::default());
    k.resources.set_quota(ResourceKind::Tokens, 100, None);

    let first = k
        .resources
        .allocate(AllocationRequest::new(task_id("t1"), ResourceKind::Tokens, 115))
        .unwrap();
    assert_eq!(first.status, AllocationStatus::Allocated);

    let second = k
        .resources
        .allocate(AllocationRequest::new(task_id("t2"), ResourceKind::Tokens, 121))
        .unwrap();
    assert_eq!(second.status, AllocationStatus::Denied);
    assert_eq!(second.reason.as_deref(), Some("Insufficient quota"));

    let quota = k.resources.get_quota(ResourceKind::Tokens).unwrap();
    assert_eq!(quota.reserved, 115);
}

#[test]
fn second_commit_is_rejected() {
    let (mut k, _) = deterministic_kernel(KernelConfig::default());
    let allocation = k
        .resources
        .allocate(AllocationRequest::new(task_id("t1"), ResourceKind::ToolCalls, 5))
        .unwrap();

    k.resources.commit(&allocation.request_id, None).unwrap();
    let again = k.resources.commit(&allocation.request_id, None);
    assert!(again.unwrap_err().is_state_transition());
    assert_eq!(k.resources.get_quota(ResourceKind::ToolCalls).unwrap().used, 5);
}

#[test]
fn restricted_principal_cannot_write_files() {
    let (mut k, _) = deterministic_kernel(KernelConfig::default());
    let id = principal("agent-7");
    k.security
        .register_principal(id.clone(), PrincipalKind::Agent, SecurityLevel::Restricted)
        .unwrap();

    let decision = k
        .security
        .check_access(&AccessRequest::new(id.clone(), Permission::FileWrite).on("/tmp/out"));
    assert!(!decision.allowed);
    assert_eq!(decision.reason, "Permission not granted");

    let read = k
        .security
        .check_access(&AccessRequest::new(id.clone(), Permission::FileRead).on("/tmp/out"));
    assert!(read.allowed);

    let query = AuditQuery::for_principal(id);
    let denied = k.security.audit_log(&query.clone().of_kind(AuditKind::AccessDenied));
    let granted = k.security.audit_log(&query.of_kind(AuditKind::AccessGranted));
    assert_eq!((denied.len(), granted.len()), (1, 1));
}

#[test]
fn deny_rule_overrides_capability() {
    let (mut k, _) = deterministic_kernel(KernelConfig::default());
    let id = principal("builder");
    k.security
        .register_principal(id.clone(), PrincipalKind::Agent, SecurityLevel::Sandboxed)
        .unwrap();
    k.security
        .grant_capability(&id, Capability::new("exec", [Permission::Execute]))
        .unwrap();

    let request = AccessRequest::new(id.clone(), Permission::Execute).on("/bin/sh");
    assert!(k.security.check_access(&request).allowed);

    k.security
        .add_policy("no-exec", 10, vec![SecurityRule::deny([Permission::Execute])]);
    let decision = k.security.check_access(&request);
    assert!(!decision.allowed);
    assert_eq!(decision.reason, "Denied by policy no-exec");
}

#[test]
fn expired_capability_never_grants() {
    let (mut k, clock) = deterministic_kernel(KernelConfig::default());
    let id = principal("cron");
    k.security
        .register_principal(id.clone(), PrincipalKind::System, SecurityLevel::Sandboxed)
        .unwrap();

    let expiry = k.context().now() + chrono::Duration::seconds(30);
    k.security
        .grant_capability(
            &id,
            Capability::new("net", [Permission::NetworkRead]).with_expiry(expiry),
        )
        .unwrap();

    let request = AccessRequest::new(id, Permission::NetworkRead).on("https://example.com");
    assert!(k.security.check_access(&request).allowed);

    clock.advance(Duration::from_secs(31));
    assert!(!k.security.check_access(&request).allowed);
}

#[test]
fn suspend_then_resume_keeps_checkpoint() {
    let (mut k, clock) = deterministic_kernel(KernelConfig::default());
    let pid = k.processes.create(ProcessSpec::new("planner")).unwrap();
    k.processes.start(&pid).unwrap();
    k.processes.set_variable(&pid, "plan", serde_json::json!(["a", "b"])).unwrap();

    clock.advance(Duration::from_secs(3));
    let suspended_at = k.context().now();
    k.processes.send_signal(&pid, Signal::Stop).unwrap();
    assert_eq!(k.processes.get_process(&pid).unwrap().state, ProcessState::Suspended);

    clock.advance(Duration::from_secs(3));
    k.processes.send_signal(&pid, Signal::Cont).unwrap();
    assert_eq!(k.processes.get_process(&pid).unwrap().state, ProcessState::Running);

    let checkpoint = k.processes.context(&pid).unwrap().latest_checkpoint().unwrap();
    assert_eq!(checkpoint.taken_at, suspended_at);
    assert_eq!(checkpoint.variables.get("plan"), Some(&serde_json::json!(["a", "b"])));
}

#[test]
fn task_with_metered_allocation_end_to_end() {
    let (mut k, _) = deterministic_kernel(KernelConfig::default());
    let pid = k.processes.create(ProcessSpec::new("worker")).unwrap();
    k.processes.start(&pid).unwrap();

    let task = k
        .scheduler
        .schedule(TaskSpec::new(pid.as_str()).with_id(task_id("summarize")))
        .unwrap();
    let running = k.scheduler.get_next_task().unwrap();
    assert_eq!(running.id, task.id);

    let grant = k
        .resources
        .allocate(AllocationRequest::new(task.id.clone(), ResourceKind::Tokens, 2_000))
        .unwrap();
    assert!(grant.is_allocated());
    k.resources.commit(&grant.request_id, Some(1_500)).unwrap();
    k.scheduler.complete_task(&task.id, None).unwrap();

    let status = k.status();
    assert_eq!(status.scheduler.total_completed, 1);
    assert_eq!(status.processes.live, 1);
    assert!(status.resources.total_cost > 0.0);
    assert_eq!(
        k.scheduler.get_task(&task.id).unwrap().state,
        TaskState::Completed
    );
}

#[test]
fn shutdown_tears_everything_down() {
    let (mut k, _) = deterministic_kernel(KernelConfig::default());
    let pid = k.processes.create(ProcessSpec::new("a")).unwrap();
    k.processes.start(&pid).unwrap();
    k.processes.fail(&pid, "boom").unwrap();
    assert_eq!(k.processes.pending_recoveries().len(), 1);

    let report = k.shutdown();
    assert_eq!(report.recoveries_cancelled, 1);
    assert!(k.processes.pending_recoveries().is_empty());
    assert!(k.status().shut_down);
}

#[test]
fn config_document_drives_kernel() {
    let config = KernelConfig::from_json_str(
        r#"{
            "scheduler": { "algorithm": "round_robin", "max_concurrent_tasks": 1 },
            "processes": { "restart_delay": "250ms", "max_restart_attempts": 1 }
        }"#,
    )
    .unwrap();
    let (mut k, _) = deterministic_kernel(config);

    k.scheduler
        .schedule(TaskSpec::new("a").with_id(task_id("first")).with_priority(TaskPriority::Low))
        .unwrap();
    k.scheduler
        .schedule(TaskSpec::new("a").with_id(task_id("second")).with_priority(TaskPriority::Critical))
        .unwrap();

    assert_eq!(k.scheduler.get_next_task().unwrap().id.as_str(), "first");
    // Concurrency ceiling of one.
    assert!(k.scheduler.get_next_task().is_none());
}

#[tokio::test]
async fn runtime_recovers_failed_process() {
    let mut config = KernelConfig::default();
    config.processes.restart_delay = Duration::from_millis(10);
    config.processes.recovery_poll_interval = Duration::from_millis(5);

    let kernel = Arc::new(Mutex::new(Kernel::new(config)));
    let pid = {
        let mut k = kernel.lock().await;
        let pid = k.processes.create(ProcessSpec::new("flaky")).unwrap();
        k.processes.start(&pid).unwrap();
        k.processes.checkpoint(&pid).unwrap();
        k.processes.fail(&pid, "transient").unwrap();
        pid
    };

    let runtime = KernelRuntime::start(kernel.clone()).await;
    // Recovery is due on the wall clock, so poll with a generous deadline.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let recovered = {
            let k = kernel.lock().await;
            k.processes.get_process(&pid).unwrap().restart_count == 1
        };
        if recovered || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    runtime.shutdown().await;

    let k = kernel.lock().await;
    let process = k.processes.get_process(&pid).unwrap();
    assert_eq!(process.state, ProcessState::Running);
    assert_eq!(process.restart_count, 1);
}

#[test]
fn runtime_can_be_driven_from_a_blocking_context() {
    let kernel = Arc::new(Mutex::new(Kernel::new(KernelConfig::default())));
    let names = tokio_test::block_on(async {
        let runtime = KernelRuntime::start(kernel.clone()).await;
        let names = runtime.ticker_names();
        runtime.shutdown().await;
        names
    });
    assert!(names.contains(&"health_check"));
}
