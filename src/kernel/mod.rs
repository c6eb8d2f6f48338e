//! Kernel - the composition root.
//!
//! The Kernel owns the four subsystems (scheduler, resources, security,
//! processes). They are plain structs owned by the Kernel, not separate
//! actors; callers reach them through the public fields and share the
//! Kernel itself as `Arc<tokio::sync::Mutex<Kernel>>`. Periodic work is
//! exposed as plain entry points which [`KernelRuntime`] drives from tickers.

pub mod algorithms;
pub mod clock;
pub mod priority_queue;
pub mod process;
pub mod rate_limiter;
pub mod resources;
pub mod scheduler;
pub mod security;
pub mod timers;
pub mod types;

pub use algorithms::SchedulingAlgorithm;
pub use clock::{Clock, IdGenerator, KernelContext, ManualClock, SequentialIdGenerator, SystemClock};
pub use process::{ProcessManager, ProcessStats};
pub use resources::{ResourceManager, ResourceReport};
pub use scheduler::{Scheduler, SchedulerStats};
pub use security::SecurityModule;
pub use timers::{with_recovery, KernelRuntime, Ticker};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{KernelConfig, ProcessId, RequestId};
use process::{HealthReport, TerminationMode};

/// Outcome of one health tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthTick {
    pub processes: HealthReport,
    /// Reserved allocations released because they outlived `expires_at`.
    pub expired_allocations: Vec<RequestId>,
}

/// What `Kernel::shutdown` tore down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub recoveries_cancelled: usize,
    pub processes_terminated: usize,
    pub tasks_cancelled: usize,
}

/// Point-in-time view across every subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_ms: i64,
    pub shut_down: bool,
    pub scheduler: SchedulerStats,
    pub resources: ResourceReport,
    pub processes: ProcessStats,
    pub pending_recoveries: usize,
    pub audit_entries: usize,
}

#[derive(Debug)]
pub struct Kernel {
    pub scheduler: Scheduler,
    pub resources: ResourceManager,
    pub security: SecurityModule,
    pub processes: ProcessManager,
    config: KernelConfig,
    ctx: KernelContext,
    started_at: DateTime<Utc>,
    shut_down: bool,
}

impl Kernel {
    /// Kernel on the system clock with UUID ids.
    pub fn new(config: KernelConfig) -> Self {
        Self::with_context(config, KernelContext::default())
    }

    /// Kernel on an injected clock and id source.
    pub fn with_context(config: KernelConfig, ctx: KernelContext) -> Self {
        let kernel = Self {
            scheduler: Scheduler::new(config.scheduler.clone(), ctx.clone()),
            resources: ResourceManager::new(config.resources.clone(), ctx.clone()),
            security: SecurityModule::new(config.security.clone(), ctx.clone()),
            processes: ProcessManager::new(config.processes.clone(), ctx.clone()),
            started_at: ctx.now(),
            config,
            ctx,
            shut_down: false,
        };
        tracing::info!(
            "kernel_started: algorithm={:?}, max_processes={}",
            kernel.config.scheduler.algorithm,
            kernel.config.processes.max_processes
        );
        kernel
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn context(&self) -> &KernelContext {
        &self.ctx
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // =========================================================================
    // Timer entry points
    // =========================================================================

    /// Starvation pass. No-op when starvation prevention is off.
    pub fn boost_starved_tasks(&mut self) -> usize {
        if self.shut_down || !self.config.scheduler.starvation_prevention {
            return 0;
        }
        self.scheduler.boost_starved_tasks()
    }

    /// Periodic checkpoint pass. No-op when auto-checkpointing is off.
    pub fn checkpoint_processes(&mut self) -> usize {
        if self.shut_down || !self.config.processes.auto_checkpoint {
            return 0;
        }
        self.processes.checkpoint_processes()
    }

    /// Process health pass plus the expired-allocation sweep. `None` after shutdown.
    pub fn run_health_check(&mut self) -> Option<HealthTick> {
        if self.shut_down {
            return None;
        }
        let expired_allocations = self.resources.sweep_expired();
        let processes = self.processes.health_check();
        Some(HealthTick {
            processes,
            expired_allocations,
        })
    }

    pub fn run_due_recoveries(&mut self) -> Vec<ProcessId> {
        if self.shut_down {
            return Vec::new();
        }
        self.processes.run_due_recoveries()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Cancel pending recoveries, terminate live processes and cancel
    /// unfinished tasks. Idempotent.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.shut_down {
            return ShutdownReport::default();
        }
        self.shut_down = true;

        let recoveries_cancelled = self.processes.cancel_recoveries();
        let processes_terminated = self.processes.terminate_all(TerminationMode::Graceful);
        let tasks_cancelled = self.scheduler.cancel_all();

        let report = ShutdownReport {
            recoveries_cancelled,
            processes_terminated,
            tasks_cancelled,
        };
        tracing::info!(
            "kernel_shutdown: recoveries_cancelled={}, processes_terminated={}, tasks_cancelled={}",
            report.recoveries_cancelled,
            report.processes_terminated,
            report.tasks_cancelled
        );
        report
    }

    pub fn status(&self) -> KernelStatus {
        let now = self.ctx.now();
        KernelStatus {
            started_at: self.started_at,
            uptime_ms: (now - self.started_at).num_milliseconds(),
            shut_down: self.shut_down,
            scheduler: self.scheduler.stats(),
            resources: self.resources.report(),
            processes: self.processes.stats(),
            pending_recoveries: self.processes.pending_recoveries().len(),
            audit_entries: self.security.audit_len(),
        }
    }
}
