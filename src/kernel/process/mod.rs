//! Process manager.
//!
//! Owns process descriptors, their execution contexts (stack, variables,
//! checkpoint ring), per-process inboxes and signal handlers, and process
//! groups. Failed processes are restarted from their latest checkpoint after
//! a linear backoff; the one-shot restarts are kept here as
//! [`PendingRecovery`] entries and fired by [`ProcessManager::run_due_recoveries`].
//!
//! NOT a separate actor - owned by Kernel and called via &mut self.

mod context;
mod group;
mod ipc;
mod types;

pub use context::{CheckpointReason, ProcessCheckpoint, ProcessContext, StackFrame};
pub use group::ProcessGroup;
pub use ipc::{ProcessMessage, Signal, SignalHandler};
pub use types::{
    ProcessDescriptor, ProcessKind, ProcessSpec, ProcessState, ResourceUsage, TerminationMode,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::clock::{to_chrono, KernelContext};
use crate::events::{BusEvent, EventBus, SubscriptionId};
use crate::types::{CheckpointId, Error, GroupId, MessageId, ProcessId, Result};
use ipc::HandlerTable;

/// States from which `terminate` and `fail` are accepted.
const LIVE_STATES: [ProcessState; 6] = [
    ProcessState::Created,
    ProcessState::Ready,
    ProcessState::Running,
    ProcessState::Waiting,
    ProcessState::Suspended,
    ProcessState::Blocked,
];

// =============================================================================
// Configuration
// =============================================================================

/// Process manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Process table size, reaped entries excluded.
    pub max_processes: usize,
    /// Checkpoints kept per process.
    pub max_checkpoints: usize,
    pub max_inbox_size: usize,
    pub auto_checkpoint: bool,
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Age after which a terminated process becomes a zombie.
    #[serde(with = "humantime_serde")]
    pub zombie_timeout: Duration,
    pub auto_recovery: bool,
    pub max_restart_attempts: u32,
    /// Base delay; attempt N waits `restart_delay * (N + 1)`.
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub recovery_poll_interval: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_processes: 1000,
            max_checkpoints: 10,
            max_inbox_size: 1000,
            auto_checkpoint: true,
            checkpoint_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            zombie_timeout: Duration::from_secs(300),
            auto_recovery: true,
            max_restart_attempts: 3,
            restart_delay: Duration::from_secs(1),
            recovery_poll_interval: Duration::from_millis(100),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    Created {
        pid: ProcessId,
        name: String,
        parent_pid: Option<ProcessId>,
    },
    Started {
        pid: ProcessId,
    },
    Terminated {
        pid: ProcessId,
        mode: TerminationMode,
        exit_code: i32,
    },
    Failed {
        pid: ProcessId,
        reason: String,
    },
    Suspended {
        pid: ProcessId,
        checkpoint_id: CheckpointId,
    },
    Resumed {
        pid: ProcessId,
        state: ProcessState,
    },
    StateChanged {
        pid: ProcessId,
        from: ProcessState,
        to: ProcessState,
    },
    Signal {
        pid: ProcessId,
        signal: Signal,
        handled: bool,
    },
    Message {
        message_id: MessageId,
        from: Option<ProcessId>,
        to: ProcessId,
        kind: String,
    },
    Checkpoint {
        pid: ProcessId,
        checkpoint_id: CheckpointId,
        reason: CheckpointReason,
    },
    Recovered {
        pid: ProcessId,
        checkpoint_id: Option<CheckpointId>,
        restart_count: u32,
    },
    GroupCreated {
        group_id: GroupId,
        name: String,
        leader: ProcessId,
    },
    GroupJoined {
        group_id: GroupId,
        pid: ProcessId,
    },
    GroupLeft {
        group_id: GroupId,
        pid: ProcessId,
    },
    GroupDissolved {
        group_id: GroupId,
    },
    GroupSignal {
        group_id: GroupId,
        signal: Signal,
        delivered: usize,
    },
    HealthCheck {
        healthy: usize,
        unhealthy: usize,
        zombies: usize,
    },
}

impl BusEvent for ProcessEvent {
    fn kind(&self) -> &'static str {
        match self {
            ProcessEvent::Created { .. } => "process:created",
            ProcessEvent::Started { .. } => "process:started",
            ProcessEvent::Terminated { .. } => "process:terminated",
            ProcessEvent::Failed { .. } => "process:failed",
            ProcessEvent::Suspended { .. } => "process:suspended",
            ProcessEvent::Resumed { .. } => "process:resumed",
            ProcessEvent::StateChanged { .. } => "process:state_changed",
            ProcessEvent::Signal { .. } => "process:signal",
            ProcessEvent::Message { .. } => "process:message",
            ProcessEvent::Checkpoint { .. } => "process:checkpoint",
            ProcessEvent::Recovered { .. } => "process:recovered",
            ProcessEvent::GroupCreated { .. } => "group:created",
            ProcessEvent::GroupJoined { .. } => "group:joined",
            ProcessEvent::GroupLeft { .. } => "group:left",
            ProcessEvent::GroupDissolved { .. } => "group:dissolved",
            ProcessEvent::GroupSignal { .. } => "group:signal",
            ProcessEvent::HealthCheck { .. } => "health:check",
        }
    }
}

// =============================================================================
// Recovery, health and statistics
// =============================================================================

/// A scheduled restore-and-restart of a failed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecovery {
    pub pid: ProcessId,
    /// Zero-based attempt number.
    pub attempt: u32,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    pub due_at: DateTime<Utc>,
}

/// Result of one health pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub zombies: usize,
    /// Processes promoted to zombie by this pass.
    pub promoted: Vec<ProcessId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub live: usize,
    pub total_created: u64,
    pub total_terminated: u64,
    pub total_failed: u64,
    pub total_recovered: u64,
    pub total_checkpoints: u64,
    pub total_messages: u64,
    pub total_signals: u64,
    pub zombies_reaped: u64,
}

// =============================================================================
// ProcessManager
// =============================================================================

#[derive(Debug)]
pub struct ProcessManager {
    config: ProcessConfig,
    ctx: KernelContext,
    processes: HashMap<ProcessId, ProcessDescriptor>,
    contexts: HashMap<ProcessId, ProcessContext>,
    inboxes: HashMap<ProcessId, VecDeque<ProcessMessage>>,
    handlers: HandlerTable,
    groups: HashMap<GroupId, ProcessGroup>,
    recoveries: HashMap<ProcessId, PendingRecovery>,
    stats: ProcessStats,
    events: EventBus<ProcessEvent>,
}

impl ProcessManager {
    pub fn new(config: ProcessConfig, ctx: KernelContext) -> Self {
        Self {
            config,
            ctx,
            processes: HashMap::new(),
            contexts: HashMap::new(),
            inboxes: HashMap::new(),
            handlers: HandlerTable::default(),
            groups: HashMap::new(),
            recoveries: HashMap::new(),
            stats: ProcessStats::default(),
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn subscribe<F>(&mut self, kind: &str, handler: F) -> SubscriptionId
    where
        F: FnMut(&ProcessEvent) + Send + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn events(&self) -> &EventBus<ProcessEvent> {
        &self.events
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a process in the `Created` state.
    pub fn create(&mut self, spec: ProcessSpec) -> Result<ProcessId> {
        if spec.name.trim().is_empty() {
            return Err(Error::validation("process name is required"));
        }
        if self.processes.len() >= self.config.max_processes {
            return Err(Error::quota_exceeded(format!(
                "process table full: {} processes",
                self.processes.len()
            )));
        }
        if let Some(parent) = &spec.parent {
            if !self.processes.contains_key(parent) {
                return Err(Error::not_found(format!("unknown parent pid: {}", parent)));
            }
        }

        let now = self.ctx.now();
        let pid = ProcessId::generate(self.ctx.ids.as_ref());
        let descriptor = ProcessDescriptor::from_spec(pid.clone(), spec, now);
        let (name, parent_pid) = (descriptor.name.clone(), descriptor.parent_pid.clone());

        self.processes.insert(pid.clone(), descriptor);
        self.contexts
            .insert(pid.clone(), ProcessContext::new(self.config.max_checkpoints));
        self.inboxes.insert(pid.clone(), VecDeque::new());
        self.stats.total_created += 1;

        tracing::info!("process_created: pid={}, name={}", pid, name);
        self.events.emit(ProcessEvent::Created {
            pid: pid.clone(),
            name,
            parent_pid,
        });
        Ok(pid)
    }

    pub fn make_ready(&mut self, pid: &ProcessId) -> Result<()> {
        self.transition(pid, &[ProcessState::Created], ProcessState::Ready, "ready")?;
        Ok(())
    }

    /// Start a created or ready process.
    pub fn start(&mut self, pid: &ProcessId) -> Result<()> {
        self.transition(
            pid,
            &[ProcessState::Created, ProcessState::Ready],
            ProcessState::Running,
            "start",
        )?;
        let now = self.ctx.now();
        if let Some(process) = self.processes.get_mut(pid) {
            process.started_at = Some(now);
        }
        self.events.emit(ProcessEvent::Started { pid: pid.clone() });
        Ok(())
    }

    pub fn wait(&mut self, pid: &ProcessId) -> Result<()> {
        self.transition(pid, &[ProcessState::Running], ProcessState::Waiting, "wait")?;
        Ok(())
    }

    pub fn wake(&mut self, pid: &ProcessId) -> Result<()> {
        self.transition(pid, &[ProcessState::Waiting], ProcessState::Running, "wake")?;
        Ok(())
    }

    pub fn block(&mut self, pid: &ProcessId, reason: &str) -> Result<()> {
        self.transition(pid, &[ProcessState::Running], ProcessState::Blocked, "block")?;
        tracing::debug!("process_blocked: pid={}, reason={}", pid, reason);
        Ok(())
    }

    pub fn unblock(&mut self, pid: &ProcessId) -> Result<()> {
        self.transition(pid, &[ProcessState::Blocked], ProcessState::Running, "unblock")?;
        Ok(())
    }

    /// Checkpoint, then suspend. Resume returns to the state held here.
    pub fn suspend(&mut self, pid: &ProcessId) -> Result<CheckpointId> {
        let state = self.state_of(pid)?;
        if !matches!(
            state,
            ProcessState::Ready | ProcessState::Running | ProcessState::Waiting | ProcessState::Blocked
        ) {
            return Err(Error::state_transition(format!(
                "cannot suspend pid {}: state is {:?}",
                pid, state
            )));
        }

        let checkpoint_id = self.take_checkpoint(pid, CheckpointReason::Suspend)?;
        let from = self.transition(
            pid,
            &[state],
            ProcessState::Suspended,
            "suspend",
        )?;
        if let Some(process) = self.processes.get_mut(pid) {
            process.suspended_from = Some(from);
        }
        self.events.emit(ProcessEvent::Suspended {
            pid: pid.clone(),
            checkpoint_id: checkpoint_id.clone(),
        });
        Ok(checkpoint_id)
    }

    /// Resume a suspended process into its pre-suspend state.
    pub fn resume(&mut self, pid: &ProcessId) -> Result<ProcessState> {
        let process = self
            .processes
            .get(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        let target = process.suspended_from.unwrap_or(ProcessState::Ready);

        self.transition(pid, &[ProcessState::Suspended], target, "resume")?;
        if let Some(process) = self.processes.get_mut(pid) {
            process.suspended_from = None;
        }
        self.events.emit(ProcessEvent::Resumed {
            pid: pid.clone(),
            state: target,
        });
        Ok(target)
    }

    /// Terminate a live process, release its inbox and handlers, and send
    /// SIGCHLD to its parent.
    pub fn terminate(&mut self, pid: &ProcessId, mode: TerminationMode) -> Result<()> {
        self.transition(pid, &LIVE_STATES, ProcessState::Terminated, "terminate")?;

        let now = self.ctx.now();
        let exit_code = mode.exit_code();
        let mut parent = None;
        if let Some(process) = self.processes.get_mut(pid) {
            process.terminated_at = Some(now);
            process.exit_code = Some(exit_code);
            process.suspended_from = None;
            if process.exit_reason.is_none() {
                process.exit_reason = Some(
                    match mode {
                        TerminationMode::Graceful => "terminated",
                        TerminationMode::Forced => "killed",
                    }
                    .to_string(),
                );
            }
            parent = process.parent_pid.clone();
        }
        if let Some(inbox) = self.inboxes.get_mut(pid) {
            inbox.clear();
        }
        self.handlers.clear(pid);
        self.recoveries.remove(pid);
        self.stats.total_terminated += 1;

        tracing::info!(
            "process_terminated: pid={}, mode={:?}, exit_code={}",
            pid,
            mode,
            exit_code
        );
        self.events.emit(ProcessEvent::Terminated {
            pid: pid.clone(),
            mode,
            exit_code,
        });

        if let Some(parent) = parent {
            self.notify_parent(&parent, pid);
        }
        Ok(())
    }

    /// Mark a process failed. The reason is stored as data in `exit_reason`.
    ///
    /// With auto-recovery on and restarts left, a restore-and-restart is
    /// scheduled after `restart_delay * (attempt + 1)`.
    pub fn fail(&mut self, pid: &ProcessId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.transition(pid, &LIVE_STATES, ProcessState::Failed, "fail")?;

        let now = self.ctx.now();
        let mut restart_count = 0;
        if let Some(process) = self.processes.get_mut(pid) {
            process.exit_code = Some(1);
            process.exit_reason = Some(reason.clone());
            process.suspended_from = None;
            restart_count = process.restart_count;
        }
        self.stats.total_failed += 1;

        tracing::warn!("process_failed: pid={}, reason={}", pid, reason);
        self.events.emit(ProcessEvent::Failed {
            pid: pid.clone(),
            reason,
        });

        if !self.config.auto_recovery {
            return Ok(());
        }
        if restart_count >= self.config.max_restart_attempts {
            tracing::warn!(
                "process_recovery_exhausted: pid={}, restarts={}",
                pid,
                restart_count
            );
            return Ok(());
        }

        let delay = self.config.restart_delay.saturating_mul(restart_count + 1);
        let recovery = PendingRecovery {
            pid: pid.clone(),
            attempt: restart_count,
            delay,
            due_at: now + to_chrono(delay),
        };
        tracing::info!(
            "process_recovery_scheduled: pid={}, attempt={}, delay={:?}",
            pid,
            restart_count,
            delay
        );
        self.recoveries.insert(pid.clone(), recovery);
        Ok(())
    }

    /// Fire every pending recovery whose due time has passed.
    ///
    /// Returns the pids that were restarted.
    pub fn run_due_recoveries(&mut self) -> Vec<ProcessId> {
        let now = self.ctx.now();
        let mut due: Vec<PendingRecovery> = self
            .recoveries
            .values()
            .filter(|r| r.due_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a: &PendingRecovery, b: &PendingRecovery| {
            a.due_at.cmp(&b.due_at).then_with(|| a.pid.cmp(&b.pid))
        });

        let mut recovered = Vec::with_capacity(due.len());
        for recovery in due {
            self.recoveries.remove(&recovery.pid);
            match self.recover(&recovery) {
                Ok(()) => recovered.push(recovery.pid),
                Err(e) => {
                    tracing::warn!("process_recovery_failed: pid={}, error={}", recovery.pid, e)
                }
            }
        }
        recovered
    }

    fn recover(&mut self, recovery: &PendingRecovery) -> Result<()> {
        let pid = &recovery.pid;
        let state = self.state_of(pid)?;
        if state != ProcessState::Failed {
            return Err(Error::state_transition(format!(
                "cannot recover pid {}: state is {:?}, expected Failed",
                pid, state
            )));
        }

        let checkpoint = self
            .contexts
            .get(pid)
            .and_then(|c| c.latest_checkpoint())
            .cloned();
        if let Some(checkpoint) = &checkpoint {
            self.apply_checkpoint(pid, checkpoint);
        }

        let mut restart_count = 0;
        if let Some(process) = self.processes.get_mut(pid) {
            process.restart_count += 1;
            process.exit_code = None;
            process.exit_reason = None;
            restart_count = process.restart_count;
        }
        self.transition(pid, &[ProcessState::Failed], ProcessState::Ready, "recover")?;
        self.start(pid)?;
        self.stats.total_recovered += 1;

        tracing::info!(
            "process_recovered: pid={}, restart_count={}, checkpoint={:?}",
            pid,
            restart_count,
            checkpoint.as_ref().map(|c| c.id.as_str())
        );
        self.events.emit(ProcessEvent::Recovered {
            pid: pid.clone(),
            checkpoint_id: checkpoint.map(|c| c.id),
            restart_count,
        });
        Ok(())
    }

    /// Terminate every live process (children first). Returns how many.
    pub fn terminate_all(&mut self, mode: TerminationMode) -> usize {
        let mut live: Vec<(DateTime<Utc>, ProcessId)> = self
            .processes
            .values()
            .filter(|p| !p.state.is_terminal())
            .map(|p| (p.created_at, p.pid.clone()))
            .collect();
        live.sort();
        live.reverse();

        live.iter()
            .filter(|(_, pid)| self.terminate(pid, mode).is_ok())
            .count()
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Snapshot one process.
    pub fn checkpoint(&mut self, pid: &ProcessId) -> Result<CheckpointId> {
        let state = self.state_of(pid)?;
        if state.is_terminal() {
            return Err(Error::state_transition(format!(
                "cannot checkpoint pid {}: state is {:?}",
                pid, state
            )));
        }
        self.take_checkpoint(pid, CheckpointReason::Manual)
    }

    /// Periodic pass: snapshot every running or waiting process.
    pub fn checkpoint_processes(&mut self) -> usize {
        let mut pids: Vec<ProcessId> = self
            .processes
            .values()
            .filter(|p| matches!(p.state, ProcessState::Running | ProcessState::Waiting))
            .map(|p| p.pid.clone())
            .collect();
        pids.sort();

        let mut taken = 0;
        for pid in &pids {
            match self.take_checkpoint(pid, CheckpointReason::Periodic) {
                Ok(_) => taken += 1,
                Err(e) => tracing::warn!("process_checkpoint_failed: pid={}, error={}", pid, e),
            }
        }
        if taken > 0 {
            tracing::debug!("process_checkpoint_pass: taken={}", taken);
        }
        taken
    }

    /// Replace the live state and context with a stored checkpoint, the
    /// latest one unless `checkpoint_id` is given.
    pub fn restore_from_checkpoint(
        &mut self,
        pid: &ProcessId,
        checkpoint_id: Option<&CheckpointId>,
    ) -> Result<ProcessCheckpoint> {
        let state = self.state_of(pid)?;
        if matches!(state, ProcessState::Terminated | ProcessState::Zombie) {
            return Err(Error::state_transition(format!(
                "cannot restore pid {}: state is {:?}",
                pid, state
            )));
        }

        let context = self
            .contexts
            .get(pid)
            .ok_or_else(|| Error::not_found(format!("no context for pid {}", pid)))?;
        let checkpoint = match checkpoint_id {
            Some(id) => context
                .find_checkpoint(id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("unknown checkpoint: {}", id)))?,
            None => context
                .latest_checkpoint()
                .cloned()
                .ok_or_else(|| Error::not_found(format!("no checkpoint for pid {}", pid)))?,
        };

        self.apply_checkpoint(pid, &checkpoint);
        self.recoveries.remove(pid);

        let now = self.ctx.now();
        let mut restart_count = 0;
        if let Some(process) = self.processes.get_mut(pid) {
            process.state = checkpoint.state;
            process.state_changed_at = now;
            process.suspended_from = None;
            process.exit_code = None;
            process.exit_reason = None;
            restart_count = process.restart_count;
        }
        if state != checkpoint.state {
            self.events.emit(ProcessEvent::StateChanged {
                pid: pid.clone(),
                from: state,
                to: checkpoint.state,
            });
        }

        tracing::info!(
            "process_restored: pid={}, checkpoint={}, state={:?}",
            pid,
            checkpoint.id,
            checkpoint.state
        );
        self.events.emit(ProcessEvent::Recovered {
            pid: pid.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
            restart_count,
        });
        Ok(checkpoint)
    }

    fn take_checkpoint(&mut self, pid: &ProcessId, reason: CheckpointReason) -> Result<CheckpointId> {
        let process = self
            .processes
            .get(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        let context = self
            .contexts
            .get_mut(pid)
            .ok_or_else(|| Error::not_found(format!("no context for pid {}", pid)))?;

        let id = CheckpointId::generate(self.ctx.ids.as_ref());
        context.store(ProcessCheckpoint {
            id: id.clone(),
            pid: pid.clone(),
            taken_at: self.ctx.now(),
            reason,
            state: process.state,
            stack: context.stack.clone(),
            variables: context.variables.clone(),
            usage: process.usage,
        });
        self.stats.total_checkpoints += 1;

        self.events.emit(ProcessEvent::Checkpoint {
            pid: pid.clone(),
            checkpoint_id: id.clone(),
            reason,
        });
        Ok(id)
    }

    fn apply_checkpoint(&mut self, pid: &ProcessId, checkpoint: &ProcessCheckpoint) {
        if let Some(context) = self.contexts.get_mut(pid) {
            context.restore(checkpoint);
        }
        if let Some(process) = self.processes.get_mut(pid) {
            process.usage = checkpoint.usage;
        }
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Deliver a signal: the registered handler runs first, then the built-in
    /// action (SIGTERM/SIGKILL terminate, SIGSTOP suspends, SIGCONT resumes).
    pub fn send_signal(&mut self, pid: &ProcessId, signal: Signal) -> Result<()> {
        if !self.processes.contains_key(pid) {
            return Err(Error::not_found(format!("unknown pid: {}", pid)));
        }

        let handled = self.handlers.invoke(pid, signal);
        self.stats.total_signals += 1;
        tracing::debug!("process_signal: pid={}, signal={}, handled={}", pid, signal, handled);
        self.events.emit(ProcessEvent::Signal {
            pid: pid.clone(),
            signal,
            handled,
        });

        match signal {
            Signal::Term => self.terminate(pid, TerminationMode::Graceful),
            Signal::Kill => self.terminate(pid, TerminationMode::Forced),
            Signal::Stop => self.suspend(pid).map(|_| ()),
            Signal::Cont => self.resume(pid).map(|_| ()),
            Signal::Chld | Signal::Int | Signal::Usr1 | Signal::Usr2 => Ok(()),
        }
    }

    pub fn register_signal_handler<F>(
        &mut self,
        pid: &ProcessId,
        signal: Signal,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(&ProcessId, Signal) + Send + 'static,
    {
        let state = self.state_of(pid)?;
        if state.is_terminal() {
            return Err(Error::state_transition(format!(
                "cannot register handler for pid {}: state is {:?}",
                pid, state
            )));
        }
        self.handlers.register(pid, signal, Box::new(handler));
        Ok(())
    }

    pub fn unregister_signal_handler(&mut self, pid: &ProcessId, signal: Signal) -> bool {
        self.handlers.unregister(pid, signal)
    }

    pub fn handler_count(&self, pid: &ProcessId) -> usize {
        self.handlers.count(pid)
    }

    fn notify_parent(&mut self, parent: &ProcessId, child: &ProcessId) {
        let alive = self
            .processes
            .get(parent)
            .is_some_and(|p| !p.state.is_terminal());
        if !alive {
            return;
        }
        if let Err(e) = self.send_signal(parent, Signal::Chld) {
            tracing::warn!(
                "process_sigchld_failed: parent={}, child={}, error={}",
                parent,
                child,
                e
            );
        }
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Queue a message for `to`. A waiting recipient is woken.
    pub fn send_message(
        &mut self,
        from: Option<&ProcessId>,
        to: &ProcessId,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<MessageId> {
        let state = self.state_of(to)?;
        if state.is_terminal() {
            return Err(Error::state_transition(format!(
                "cannot deliver to pid {}: state is {:?}",
                to, state
            )));
        }
        if let Some(from) = from {
            if !self.processes.contains_key(from) {
                return Err(Error::not_found(format!("unknown sender pid: {}", from)));
            }
        }
        let inbox = self
            .inboxes
            .entry(to.clone())
            .or_default();
        if inbox.len() >= self.config.max_inbox_size {
            return Err(Error::quota_exceeded(format!(
                "inbox full for pid {}: {} messages",
                to,
                inbox.len()
            )));
        }

        let message = ProcessMessage {
            id: MessageId::generate(self.ctx.ids.as_ref()),
            from: from.cloned(),
            to: to.clone(),
            kind: kind.into(),
            payload,
            sent_at: self.ctx.now(),
        };
        let event = ProcessEvent::Message {
            message_id: message.id.clone(),
            from: message.from.clone(),
            to: to.clone(),
            kind: message.kind.clone(),
        };
        let message_id = message.id.clone();
        inbox.push_back(message);

        if let Some(sender) = from.and_then(|f| self.processes.get_mut(f)) {
            sender.usage.messages_sent += 1;
        }
        if let Some(recipient) = self.processes.get_mut(to) {
            recipient.usage.messages_received += 1;
        }
        self.stats.total_messages += 1;
        self.events.emit(event);

        if state == ProcessState::Waiting {
            self.wake(to)?;
        }
        Ok(message_id)
    }

    /// Drain the inbox.
    pub fn receive_messages(&mut self, pid: &ProcessId) -> Result<Vec<ProcessMessage>> {
        let inbox = self
            .inboxes
            .get_mut(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        Ok(inbox.drain(..).collect())
    }

    pub fn peek_messages(&self, pid: &ProcessId) -> Option<&VecDeque<ProcessMessage>> {
        self.inboxes.get(pid)
    }

    // =========================================================================
    // Context
    // =========================================================================

    pub fn context(&self, pid: &ProcessId) -> Option<&ProcessContext> {
        self.contexts.get(pid)
    }

    pub fn push_frame(&mut self, pid: &ProcessId, name: impl Into<String>) -> Result<()> {
        let now = self.ctx.now();
        self.context_mut(pid)?.push_frame(name, now);
        Ok(())
    }

    pub fn pop_frame(&mut self, pid: &ProcessId) -> Result<Option<StackFrame>> {
        Ok(self.context_mut(pid)?.pop_frame())
    }

    /// Bind a variable, returning the previous value.
    pub fn set_variable(
        &mut self,
        pid: &ProcessId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self.context_mut(pid)?.variables.insert(key.into(), value))
    }

    pub fn get_variable(&self, pid: &ProcessId, key: &str) -> Option<&serde_json::Value> {
        self.contexts.get(pid).and_then(|c| c.variables.get(key))
    }

    pub fn record_usage(&mut self, pid: &ProcessId, delta: &ResourceUsage) -> Result<()> {
        let process = self
            .processes
            .get_mut(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        process.usage.add(delta);
        Ok(())
    }

    fn context_mut(&mut self, pid: &ProcessId) -> Result<&mut ProcessContext> {
        self.contexts
            .get_mut(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Create a group led by `leader`. A process belongs to at most one group.
    pub fn create_group(&mut self, name: impl Into<String>, leader: &ProcessId) -> Result<GroupId> {
        self.ensure_groupless(leader)?;

        let id = GroupId::generate(self.ctx.ids.as_ref());
        let name = name.into();
        let group = ProcessGroup::new(id.clone(), name.clone(), leader.clone(), self.ctx.now());
        self.groups.insert(id.clone(), group);
        if let Some(process) = self.processes.get_mut(leader) {
            process.group_id = Some(id.clone());
        }

        tracing::debug!("group_created: id={}, name={}, leader={}", id, name, leader);
        self.events.emit(ProcessEvent::GroupCreated {
            group_id: id.clone(),
            name,
            leader: leader.clone(),
        });
        Ok(id)
    }

    pub fn add_to_group(&mut self, group_id: &GroupId, pid: &ProcessId) -> Result<()> {
        if !self.groups.contains_key(group_id) {
            return Err(Error::not_found(format!("unknown group: {}", group_id)));
        }
        self.ensure_groupless(pid)?;

        if let Some(group) = self.groups.get_mut(group_id) {
            group.add(pid.clone());
        }
        if let Some(process) = self.processes.get_mut(pid) {
            process.group_id = Some(group_id.clone());
        }
        self.events.emit(ProcessEvent::GroupJoined {
            group_id: group_id.clone(),
            pid: pid.clone(),
        });
        Ok(())
    }

    /// Remove a member. The last member leaving dissolves the group.
    pub fn remove_from_group(&mut self, group_id: &GroupId, pid: &ProcessId) -> Result<()> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| Error::not_found(format!("unknown group: {}", group_id)))?;
        if !group.remove(pid) {
            return Err(Error::not_found(format!(
                "pid {} is not a member of group {}",
                pid, group_id
            )));
        }
        let now_empty = group.is_empty();

        if let Some(process) = self.processes.get_mut(pid) {
            process.group_id = None;
        }
        self.events.emit(ProcessEvent::GroupLeft {
            group_id: group_id.clone(),
            pid: pid.clone(),
        });

        if now_empty {
            self.dissolve_group(group_id)?;
        }
        Ok(())
    }

    pub fn dissolve_group(&mut self, group_id: &GroupId) -> Result<ProcessGroup> {
        let group = self
            .groups
            .remove(group_id)
            .ok_or_else(|| Error::not_found(format!("unknown group: {}", group_id)))?;
        for member in &group.members {
            if let Some(process) = self.processes.get_mut(member) {
                process.group_id = None;
            }
        }

        tracing::debug!("group_dissolved: id={}, members={}", group_id, group.members.len());
        self.events.emit(ProcessEvent::GroupDissolved {
            group_id: group_id.clone(),
        });
        Ok(group)
    }

    /// Send `signal` to every member. Returns how many deliveries succeeded;
    /// individual failures are logged.
    pub fn send_group_signal(&mut self, group_id: &GroupId, signal: Signal) -> Result<usize> {
        let members = self
            .groups
            .get(group_id)
            .map(|g| g.members.clone())
            .ok_or_else(|| Error::not_found(format!("unknown group: {}", group_id)))?;

        let mut delivered = 0;
        for member in &members {
            match self.send_signal(member, signal) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    "group_signal_failed: group={}, pid={}, signal={}, error={}",
                    group_id,
                    member,
                    signal,
                    e
                ),
            }
        }

        self.events.emit(ProcessEvent::GroupSignal {
            group_id: group_id.clone(),
            signal,
            delivered,
        });
        Ok(delivered)
    }

    pub fn get_group(&self, group_id: &GroupId) -> Option<&ProcessGroup> {
        self.groups.get(group_id)
    }

    fn ensure_groupless(&self, pid: &ProcessId) -> Result<()> {
        let process = self
            .processes
            .get(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        match &process.group_id {
            Some(existing) => Err(Error::already_exists(format!(
                "pid {} already in group {}",
                pid, existing
            ))),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Classify processes and promote terminated ones older than the zombie
    /// timeout.
    pub fn health_check(&mut self) -> HealthReport {
        let now = self.ctx.now();
        let timeout = to_chrono(self.config.zombie_timeout);

        let mut stale: Vec<ProcessId> = self
            .processes
            .values()
            .filter(|p| p.state == ProcessState::Terminated)
            .filter(|p| p.terminated_at.is_some_and(|t| now - t > timeout))
            .map(|p| p.pid.clone())
            .collect();
        stale.sort();

        let mut promoted = Vec::with_capacity(stale.len());
        for pid in stale {
            match self.transition(&pid, &[ProcessState::Terminated], ProcessState::Zombie, "reap") {
                Ok(_) => promoted.push(pid),
                Err(e) => tracing::warn!("process_zombie_promotion_failed: pid={}, error={}", pid, e),
            }
        }

        let count = |pred: fn(ProcessState) -> bool| {
            self.processes.values().filter(|p| pred(p.state)).count()
        };
        let report = HealthReport {
            checked_at: now,
            total: self.processes.len(),
            healthy: count(ProcessState::is_healthy),
            unhealthy: count(|s| s == ProcessState::Failed),
            zombies: count(|s| s == ProcessState::Zombie),
            promoted,
        };

        tracing::debug!(
            "process_health_check: total={}, healthy={}, unhealthy={}, zombies={}",
            report.total,
            report.healthy,
            report.unhealthy,
            report.zombies
        );
        self.events.emit(ProcessEvent::HealthCheck {
            healthy: report.healthy,
            unhealthy: report.unhealthy,
            zombies: report.zombies,
        });
        report
    }

    /// Reclaim every zombie. Returns the reaped pids.
    pub fn cleanup_zombies(&mut self) -> Vec<ProcessId> {
        let mut zombies: Vec<(ProcessId, Option<GroupId>)> = self
            .processes
            .values()
            .filter(|p| p.state == ProcessState::Zombie)
            .map(|p| (p.pid.clone(), p.group_id.clone()))
            .collect();
        zombies.sort();

        let mut reaped = Vec::with_capacity(zombies.len());
        for (pid, group_id) in zombies {
            if let Some(group_id) = group_id {
                if let Err(e) = self.remove_from_group(&group_id, &pid) {
                    tracing::warn!("process_group_cleanup_failed: pid={}, error={}", pid, e);
                }
            }
            self.processes.remove(&pid);
            self.contexts.remove(&pid);
            self.inboxes.remove(&pid);
            self.handlers.clear(&pid);
            self.recoveries.remove(&pid);
            reaped.push(pid);
        }

        if !reaped.is_empty() {
            self.stats.zombies_reaped += reaped.len() as u64;
            tracing::info!("process_zombies_reaped: count={}", reaped.len());
        }
        reaped
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_process(&self, pid: &ProcessId) -> Option<&ProcessDescriptor> {
        self.processes.get(pid)
    }

    /// Direct children, oldest first.
    pub fn children(&self, pid: &ProcessId) -> Vec<&ProcessDescriptor> {
        let mut children: Vec<&ProcessDescriptor> = self
            .processes
            .values()
            .filter(|p| p.parent_pid.as_ref() == Some(pid))
            .collect();
        children.sort_by(|a: &&ProcessDescriptor, b: &&ProcessDescriptor| {
            a.created_at.cmp(&b.created_at).then_with(|| a.pid.cmp(&b.pid))
        });
        children
    }

    /// All processes, or those in `state`, oldest first.
    pub fn list_processes(&self, state: Option<ProcessState>) -> Vec<&ProcessDescriptor> {
        let mut list: Vec<&ProcessDescriptor> = self
            .processes
            .values()
            .filter(|p| state.map_or(true, |s| p.state == s))
            .collect();
        list.sort_by(|a: &&ProcessDescriptor, b: &&ProcessDescriptor| {
            a.created_at.cmp(&b.created_at).then_with(|| a.pid.cmp(&b.pid))
        });
        list
    }

    /// Scheduled recoveries, earliest first.
    pub fn pending_recoveries(&self) -> Vec<PendingRecovery> {
        let mut pending: Vec<PendingRecovery> = self.recoveries.values().cloned().collect();
        pending.sort_by(|a: &PendingRecovery, b: &PendingRecovery| {
            a.due_at.cmp(&b.due_at).then_with(|| a.pid.cmp(&b.pid))
        });
        pending
    }

    /// Drop every scheduled recovery. Returns how many were dropped.
    pub fn cancel_recoveries(&mut self) -> usize {
        let cancelled = self.recoveries.len();
        self.recoveries.clear();
        if cancelled > 0 {
            tracing::info!("process_recoveries_cancelled: count={}", cancelled);
        }
        cancelled
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn stats(&self) -> ProcessStats {
        ProcessStats {
            live: self
                .processes
                .values()
                .filter(|p| !p.state.is_terminal())
                .count(),
            ..self.stats.clone()
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn state_of(&self, pid: &ProcessId) -> Result<ProcessState> {
        self.processes
            .get(pid)
            .map(|p| p.state)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))
    }

    /// Move `pid` to `to` if its current state is in `allowed`. Returns the
    /// previous state.
    fn transition(
        &mut self,
        pid: &ProcessId,
        allowed: &[ProcessState],
        to: ProcessState,
        op: &str,
    ) -> Result<ProcessState> {
        let now = self.ctx.now();
        let process = self
            .processes
            .get_mut(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;

        let from = process.state;
        if !allowed.contains(&from) || !from.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "cannot {} pid {}: state is {:?}, expected one of {:?}",
                op, pid, from, allowed
            )));
        }

        process.state = to;
        process.state_changed_at = now;

        tracing::debug!("process_state_changed: pid={}, from={:?}, to={:?}", pid, from, to);
        self.events.emit(ProcessEvent::StateChanged {
            pid: pid.clone(),
            from,
            to,
        });
        Ok(from)
    }
}
