//! Resource quotas, cost tracking and pools.
//!
//! Every allocation goes through reserve → commit → release:
//! - `allocate` reserves capacity against a quota (overcommit allowed on the
//!   global quotas, not on pools) and records a usage entry keyed by request id.
//! - `commit` moves the reserved amount into `used` and charges its cost.
//! - `release` frees whatever is still reserved, forgets the allocation and
//!   replays queued denials for the same kind.
//!
//! Quota resets are lazy: a quota with a reset period is zeroed the first time
//! it is touched after the period elapsed.
//!
//! NOT a separate actor - owned by Kernel and called via &mut self.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use super::clock::{to_chrono, KernelContext};
use super::types::TaskPriority;
use crate::events::{BusEvent, EventBus, SubscriptionId};
use crate::types::{Error, PoolId, RequestId, Result, TaskId};

// =============================================================================
// Resource kinds and quotas
// =============================================================================

/// Metered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Tokens,
    ToolCalls,
    /// Megabytes.
    Memory,
    /// Milliseconds.
    CpuTime,
    /// Requests.
    Network,
    /// Megabytes.
    Storage,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Tokens,
        ResourceKind::ToolCalls,
        ResourceKind::Memory,
        ResourceKind::CpuTime,
        ResourceKind::Network,
        ResourceKind::Storage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Tokens => "tokens",
            ResourceKind::ToolCalls => "tool_calls",
            ResourceKind::Memory => "memory",
            ResourceKind::CpuTime => "cpu_time",
            ResourceKind::Network => "network",
            ResourceKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live quota for one resource kind in one scope (global or a pool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub kind: ResourceKind,
    pub limit: u64,
    pub used: u64,
    /// Allocated but not yet committed or released.
    pub reserved: u64,
    #[serde(default, with = "humantime_serde")]
    pub reset_period: Option<Duration>,
    pub last_reset: DateTime<Utc>,
    pub cost_per_unit: f64,
}

impl ResourceQuota {
    pub fn new(kind: ResourceKind, limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            limit,
            used: 0,
            reserved: 0,
            reset_period: None,
            last_reset: now,
            cost_per_unit: 0.0,
        }
    }

    /// Ceiling once the overcommit ratio is applied.
    pub fn capacity(&self, overcommit_ratio: f64) -> u64 {
        // Epsilon absorbs binary representation error (100 * 1.2 must be 120).
        let scaled = (self.limit as f64 * overcommit_ratio.max(0.0) + 1e-9).floor();
        if scaled >= u64::MAX as f64 {
            u64::MAX
        } else {
            scaled as u64
        }
    }

    /// Amount still allocatable under `overcommit_ratio`.
    pub fn available(&self, overcommit_ratio: f64) -> u64 {
        self.capacity(overcommit_ratio)
            .saturating_sub(self.used)
            .saturating_sub(self.reserved)
    }

    /// Headroom under the hard limit, ignoring overcommit.
    pub fn remaining(&self) -> u64 {
        self.limit
            .saturating_sub(self.used)
            .saturating_sub(self.reserved)
    }

    pub fn utilization(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        (self.used + self.reserved) as f64 / self.limit as f64
    }

    /// Zero `used` if the reset period has elapsed. Returns true on reset.
    fn reset_if_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.reset_period {
            Some(period) if now - self.last_reset >= to_chrono(period) => {
                self.used = 0;
                self.last_reset = now;
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Limit and optional reset period for one configured quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub limit: u64,
    #[serde(default, with = "humantime_serde")]
    pub reset_period: Option<Duration>,
}

impl QuotaLimit {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            reset_period: None,
        }
    }
}

/// Resource manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Multiplier on global quota limits at allocation time.
    pub overcommit_ratio: f64,
    /// Total spend ceiling; `None` means unlimited.
    pub cost_budget: Option<f64>,
    /// Fraction of the budget left at which a single cost warning fires.
    pub cost_warning_ratio: f64,
    /// Queue quota denials for replay on release.
    pub queue_denied_requests: bool,
    pub max_pending_requests: usize,
    /// Expiry applied to allocations that carry no timeout of their own.
    #[serde(with = "humantime_serde")]
    pub default_allocation_ttl: Option<Duration>,
    pub quotas: BTreeMap<ResourceKind, QuotaLimit>,
    pub cost_rates: BTreeMap<ResourceKind, f64>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        let quotas = [
            (ResourceKind::Tokens, 1_000_000),
            (ResourceKind::ToolCalls, 1000),
            (ResourceKind::Memory, 4096),
            (ResourceKind::CpuTime, 3_600_000),
            (ResourceKind::Network, 10_000),
            (ResourceKind::Storage, 10_240),
        ]
        .into_iter()
        .map(|(kind, limit)| (kind, QuotaLimit::new(limit)))
        .collect();

        let cost_rates = ResourceKind::ALL
            .into_iter()
            .map(|kind| {
                let rate = match kind {
                    ResourceKind::Tokens => 0.000_002,
                    ResourceKind::ToolCalls => 0.001,
                    _ => 0.0,
                };
                (kind, rate)
            })
            .collect();

        Self {
            overcommit_ratio: 1.2,
            cost_budget: None,
            cost_warning_ratio: 0.1,
            queue_denied_requests: true,
            max_pending_requests: 100,
            default_allocation_ttl: None,
            quotas,
            cost_rates,
        }
    }
}

// =============================================================================
// Requests and results
// =============================================================================

/// A request for `amount` units of `kind` on behalf of `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Explicit request id; generated when absent.
    pub id: Option<RequestId>,
    pub task_id: TaskId,
    pub kind: ResourceKind,
    pub amount: u64,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Allocation expiry, measured from the grant.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl AllocationRequest {
    pub fn new(task_id: TaskId, kind: ResourceKind, amount: u64) -> Self {
        Self {
            id: None,
            task_id,
            kind,
            amount,
            priority: TaskPriority::Normal,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Allocated,
    Committed,
    Released,
    Expired,
    Denied,
}

/// Outcome of an allocation, and the retained record while it is live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub request_id: RequestId,
    pub task_id: TaskId,
    pub kind: ResourceKind,
    pub status: AllocationStatus,
    /// Awarded amount (0 when denied).
    pub amount: u64,
    /// Quota headroom under the hard limit after this decision.
    pub remaining: u64,
    pub estimated_cost: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<PoolId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub decided_at: DateTime<Utc>,
}

impl AllocationResult {
    pub fn is_allocated(&self) -> bool {
        self.status == AllocationStatus::Allocated
    }

    pub fn is_denied(&self) -> bool {
        self.status == AllocationStatus::Denied
    }
}

/// Usage entry for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: RequestId,
    pub task_id: TaskId,
    pub kind: ResourceKind,
    pub reserved: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
    pub cost: f64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once the allocation is released or expires. The record is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn is_open(&self) -> bool {
        self.released_at.is_none()
    }
}

/// A denied request waiting for capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request: AllocationRequest,
    pub pool_id: Option<PoolId>,
    pub queued_at: DateTime<Utc>,
    sequence: u64,
}

// =============================================================================
// Pools
// =============================================================================

/// Independent quota namespace with a membership set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: PoolId,
    pub name: String,
    pub quotas: BTreeMap<ResourceKind, ResourceQuota>,
    /// Task ids allowed to draw from a private pool.
    pub members: HashSet<TaskId>,
    /// Shared pools admit any task.
    pub shared: bool,
    pub created_at: DateTime<Utc>,
}

impl ResourcePool {
    pub fn admits(&self, task_id: &TaskId) -> bool {
        self.shared || self.members.contains(task_id)
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceEvent {
    Allocated {
        request_id: RequestId,
        task_id: TaskId,
        kind: ResourceKind,
        amount: u64,
        pool_id: Option<PoolId>,
    },
    Committed {
        request_id: RequestId,
        kind: ResourceKind,
        amount: u64,
        cost: f64,
    },
    Released {
        request_id: RequestId,
        kind: ResourceKind,
        freed: u64,
    },
    Expired {
        request_id: RequestId,
        kind: ResourceKind,
        freed: u64,
    },
    Denied {
        request_id: RequestId,
        kind: ResourceKind,
        amount: u64,
        reason: String,
    },
    QuotaExceeded {
        kind: ResourceKind,
        requested: u64,
        available: u64,
        pool_id: Option<PoolId>,
    },
    CostWarning {
        total_cost: f64,
        budget: f64,
        remaining: f64,
    },
    QuotaReset {
        kind: ResourceKind,
        pool_id: Option<PoolId>,
    },
    PoolCreated {
        pool_id: PoolId,
        name: String,
    },
    PoolUpdated {
        pool_id: PoolId,
    },
}

impl BusEvent for ResourceEvent {
    fn kind(&self) -> &'static str {
        match self {
            ResourceEvent::Allocated { .. } => "resource:allocated",
            ResourceEvent::Committed { .. } => "resource:committed",
            ResourceEvent::Released { .. } => "resource:released",
            ResourceEvent::Expired { .. } => "resource:expired",
            ResourceEvent::Denied { .. } => "resource:denied",
            ResourceEvent::QuotaExceeded { .. } => "resource:quota_exceeded",
            ResourceEvent::CostWarning { .. } => "resource:cost_warning",
            ResourceEvent::QuotaReset { .. } => "quota:reset",
            ResourceEvent::PoolCreated { .. } => "pool:created",
            ResourceEvent::PoolUpdated { .. } => "pool:updated",
        }
    }
}

// =============================================================================
// Reporting
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaUtilization {
    pub kind: ResourceKind,
    pub limit: u64,
    pub used: u64,
    pub reserved: u64,
    pub utilization: f64,
}

/// Point-in-time summary of global quotas and spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub quotas: Vec<QuotaUtilization>,
    pub total_cost: f64,
    pub remaining_budget: Option<f64>,
    pub active_allocations: usize,
    pub pending_requests: usize,
    pub pools: usize,
}

// =============================================================================
// ResourceManager
// =============================================================================

/// Reason strings surfaced in denials.
const INSUFFICIENT_QUOTA: &str = "Insufficient quota";
const BUDGET_EXCEEDED: &str = "Budget exceeded";

#[derive(Debug)]
pub struct ResourceManager {
    config: ResourceConfig,
    ctx: KernelContext,
    quotas: BTreeMap<ResourceKind, ResourceQuota>,
    allocations: HashMap<RequestId, AllocationResult>,
    usage: HashMap<RequestId, UsageRecord>,
    pending: Vec<PendingRequest>,
    pools: HashMap<PoolId, ResourcePool>,
    total_cost: f64,
    cost_warning_sent: bool,
    next_pending_sequence: u64,
    events: EventBus<ResourceEvent>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig, ctx: KernelContext) -> Self {
        let now = ctx.now();
        let quotas = config
            .quotas
            .iter()
            .map(|(&kind, limit)| {
                let mut quota = ResourceQuota::new(kind, limit.limit, now);
                quota.reset_period = limit.reset_period;
                quota.cost_per_unit = config.cost_rates.get(&kind).copied().unwrap_or(0.0);
                (kind, quota)
            })
            .collect();

        Self {
            config,
            ctx,
            quotas,
            allocations: HashMap::new(),
            usage: HashMap::new(),
            pending: Vec::new(),
            pools: HashMap::new(),
            total_cost: 0.0,
            cost_warning_sent: false,
            next_pending_sequence: 0,
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn subscribe<F>(&mut self, kind: &str, handler: F) -> SubscriptionId
    where
        F: FnMut(&ResourceEvent) + Send + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn events(&self) -> &EventBus<ResourceEvent> {
        &self.events
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Reserve capacity from the global quotas.
    ///
    /// Denials are returned as `Ok` results with `status == Denied`.
    pub fn allocate(&mut self, request: AllocationRequest) -> Result<AllocationResult> {
        self.allocate_in(None, request, true)
    }

    /// Reserve capacity from a pool. No overcommit; private pools reject non-members.
    pub fn allocate_from_pool(
        &mut self,
        pool_id: &PoolId,
        request: AllocationRequest,
    ) -> Result<AllocationResult> {
        let pool = self
            .pools
            .get(pool_id)
            .ok_or_else(|| Error::not_found(format!("unknown pool: {}", pool_id)))?;

        if !pool.admits(&request.task_id) {
            let request_id = self.request_id(&request);
            let reason = format!("Task {} is not a member of pool {}", request.task_id, pool_id);
            return Ok(self.deny(request_id, &request, Some(pool_id.clone()), 0, reason));
        }

        self.allocate_in(Some(pool_id.clone()), request, true)
    }

    fn request_id(&self, request: &AllocationRequest) -> RequestId {
        request
            .id
            .clone()
            .unwrap_or_else(|| RequestId::generate(self.ctx.ids.as_ref()))
    }

    fn allocate_in(
        &mut self,
        pool_id: Option<PoolId>,
        mut request: AllocationRequest,
        may_queue: bool,
    ) -> Result<AllocationResult> {
        if request.amount == 0 {
            return Err(Error::validation("allocation amount must be positive"));
        }
        let request_id = self.request_id(&request);
        request.id = Some(request_id.clone());

        if self.allocations.contains_key(&request_id) {
            return Err(Error::already_exists(format!(
                "allocation {} is already live",
                request_id
            )));
        }

        let now = self.ctx.now();
        let overcommit = if pool_id.is_some() {
            1.0
        } else {
            self.config.overcommit_ratio
        };
        self.touch_quota(pool_id.as_ref(), request.kind, now);

        let Some(quota) = self.quota_in(pool_id.as_ref(), request.kind) else {
            let reason = format!("No quota configured for {}", request.kind);
            return Ok(self.deny(request_id, &request, pool_id, 0, reason));
        };

        let available = quota.available(overcommit);
        let remaining = quota.remaining();
        let cost_per_unit = quota.cost_per_unit;

        if request.amount > available {
            self.events.emit(ResourceEvent::QuotaExceeded {
                kind: request.kind,
                requested: request.amount,
                available,
                pool_id: pool_id.clone(),
            });
            if may_queue && self.config.queue_denied_requests {
                self.enqueue_pending(&request, pool_id.clone(), now);
            }
            return Ok(self.deny(
                request_id,
                &request,
                pool_id,
                remaining,
                INSUFFICIENT_QUOTA.to_string(),
            ));
        }

        let cost = request.amount as f64 * cost_per_unit;
        if let Some(budget) = self.config.cost_budget {
            if self.total_cost + cost > budget {
                return Ok(self.deny(
                    request_id,
                    &request,
                    pool_id,
                    remaining,
                    BUDGET_EXCEEDED.to_string(),
                ));
            }
        }

        let remaining = match self.quota_in_mut(pool_id.as_ref(), request.kind) {
            Some(quota) => {
                quota.reserved += request.amount;
                quota.remaining()
            }
            None => remaining,
        };

        let expires_at = request
            .timeout
            .or(self.config.default_allocation_ttl)
            .map(|ttl| now + to_chrono(ttl));

        let result = AllocationResult {
            request_id: request_id.clone(),
            task_id: request.task_id.clone(),
            kind: request.kind,
            status: AllocationStatus::Allocated,
            amount: request.amount,
            remaining,
            estimated_cost: cost,
            pool_id: pool_id.clone(),
            expires_at,
            reason: None,
            decided_at: now,
        };
        self.allocations.insert(request_id.clone(), result.clone());
        self.usage.insert(
            request_id.clone(),
            UsageRecord {
                request_id: request_id.clone(),
                task_id: request.task_id.clone(),
                kind: request.kind,
                reserved: request.amount,
                actual: None,
                cost,
                started_at: now,
                completed_at: None,
                released_at: None,
            },
        );

        tracing::debug!(
            "resource_allocated: request={}, task={}, kind={}, amount={}, remaining={}",
            request_id,
            request.task_id,
            request.kind,
            request.amount,
            remaining
        );
        self.events.emit(ResourceEvent::Allocated {
            request_id,
            task_id: request.task_id,
            kind: request.kind,
            amount: request.amount,
            pool_id,
        });
        Ok(result)
    }

    fn deny(
        &mut self,
        request_id: RequestId,
        request: &AllocationRequest,
        pool_id: Option<PoolId>,
        remaining: u64,
        reason: String,
    ) -> AllocationResult {
        tracing::warn!(
            "resource_denied: request={}, task={}, kind={}, amount={}, reason={}",
            request_id,
            request.task_id,
            request.kind,
            request.amount,
            reason
        );
        self.events.emit(ResourceEvent::Denied {
            request_id: request_id.clone(),
            kind: request.kind,
            amount: request.amount,
            reason: reason.clone(),
        });
        AllocationResult {
            request_id,
            task_id: request.task_id.clone(),
            kind: request.kind,
            status: AllocationStatus::Denied,
            amount: 0,
            remaining,
            estimated_cost: 0.0,
            pool_id,
            expires_at: None,
            reason: Some(reason),
            decided_at: self.ctx.now(),
        }
    }

    fn enqueue_pending(&mut self, request: &AllocationRequest, pool_id: Option<PoolId>, now: DateTime<Utc>) {
        if self
            .pending
            .iter()
            .any(|p| p.request.id == request.id)
        {
            return;
        }
        if self.pending.len() >= self.config.max_pending_requests {
            tracing::warn!(
                "resource_pending_queue_full: size={}, dropped_task={}",
                self.pending.len(),
                request.task_id
            );
            return;
        }
        self.next_pending_sequence += 1;
        self.pending.push(PendingRequest {
            request: request.clone(),
            pool_id,
            queued_at: now,
            sequence: self.next_pending_sequence,
        });
    }

    // =========================================================================
    // Commit / release
    // =========================================================================

    /// Convert a reservation into usage. `actual` defaults to the reserved amount.
    pub fn commit(&mut self, request_id: &RequestId, actual: Option<u64>) -> Result<AllocationResult> {
        let allocation = self
            .allocations
            .get(request_id)
            .ok_or_else(|| Error::not_found(format!("unknown allocation: {}", request_id)))?;
        if allocation.status != AllocationStatus::Allocated {
            return Err(Error::state_transition(format!(
                "cannot commit allocation {}: status is {:?}",
                request_id, allocation.status
            )));
        }

        let (kind, pool_id, reserved) = (allocation.kind, allocation.pool_id.clone(), allocation.amount);
        let actual = actual.unwrap_or(reserved);
        let now = self.ctx.now();
        self.touch_quota(pool_id.as_ref(), kind, now);

        let mut cost_per_unit = 0.0;
        if let Some(quota) = self.quota_in_mut(pool_id.as_ref(), kind) {
            quota.reserved = quota.reserved.saturating_sub(reserved);
            quota.used = quota.used.saturating_add(actual);
            cost_per_unit = quota.cost_per_unit;
        }
        let cost = actual as f64 * cost_per_unit;
        self.total_cost += cost;

        if let Some(record) = self.usage.get_mut(request_id) {
            record.actual = Some(actual);
            record.cost = cost;
            record.completed_at = Some(now);
        }

        let committed = match self.allocations.get_mut(request_id) {
            Some(allocation) => {
                allocation.status = AllocationStatus::Committed;
                allocation.estimated_cost = cost;
                allocation.clone()
            }
            None => return Err(Error::internal("allocation vanished during commit")),
        };

        tracing::debug!(
            "resource_committed: request={}, kind={}, actual={}, cost={:.6}",
            request_id,
            kind,
            actual,
            cost
        );
        self.events.emit(ResourceEvent::Committed {
            request_id: request_id.clone(),
            kind,
            amount: actual,
            cost,
        });
        self.check_budget();
        Ok(committed)
    }

    fn check_budget(&mut self) {
        let Some(budget) = self.config.cost_budget else {
            return;
        };
        if self.cost_warning_sent {
            return;
        }
        let remaining = budget - self.total_cost;
        if remaining < budget * self.config.cost_warning_ratio {
            self.cost_warning_sent = true;
            tracing::warn!(
                "cost_budget_low: total={:.4}, budget={:.4}, remaining={:.4}",
                self.total_cost,
                budget,
                remaining
            );
            self.events.emit(ResourceEvent::CostWarning {
                total_cost: self.total_cost,
                budget,
                remaining,
            });
        }
    }

    /// Free a live allocation and replay queued requests for its kind.
    pub fn release(&mut self, request_id: &RequestId) -> Result<AllocationResult> {
        let mut released = self
            .allocations
            .remove(request_id)
            .ok_or_else(|| Error::not_found(format!("unknown allocation: {}", request_id)))?;

        let freed = self.free_reservation(&released);
        self.close_usage(request_id);
        released.status = AllocationStatus::Released;

        tracing::debug!("resource_released: request={}, kind={}, freed={}", request_id, released.kind, freed);
        self.events.emit(ResourceEvent::Released {
            request_id: request_id.clone(),
            kind: released.kind,
            freed,
        });

        self.replay_pending(released.kind);
        Ok(released)
    }

    fn close_usage(&mut self, request_id: &RequestId) {
        let now = self.ctx.now();
        if let Some(record) = self.usage.get_mut(request_id) {
            record.released_at = Some(now);
        }
    }

    /// Return the still-reserved part of an allocation to its quota.
    fn free_reservation(&mut self, allocation: &AllocationResult) -> u64 {
        if allocation.status != AllocationStatus::Allocated {
            return 0;
        }
        match self.quota_in_mut(allocation.pool_id.as_ref(), allocation.kind) {
            Some(quota) => {
                quota.reserved = quota.reserved.saturating_sub(allocation.amount);
                allocation.amount
            }
            None => 0,
        }
    }

    /// Retry queued requests for `kind`, most urgent first.
    fn replay_pending(&mut self, kind: ResourceKind) {
        let mut candidates: Vec<PendingRequest> = Vec::new();
        self.pending.retain(|p| {
            if p.request.kind == kind {
                candidates.push(p.clone());
                false
            } else {
                true
            }
        });
        candidates.sort_by(|a, b| {
            a.request
                .priority
                .cmp(&b.request.priority)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });

        for pending in candidates {
            let retried = match &pending.pool_id {
                Some(pool_id) if !self.pools.contains_key(pool_id) => continue,
                pool_id => self.allocate_in(pool_id.clone(), pending.request.clone(), false),
            };
            match retried {
                Ok(result) if result.is_allocated() => {
                    tracing::info!(
                        "pending_request_granted: request={}, kind={}, amount={}",
                        result.request_id,
                        kind,
                        result.amount
                    );
                }
                Ok(_) | Err(_) => self.pending.push(pending),
            }
        }
        self.pending.sort_by_key(|p| p.sequence);
    }

    /// Release every still-reserved allocation whose expiry has passed.
    ///
    /// Returns the expired request ids.
    pub fn sweep_expired(&mut self) -> Vec<RequestId> {
        let now = self.ctx.now();
        let mut expired: Vec<RequestId> = self
            .allocations
            .values()
            .filter(|a| a.status == AllocationStatus::Allocated)
            .filter(|a| a.expires_at.is_some_and(|at| at <= now))
            .map(|a| a.request_id.clone())
            .collect();
        expired.sort();

        let mut kinds = Vec::new();
        for request_id in &expired {
            let Some(allocation) = self.allocations.remove(request_id) else {
                continue;
            };
            let freed = self.free_reservation(&allocation);
            self.close_usage(request_id);
            tracing::warn!(
                "resource_expired: request={}, task={}, kind={}, freed={}",
                request_id,
                allocation.task_id,
                allocation.kind,
                freed
            );
            self.events.emit(ResourceEvent::Expired {
                request_id: request_id.clone(),
                kind: allocation.kind,
                freed,
            });
            if !kinds.contains(&allocation.kind) {
                kinds.push(allocation.kind);
            }
        }
        for kind in kinds {
            self.replay_pending(kind);
        }
        expired
    }

    // =========================================================================
    // Quotas
    // =========================================================================

    fn quota_in(&self, pool_id: Option<&PoolId>, kind: ResourceKind) -> Option<&ResourceQuota> {
        match pool_id {
            Some(pool_id) => self.pools.get(pool_id)?.quotas.get(&kind),
            None => self.quotas.get(&kind),
        }
    }

    fn quota_in_mut(&mut self, pool_id: Option<&PoolId>, kind: ResourceKind) -> Option<&mut ResourceQuota> {
        match pool_id {
            Some(pool_id) => self.pools.get_mut(pool_id)?.quotas.get_mut(&kind),
            None => self.quotas.get_mut(&kind),
        }
    }

    /// Apply a lazy reset if the quota's period elapsed.
    fn touch_quota(&mut self, pool_id: Option<&PoolId>, kind: ResourceKind, now: DateTime<Utc>) {
        let reset = self
            .quota_in_mut(pool_id, kind)
            .is_some_and(|quota| quota.reset_if_due(now));
        if reset {
            tracing::debug!("quota_reset: kind={}, pool={:?}", kind, pool_id);
            self.events.emit(ResourceEvent::QuotaReset {
                kind,
                pool_id: pool_id.cloned(),
            });
        }
    }

    pub fn get_quota(&self, kind: ResourceKind) -> Option<&ResourceQuota> {
        self.quotas.get(&kind)
    }

    /// Install or replace a global quota limit. Usage and reservations carry over.
    pub fn set_quota(&mut self, kind: ResourceKind, limit: u64, reset_period: Option<Duration>) {
        let now = self.ctx.now();
        let cost_per_unit = self.config.cost_rates.get(&kind).copied().unwrap_or(0.0);
        let quota = self
            .quotas
            .entry(kind)
            .or_insert_with(|| ResourceQuota::new(kind, limit, now));
        quota.limit = limit;
        quota.reset_period = reset_period;
        quota.cost_per_unit = cost_per_unit;
        tracing::info!("quota_set: kind={}, limit={}", kind, limit);
        self.replay_pending(kind);
    }

    pub fn set_cost_rate(&mut self, kind: ResourceKind, cost_per_unit: f64) {
        self.config.cost_rates.insert(kind, cost_per_unit);
        if let Some(quota) = self.quotas.get_mut(&kind) {
            quota.cost_per_unit = cost_per_unit;
        }
    }

    /// Zero a quota's usage now, regardless of its reset period.
    pub fn reset_quota(&mut self, kind: ResourceKind) -> Result<()> {
        let now = self.ctx.now();
        let quota = self
            .quotas
            .get_mut(&kind)
            .ok_or_else(|| Error::not_found(format!("no quota for {}", kind)))?;
        quota.used = 0;
        quota.last_reset = now;

        self.events.emit(ResourceEvent::QuotaReset { kind, pool_id: None });
        self.replay_pending(kind);
        Ok(())
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Create a pool with its own quotas. Pool quotas inherit global cost rates.
    pub fn create_pool(
        &mut self,
        name: impl Into<String>,
        limits: impl IntoIterator<Item = (ResourceKind, u64)>,
        shared: bool,
    ) -> PoolId {
        let name = name.into();
        let now = self.ctx.now();
        let id = PoolId::generate(self.ctx.ids.as_ref());
        let quotas = limits
            .into_iter()
            .map(|(kind, limit)| {
                let mut quota = ResourceQuota::new(kind, limit, now);
                quota.cost_per_unit = self.config.cost_rates.get(&kind).copied().unwrap_or(0.0);
                (kind, quota)
            })
            .collect();

        self.pools.insert(
            id.clone(),
            ResourcePool {
                id: id.clone(),
                name: name.clone(),
                quotas,
                members: HashSet::new(),
                shared,
                created_at: now,
            },
        );

        tracing::info!("pool_created: id={}, name={}, shared={}", id, name, shared);
        self.events.emit(ResourceEvent::PoolCreated {
            pool_id: id.clone(),
            name,
        });
        id
    }

    pub fn add_pool_member(&mut self, pool_id: &PoolId, task_id: TaskId) -> Result<()> {
        let pool = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| Error::not_found(format!("unknown pool: {}", pool_id)))?;
        if pool.members.insert(task_id) {
            self.events.emit(ResourceEvent::PoolUpdated {
                pool_id: pool_id.clone(),
            });
        }
        Ok(())
    }

    pub fn remove_pool_member(&mut self, pool_id: &PoolId, task_id: &TaskId) -> Result<bool> {
        let pool = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| Error::not_found(format!("unknown pool: {}", pool_id)))?;
        let removed = pool.members.remove(task_id);
        if removed {
            self.events.emit(ResourceEvent::PoolUpdated {
                pool_id: pool_id.clone(),
            });
        }
        Ok(removed)
    }

    pub fn get_pool(&self, pool_id: &PoolId) -> Option<&ResourcePool> {
        self.pools.get(pool_id)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_allocation(&self, request_id: &RequestId) -> Option<&AllocationResult> {
        self.allocations.get(request_id)
    }

    /// Usage history for `task_id`, open and released entries alike.
    pub fn usage_for_task(&self, task_id: &TaskId) -> Vec<&UsageRecord> {
        let mut records: Vec<&UsageRecord> = self
            .usage
            .values()
            .filter(|u| &u.task_id == task_id)
            .collect();
        records.sort_by_key(|u| (u.started_at, u.request_id.clone()));
        records
    }

    /// Queued denials in arrival order.
    pub fn pending_requests(&self) -> &[PendingRequest] {
        &self.pending
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn remaining_budget(&self) -> Option<f64> {
        self.config.cost_budget.map(|b| b - self.total_cost)
    }

    pub fn report(&self) -> ResourceReport {
        ResourceReport {
            quotas: self
                .quotas
                .values()
                .map(|q| QuotaUtilization {
                    kind: q.kind,
                    limit: q.limit,
                    used: q.used,
                    reserved: q.reserved,
                    utilization: q.utilization(),
                })
                .collect(),
            total_cost: self.total_cost,
            remaining_budget: self.remaining_budget(),
            active_allocations: self.allocations.len(),
            pending_requests: self.pending.len(),
            pools: self.pools.len(),
        }
    }
}
