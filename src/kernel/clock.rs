//! Injectable time and id sources.
//!
//! Components never call `Utc::now()` or mint random ids directly. They read
//! both through a [`KernelContext`], so tests can drive time by hand and get
//! predictable ids.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock with millisecond resolution.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Clock starting at 2024-01-01T00:00:00Z.
    pub fn at_epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }

    pub fn advance(&self, by: std::time::Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
    }
}

/// Source of fresh identifiers.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Return a new unique id starting with `prefix`.
    fn next_id(&self, prefix: &str) -> String;
}

/// `<prefix>_<uuid v4>` ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, uuid::Uuid::new_v4())
    }
}

/// `<prefix>_<n>` ids from one shared monotonic counter.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self, prefix: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst).max(1);
        format!("{}_{}", prefix, n)
    }
}

/// Clock + id generator handed to every component constructor.
#[derive(Debug, Clone)]
pub struct KernelContext {
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

impl KernelContext {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { clock, ids }
    }

    /// Manual clock plus sequential ids; returns the clock so callers can advance it.
    pub fn deterministic() -> (Self, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let ctx = Self::new(clock.clone(), Arc::new(SequentialIdGenerator::new()));
        (ctx, clock)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for KernelContext {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(UuidIdGenerator))
    }
}

/// Convert a config duration into a chrono duration, saturating on overflow.
pub fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_epoch();
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!((clock.now() - start).num_milliseconds(), 1500);
    }

    #[test]
    fn test_sequential_ids_are_shared_across_prefixes() {
        let ids = SequentialIdGenerator::new();
        assert_eq!(ids.next_id("task"), "task_1");
        assert_eq!(ids.next_id("proc"), "proc_2");
    }

    #[test]
    fn test_uuid_generator_prefix() {
        let id = UuidIdGenerator.next_id("req");
        assert!(id.starts_with("req_"));
        assert_eq!(id.len(), "req_".len() + 36);
    }
}
