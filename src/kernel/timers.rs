//! Periodic kernel timers.
//!
//! `KernelRuntime` spawns one [`Ticker`] per periodic duty: starvation boost,
//! checkpointing, health checks and the recovery poll. Each tick locks the
//! shared kernel, so timer work is serialized with public calls, and runs
//! inside [`with_recovery`] so a panicking tick is logged and the ticker keeps
//! going.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::Kernel;
use crate::types::{Error, Result};

/// Execute a function with panic recovery.
///
/// If the function panics, the panic is captured, logged, and converted
/// to an `Error::Internal`.
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );
            Err(Error::internal(format!(
                "Panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

/// A background loop calling `tick` on the kernel every `period`.
#[derive(Debug)]
pub struct Ticker {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn the loop. The first tick fires one `period` after spawning.
    pub fn spawn<F>(
        name: &'static str,
        period: Duration,
        kernel: Arc<Mutex<Kernel>>,
        tick: F,
    ) -> Self
    where
        F: Fn(&mut Kernel) + Send + Sync + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut k = kernel.lock().await;
                        let result = with_recovery(|| {
                            tick(&mut k);
                            Ok(())
                        }, name);
                        if let Err(e) = result {
                            tracing::error!("ticker_failed: name={}, error={}", name, e);
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::debug!("ticker_stopped: name={}", name);
                        break;
                    }
                }
            }
        });

        tracing::debug!("ticker_started: name={}, period={:?}", name, period);
        Self {
            name,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("ticker_join_failed: name={}, error={}", self.name, e);
            }
        }
    }
}

/// Owns the periodic tickers for one shared kernel.
#[derive(Debug)]
pub struct KernelRuntime {
    tickers: Vec<Ticker>,
}

impl KernelRuntime {
    /// Spawn the tickers enabled by the kernel's configuration.
    pub async fn start(kernel: Arc<Mutex<Kernel>>) -> Self {
        let config = kernel.lock().await.config().clone();
        let mut tickers = Vec::new();

        let mut add = |name: &'static str, period: Duration, enabled: bool, tick: fn(&mut Kernel)| {
            if !enabled {
                return;
            }
            if period.is_zero() {
                tracing::warn!("ticker_disabled: name={}, reason=zero period", name);
                return;
            }
            tickers.push(Ticker::spawn(name, period, kernel.clone(), tick));
        };

        add(
            "starvation_boost",
            config.scheduler.boost_interval,
            config.scheduler.starvation_prevention,
            |k| {
                k.boost_starved_tasks();
            },
        );
        add(
            "checkpoint",
            config.processes.checkpoint_interval,
            config.processes.auto_checkpoint,
            |k| {
                k.checkpoint_processes();
            },
        );
        add(
            "health_check",
            config.processes.health_check_interval,
            true,
            |k| {
                k.run_health_check();
            },
        );
        add(
            "recovery_poll",
            config.processes.recovery_poll_interval,
            config.processes.auto_recovery,
            |k| {
                k.run_due_recoveries();
            },
        );

        tracing::info!("kernel_runtime_started: tickers={}", tickers.len());
        Self { tickers }
    }

    pub fn ticker_names(&self) -> Vec<&'static str> {
        self.tickers.iter().map(Ticker::name).collect()
    }

    /// Stop every ticker and wait for each to exit.
    pub async fn shutdown(self) {
        let count = self.tickers.len();
        for ticker in self.tickers {
            ticker.stop().await;
        }
        tracing::info!("kernel_runtime_stopped: tickers={}", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::ProcessSpec;
    use crate::types::KernelConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_with_recovery_success() {
        assert_eq!(with_recovery(|| Ok(42), "op").unwrap(), 42);
    }

    #[test]
    fn test_with_recovery_preserves_error() {
        let result: Result<()> = with_recovery(|| Err(Error::validation("bad input")), "op");
        assert!(result.unwrap_err().to_string().contains("bad input"));
    }

    #[test]
    fn test_with_recovery_panic() {
        let result: Result<()> = with_recovery(|| panic!("tick exploded"), "boost");
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("Panic in boost"));
        assert!(msg.contains("tick exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_survives_panics() {
        let kernel = Arc::new(Mutex::new(Kernel::new(KernelConfig::default())));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let ticker = Ticker::spawn("flaky", Duration::from_millis(10), kernel, move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("first tick fails");
            }
        });
        // Paused clock: the sleep auto-advances through exactly eight periods.
        tokio::time::sleep(Duration::from_millis(85)).await;
        ticker.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_fires_checkpoints_and_stops() {
        let mut config = KernelConfig::default();
        config.processes.checkpoint_interval = Duration::from_millis(10);
        config.scheduler.starvation_prevention = false;

        let kernel = Arc::new(Mutex::new(Kernel::new(config)));
        let pid = {
            let mut k = kernel.lock().await;
            let pid = k.processes.create(ProcessSpec::new("worker")).unwrap();
            k.processes.start(&pid).unwrap();
            pid
        };

        let runtime = KernelRuntime::start(kernel.clone()).await;
        assert_eq!(
            runtime.ticker_names(),
            vec!["checkpoint", "health_check", "recovery_poll"]
        );
        tokio::time::sleep(Duration::from_millis(35)).await;
        runtime.shutdown().await;

        let k = kernel.lock().await;
        let taken = k.processes.context(&pid).unwrap().checkpoints().count();
        assert_eq!(taken, 3);
    }
}
