//! Signals, messages and signal handler storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::types::{MessageId, ProcessId};

/// Signals understood by the process manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Graceful termination.
    #[serde(rename = "SIGTERM")]
    Term,
    /// Forced termination.
    #[serde(rename = "SIGKILL")]
    Kill,
    /// Suspend.
    #[serde(rename = "SIGSTOP")]
    Stop,
    /// Resume.
    #[serde(rename = "SIGCONT")]
    Cont,
    /// A child terminated.
    #[serde(rename = "SIGCHLD")]
    Chld,
    #[serde(rename = "SIGINT")]
    Int,
    #[serde(rename = "SIGUSR1")]
    Usr1,
    #[serde(rename = "SIGUSR2")]
    Usr2,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Stop => "SIGSTOP",
            Signal::Cont => "SIGCONT",
            Signal::Chld => "SIGCHLD",
            Signal::Int => "SIGINT",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Directed, typed payload queued in the recipient's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMessage {
    pub id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<ProcessId>,
    pub to: ProcessId,
    /// Caller-defined message type.
    pub kind: String,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// Caller-registered reaction to a signal. Runs before the built-in action.
pub type SignalHandler = Box<dyn FnMut(&ProcessId, Signal) + Send>;

/// Signal handlers per process.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: HashMap<ProcessId, HashMap<Signal, SignalHandler>>,
}

impl HandlerTable {
    pub fn register(&mut self, pid: &ProcessId, signal: Signal, handler: SignalHandler) {
        self.handlers
            .entry(pid.clone())
            .or_default()
            .insert(signal, handler);
    }

    pub fn unregister(&mut self, pid: &ProcessId, signal: Signal) -> bool {
        self.handlers
            .get_mut(pid)
            .is_some_and(|table| table.remove(&signal).is_some())
    }

    /// Invoke the handler for `signal`, if any. Returns true if one ran.
    pub fn invoke(&mut self, pid: &ProcessId, signal: Signal) -> bool {
        match self.handlers.get_mut(pid).and_then(|t| t.get_mut(&signal)) {
            Some(handler) => {
                handler(pid, signal);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self, pid: &ProcessId) {
        self.handlers.remove(pid);
    }

    pub fn count(&self, pid: &ProcessId) -> usize {
        self.handlers.get(pid).map_or(0, HashMap::len)
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(pid, table)| (pid.as_str(), table.len()))
            .collect();
        f.debug_struct("HandlerTable").field("handlers", &counts).finish()
    }
}
