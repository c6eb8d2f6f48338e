//! # AgentOS Kernel - In-Process Agent Operating System
//!
//! A logical kernel for multiplexing many agent tasks over shared, metered
//! resources:
//! - Task scheduling over a pluggable priority queue (priority, fair-share,
//!   deadline, cost-aware, round-robin)
//! - Resource quotas, cost budgets and shared pools
//! - Capability-based security with sandboxes, policies and an audit log
//! - Process lifecycle with checkpoints, auto-recovery, signals and messages
//!
//! ## Architecture
//!
//! A single `Kernel` owns every subsystem as a plain struct:
//! ```text
//!                    ┌─────────────────────────────────┐
//!   method calls →   │             Kernel              │
//!                    │  ┌─────────┐ ┌──────────┐       │
//!                    │  │Scheduler│ │Resources │       │
//!                    │  └─────────┘ └──────────┘       │
//!                    │  ┌─────────┐ ┌──────────┐       │
//!                    │  │Security │ │Processes │       │
//!                    │  └─────────┘ └──────────┘       │
//!                    └─────────────────────────────────┘
//!                         ↑ KernelRuntime tickers
//! ```
//!
//! Each subsystem publishes its own events on an [`events::EventBus`].

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod events;
pub mod kernel;
pub mod types;

pub mod observability;

pub use kernel::{Kernel, KernelRuntime};
pub use types::{Error, KernelConfig, Result};
