//! wayafk-supervisor - Supervisor for the wayafknext idle monitor.
//!
//! Downloads and verifies the monitor binary, runs it as a child process,
//! talks to it over a local socket, and reports idle changes as typed events.

pub mod cache;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod idle;
pub mod process;
pub mod protocol;
pub mod signals;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use crate::config::Config;
pub use crate::dispatch::EventSink;
pub use crate::domain::SupervisorState;
pub use crate::domain::WatchConfig;
pub use crate::idle::IdleTracker;
pub use crate::protocol::Event;
pub use crate::protocol::IdleUpdate;
pub use crate::supervisor::Supervisor;
pub use crate::supervisor::SupervisorError;
pub use crate::supervisor::SupervisorSettings;
