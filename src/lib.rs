//! Sandboxed script execution manager
//!
//! Runs untrusted user scripts inside an external container sandbox with
//! per-user resource limits, a global concurrency ceiling and per-user
//! stats, and hands long-running work off to a batch scheduler.

pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod gate;
pub mod hpc;
pub mod jobs;
pub mod manager;
pub mod queue;
pub mod runner;
pub mod sandbox;
pub mod stats;
pub mod store;

#[cfg(test)]
mod testing;

pub use crate::config::Config;
pub use crate::core::{ExecutionOutcome, ExecutionRequest, ExecutionResult, UserStats};
pub use crate::error::ExecError;
pub use crate::manager::Manager;
