//! Sandbox invocation
//!
//! Command-line construction for the external sandbox binary and the
//! per-user resource-limit files it consumes.

pub mod command;
pub mod limits;

pub use command::{BindMode, SandboxCommand};
pub use limits::{LimitsApplication, ResourceLimitBuilder, ResourceLimits};
