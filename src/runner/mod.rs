//! Runner module - External process abstraction
//!
//! Everything this crate launches (the sandbox binary, the batch scheduler
//! commands) goes through a `Runner`. `ProcessRunner` spawns real processes
//! with a hard timeout; tests substitute fakes.

pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use process::ProcessRunner;

/// Command specification for execution
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Capture stdout/stderr; discarded when false
    pub capture_output: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capture_output: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(|a| a.into()));
        self
    }

    pub fn with_capture_output(mut self, value: bool) -> Self {
        self.capture_output = value;
        self
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.clone());
        v
    }
}

/// Execution status (raw, no interpretation)
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by signal
    Signaled(i32),
    /// Timeout reached; the process group was killed
    TimedOut,
}

impl RunStatus {
    /// Check if execution was successful (exited with code 0)
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }

    /// Exit code, -1 when the process did not exit on its own
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Exited(code) => *code,
            RunStatus::Signaled(_) | RunStatus::TimedOut => -1,
        }
    }
}

/// Outcome of running a program
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Stdout content (empty on timeout or when not captured)
    pub stdout: String,
    /// Stderr content (empty on timeout or when not captured)
    pub stderr: String,
    /// Wall-clock time from spawn to exit or kill
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Runner trait for executing programs
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command with the given timeout and optional stdin.
    ///
    /// Returns `Err` only when the process could not be started or
    /// waited on; timeouts are reported as `RunStatus::TimedOut`.
    async fn run(
        &self,
        cmd: &CommandSpec,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<RunOutcome>;
}
