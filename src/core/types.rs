use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::LimitsApplication;

/// A request to run one script inside the sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Owning user, also selects the workspace and limits file
    pub user_id: String,
    /// Script to run; relative paths resolve against the user workspace
    pub script_path: PathBuf,
    /// Timeout override in seconds (None or 0 = configured default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Bind the user workspace read-write into the sandbox
    #[serde(default = "default_true")]
    pub bind_workspace: bool,
    /// Capture stdout/stderr (discarded otherwise)
    #[serde(default = "default_true")]
    pub capture_output: bool,
}

fn default_true() -> bool {
    true
}

impl ExecutionRequest {
    pub fn new(user_id: impl Into<String>, script_path: impl Into<PathBuf>) -> Self {
        Self {
            user_id: user_id.into(),
            script_path: script_path.into(),
            timeout_secs: None,
            bind_workspace: true,
            capture_output: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_bind_workspace(mut self, value: bool) -> Self {
        self.bind_workspace = value;
        self
    }

    pub fn with_capture_output(mut self, value: bool) -> Self {
        self.capture_output = value;
        self
    }

    /// Requested timeout, `None` when unset or zero
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Result of a sandboxed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit code of the sandbox process, -1 on timeout or spawn failure
    pub returncode: i32,
    /// Wall-clock seconds
    pub execution_time: f64,
    /// Effective timeout in seconds
    pub timeout: u64,
    pub success: bool,
    /// Whether the per-user resource limits were applied to this run
    pub resource_limits: LimitsApplication,
}

impl ExecutionResult {
    /// Failure result for runs that never produced an exit code
    pub fn failure(
        message: impl Into<String>,
        elapsed: Duration,
        timeout: Duration,
        resource_limits: LimitsApplication,
    ) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            returncode: -1,
            execution_time: elapsed.as_secs_f64(),
            timeout: timeout.as_secs(),
            success: false,
            resource_limits,
        }
    }
}

/// What `execute` produced: a finished run or an admission rejection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Finished(ExecutionResult),
    /// Concurrency ceiling reached; nothing was spawned or recorded
    Denied { reason: String },
}

impl ExecutionOutcome {
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            ExecutionOutcome::Finished(result) => Some(result),
            ExecutionOutcome::Denied { .. } => None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, ExecutionOutcome::Denied { .. })
    }
}

/// Per-user execution counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    /// Cumulative wall-clock seconds
    pub total_time: f64,
}

impl UserStats {
    pub fn record(&mut self, elapsed: Duration, success: bool) {
        self.total_jobs += 1;
        if success {
            self.successful_jobs += 1;
        } else {
            self.failed_jobs += 1;
        }
        self.total_time += elapsed.as_secs_f64();
    }
}
