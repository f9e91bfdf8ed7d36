//! Error types surfaced by the execution manager

use std::path::PathBuf;

/// Errors returned by the manager's public operations.
///
/// Execution failures of the sandboxed program itself (non-zero exit,
/// timeout, spawn failure) are not errors: they are reported through
/// `ExecutionResult`. Admission denial is reported through
/// `ExecutionOutcome::Denied`.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Invalid configuration values
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Sandbox binary or image unusable at startup
    #[error("sandbox verification failed: {0}")]
    Verification(String),

    #[error("invalid user id {0:?}")]
    InvalidUserId(String),

    #[error("invalid cluster job id {0:?}")]
    InvalidJobId(String),

    /// Per-user workspace could not be created
    #[error("failed to prepare workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Batch scheduler submission or query failed
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Shared counter / stats store failure
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
