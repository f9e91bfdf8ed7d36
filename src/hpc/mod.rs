//! Batch scheduler hand-off
//!
//! Submits rendered batch scripts to a SLURM-style scheduler and polls job
//! state. Nothing is cached locally: every status call asks the scheduler.

pub mod script;

pub use script::{render_batch_script, ClusterJobSpec};

use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::utils::{validate_job_id, validate_user_id};
use crate::error::ExecError;
use crate::runner::{CommandSpec, RunOutcome, RunStatus, Runner};

/// Status query output format: state, elapsed time, node list
const STATUS_FORMAT: &str = "%T|%M|%N";

/// stderr fragments that mean the scheduler could not be asked, as opposed
/// to the job being gone
const TRANSIENT_PATTERNS: [&str; 5] = [
    "unable to contact",
    "unreachable",
    "connection refused",
    "timed out",
    "try again",
];

/// Job state as reported by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterJobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// No longer queryable (finished and purged, or never existed)
    NotFound,
    Unknown(String),
}

impl ClusterJobState {
    /// Map a raw scheduler state such as `RUNNING` or `CANCELLED by 1000`
    pub fn parse(raw: &str) -> Self {
        let state = raw.split_whitespace().next().unwrap_or("");
        match state.trim_end_matches('+') {
            "PENDING" | "CONFIGURING" | "REQUEUED" => Self::Pending,
            "RUNNING" | "COMPLETING" => Self::Running,
            "COMPLETED" => Self::Completed,
            "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE" => {
                Self::Failed
            }
            "CANCELLED" => Self::Cancelled,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for ClusterJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Unknown(raw) => write!(f, "UNKNOWN({})", raw),
        }
    }
}

impl Serialize for ClusterJobState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Snapshot of a cluster job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterJobStatus {
    pub job_id: String,
    pub state: ClusterJobState,
    /// Elapsed run time as printed by the scheduler
    pub runtime: Option<String>,
    pub node: Option<String>,
}

impl ClusterJobStatus {
    fn not_found(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: ClusterJobState::NotFound,
            runtime: None,
            node: None,
        }
    }

    pub fn found(&self) -> bool {
        self.state != ClusterJobState::NotFound
    }
}

pub struct HpcSubmitter {
    config: Arc<Config>,
    runner: Arc<dyn Runner>,
}

impl HpcSubmitter {
    pub fn new(config: Arc<Config>, runner: Arc<dyn Runner>) -> Self {
        Self { config, runner }
    }

    /// Submit a script for `user_id`, returning the scheduler's job id
    pub async fn submit(
        &self,
        user_id: &str,
        script_path: &str,
        spec: &ClusterJobSpec,
    ) -> Result<String, ExecError> {
        validate_user_id(user_id)?;
        spec.validate()?;

        let batch_script = render_batch_script(&self.config, user_id, script_path, spec);
        debug!("Batch script for {}:\n{}", user_id, batch_script);

        let cmd = CommandSpec::new(self.config.cluster.submit_command.clone());
        let timeout = self.config.cluster.submit_timeout();
        let outcome = self
            .runner
            .run(&cmd, Some(&batch_script), timeout)
            .await
            .map_err(|e| ExecError::Scheduler(format!("submission failed: {:#}", e)))?;

        let outcome = expect_exit(outcome, "submission", timeout.as_secs())?;
        let job_id = parse_submission(&outcome.stdout)?;
        info!(
            "Submitted cluster job {} for {} (partition {})",
            job_id, user_id, spec.partition
        );
        Ok(job_id)
    }

    /// Query the scheduler for a job's current state
    pub async fn status(&self, job_id: &str) -> Result<ClusterJobStatus, ExecError> {
        validate_job_id(job_id)?;

        let cmd = CommandSpec::new(self.config.cluster.status_command.clone())
            .arg("-j")
            .arg(job_id)
            .arg("-h")
            .arg("-o")
            .arg(STATUS_FORMAT);
        let timeout = self.config.cluster.status_timeout();
        let outcome = self
            .runner
            .run(&cmd, None, timeout)
            .await
            .map_err(|e| ExecError::Scheduler(format!("status query failed: {:#}", e)))?;

        if outcome.status == RunStatus::TimedOut {
            return Err(ExecError::Scheduler(format!(
                "status query timed out after {} seconds",
                timeout.as_secs()
            )));
        }
        if !outcome.status.is_success() {
            if is_transient(&outcome.stderr) {
                warn!(
                    "Status query for job {} failed transiently: {}",
                    job_id,
                    outcome.stderr.trim()
                );
                return Err(ExecError::Scheduler(format!(
                    "status query failed: {}",
                    outcome.stderr.trim()
                )));
            }
            debug!(
                "Status query for job {} exited with {}; treating as not found",
                job_id,
                outcome.status.exit_code()
            );
            return Ok(ClusterJobStatus::not_found(job_id));
        }

        Ok(parse_status(job_id, &outcome.stdout))
    }
}

fn expect_exit(outcome: RunOutcome, what: &str, timeout_secs: u64) -> Result<RunOutcome, ExecError> {
    match outcome.status {
        RunStatus::Exited(0) => return Ok(outcome),
        RunStatus::TimedOut => {
            return Err(ExecError::Scheduler(format!(
                "{} timed out after {} seconds",
                what, timeout_secs
            )))
        }
        _ => {}
    }
    Err(ExecError::Scheduler(format!(
        "{} exited with code {}: {}",
        what,
        outcome.status.exit_code(),
        outcome.stderr.trim()
    )))
}

/// Job id is the last token of `Submitted batch job <id>`
fn parse_submission(stdout: &str) -> Result<String, ExecError> {
    let job_id = stdout
        .lines()
        .rev()
        .find_map(|line| line.split_whitespace().last())
        .ok_or_else(|| ExecError::Scheduler("empty submission acknowledgement".into()))?;
    validate_job_id(job_id)
        .map_err(|_| ExecError::Scheduler(format!("unexpected acknowledgement: {}", stdout.trim())))?;
    Ok(job_id.to_string())
}

fn parse_status(job_id: &str, stdout: &str) -> ClusterJobStatus {
    let Some(line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return ClusterJobStatus::not_found(job_id);
    };

    let mut fields = line.split('|').map(str::trim);
    let state = ClusterJobState::parse(fields.next().unwrap_or(""));
    let non_empty = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(str::to_string);

    ClusterJobStatus {
        job_id: job_id.to_string(),
        state,
        runtime: non_empty(fields.next()),
        node: non_empty(fields.next()),
    }
}

fn is_transient(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| stderr.contains(p))
}
