//! Process runner implementation
//!
//! Spawns the program in its own process group so that a timeout can kill
//! the whole tree, not just the direct child.

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandSpec, RunOutcome, RunStatus, Runner};

/// Runner that spawns real processes with a hard timeout
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a program, killing its process group on timeout
    pub async fn execute(
        &self,
        cmd: &CommandSpec,
        stdin_content: Option<&str>,
        timeout: Duration,
    ) -> Result<RunOutcome> {
        debug!(
            "Running {:?} (timeout {}s)",
            cmd.to_vec(),
            timeout.as_secs_f64()
        );

        let output_stdio = || {
            if cmd.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(if stdin_content.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(output_stdio())
            .stderr(output_stdio())
            .process_group(0)
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd.program))?;
        let pid = child.id();

        let stdin_pipe = child.stdin.take();
        let write_stdin = async move {
            if let (Some(mut pipe), Some(input)) = (stdin_pipe, stdin_content) {
                // A child that exits without reading closes the pipe early
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!("Failed to write stdin: {}", e);
                }
            }
        };
        let wait = async move {
            let (_, output) = tokio::join!(write_stdin, child.wait_with_output());
            output
        };

        tokio::pin!(wait);
        let output = match tokio::time::timeout(timeout, &mut wait).await {
            Ok(output) => output.context("Failed to wait for process")?,
            Err(_) => {
                // Child is still unreaped here, so its pid is still our group id
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                warn!(
                    "{} timed out after {}s, killed process group",
                    cmd.program,
                    timeout.as_secs_f64()
                );
                return Ok(RunOutcome {
                    status: RunStatus::TimedOut,
                    stdout: String::new(),
                    stderr: String::new(),
                    elapsed: start.elapsed(),
                });
            }
        };

        let status = match output.status.code() {
            Some(code) => RunStatus::Exited(code),
            None => RunStatus::Signaled(output.status.signal().unwrap_or(0)),
        };

        Ok(RunOutcome {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            elapsed: start.elapsed(),
        })
    }
}

fn kill_process_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!("Killed process group {}", pid),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<RunOutcome> {
        self.execute(cmd, stdin, timeout).await
    }
}
