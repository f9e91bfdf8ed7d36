//! Sandboxed script execution
//!
//! Admission, workspace preparation, command construction, the timed run
//! itself and stats bookkeeping. One call spawns at most one sandbox
//! process; the concurrency slot taken for it is released on every path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::utils::validate_user_id;
use crate::core::{ExecutionOutcome, ExecutionRequest, ExecutionResult};
use crate::error::ExecError;
use crate::gate::{Admission, ConcurrencyGate};
use crate::runner::{CommandSpec, RunOutcome, RunStatus, Runner};
use crate::sandbox::{BindMode, LimitsApplication, ResourceLimitBuilder, SandboxCommand};
use crate::stats::StatsTracker;

/// Mount point of the script when the workspace is not bound
const SCRIPT_MOUNT_DIR: &str = "/opt/job";

pub struct Executor {
    config: Arc<Config>,
    gate: ConcurrencyGate,
    limits: ResourceLimitBuilder,
    stats: StatsTracker,
    runner: Arc<dyn Runner>,
}

/// Where the script is found inside the sandbox
#[derive(Debug, PartialEq)]
struct ScriptMount {
    sandbox_path: String,
    /// Extra read-only bind needed to expose the script
    bind: Option<PathBuf>,
}

impl Executor {
    pub fn new(
        config: Arc<Config>,
        gate: ConcurrencyGate,
        limits: ResourceLimitBuilder,
        stats: StatsTracker,
        runner: Arc<dyn Runner>,
    ) -> Self {
        Self {
            config,
            gate,
            limits,
            stats,
            runner,
        }
    }

    /// Host workspace directory of a user
    pub fn workspace_for(&self, user_id: &str) -> PathBuf {
        self.config
            .workspace_root
            .join(format!("user_{}", user_id))
    }

    async fn prepare_workspace(&self, user_id: &str) -> Result<PathBuf, ExecError> {
        let path = self.workspace_for(user_id);
        let workspace_err = |source| ExecError::Workspace {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&path).await.map_err(workspace_err)?;
        fs::canonicalize(&path).await.map_err(workspace_err)
    }

    /// Canonical script path if it is a regular file inside the workspace.
    ///
    /// `..` components and symlinks are resolved before the containment
    /// check, so neither can reach another user's workspace or the host.
    async fn locate_script(workspace: &Path, script: &Path) -> Option<PathBuf> {
        let candidate = if script.is_absolute() {
            script.to_path_buf()
        } else {
            workspace.join(script)
        };
        let canonical = fs::canonicalize(&candidate).await.ok()?;
        if !canonical.starts_with(workspace) {
            warn!(
                "Script {:?} resolves outside workspace {:?}",
                script, workspace
            );
            return None;
        }
        match fs::metadata(&canonical).await {
            Ok(meta) if meta.is_file() => Some(canonical),
            _ => None,
        }
    }

    /// `script` must already be inside `workspace`
    fn mount_script(&self, workspace: &Path, script: &Path, bind_workspace: bool) -> ScriptMount {
        let relative = script.strip_prefix(workspace).unwrap_or(script);
        if bind_workspace {
            return ScriptMount {
                sandbox_path: format!(
                    "{}/{}",
                    self.config.sandbox_workdir.trim_end_matches('/'),
                    relative.display()
                ),
                bind: None,
            };
        }

        // Workspace not mounted: expose only the script file
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "script".to_string());
        ScriptMount {
            sandbox_path: format!("{}/{}", SCRIPT_MOUNT_DIR, name),
            bind: Some(script.to_path_buf()),
        }
    }

    fn build_command(
        &self,
        request: &ExecutionRequest,
        workspace: &Path,
        script: &Path,
        limits: &LimitsApplication,
    ) -> CommandSpec {
        let mount = self.mount_script(workspace, script, request.bind_workspace);

        let mut sandbox = SandboxCommand::new(&self.config.sandbox_binary, &self.config.image);
        if request.bind_workspace {
            sandbox = sandbox
                .bind(workspace, &self.config.sandbox_workdir, BindMode::ReadWrite)
                .workdir(self.config.sandbox_workdir.clone());
        }
        if let Some(host) = &mount.bind {
            sandbox = sandbox.bind(host, &mount.sandbox_path, BindMode::ReadOnly);
        }

        let command = self
            .config
            .interpreter_for(script)
            .iter()
            .cloned()
            .chain(std::iter::once(mount.sandbox_path));

        sandbox
            .limits_file(limits.path())
            .command(command)
            .into_spec()
            .with_capture_output(request.capture_output)
    }

    /// Run one request end to end
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecError> {
        validate_user_id(&request.user_id)?;
        let user_id = request.user_id.as_str();
        let timeout = self.config.effective_timeout(request.timeout());

        if let Admission::Denied { reason } = self.gate.admit().await? {
            info!("Rejected execution for {}: {}", user_id, reason);
            return Ok(ExecutionOutcome::Denied { reason });
        }

        let workspace = self.prepare_workspace(user_id).await?;

        let Some(script) = Self::locate_script(&workspace, &request.script_path).await else {
            info!(
                "Script {:?} not found for user {}",
                request.script_path, user_id
            );
            return Ok(ExecutionOutcome::Finished(ExecutionResult::failure(
                format!("Script not found: {}", request.script_path.display()),
                Duration::ZERO,
                timeout,
                LimitsApplication::Skipped {
                    reason: "execution not started".to_string(),
                },
            )));
        };

        let limits = self.limits.apply(user_id).await;
        let cmd = self.build_command(request, &workspace, &script, &limits);

        let slot = match self.gate.try_acquire().await? {
            Ok(slot) => slot,
            Err(admission) => {
                let reason = admission.reason().unwrap_or_default().to_string();
                info!("Rejected execution for {}: {}", user_id, reason);
                return Ok(ExecutionOutcome::Denied { reason });
            }
        };

        info!(
            "Executing {:?} for {} (timeout {}s)",
            script,
            user_id,
            timeout.as_secs()
        );
        let start = Instant::now();
        let run = self.runner.run(&cmd, None, timeout).await;
        slot.release().await;
        let elapsed = start.elapsed();

        let result = Self::interpret(run, elapsed, timeout, limits);
        debug!(
            "Execution for {} finished: returncode={} success={} elapsed={:.3}s",
            user_id, result.returncode, result.success, result.execution_time
        );

        if let Err(e) = self.stats.update(user_id, elapsed, result.success).await {
            warn!("Failed to record stats for {}: {:#}", user_id, e);
        }

        Ok(ExecutionOutcome::Finished(result))
    }

    fn interpret(
        run: anyhow::Result<RunOutcome>,
        elapsed: Duration,
        timeout: Duration,
        limits: LimitsApplication,
    ) -> ExecutionResult {
        let outcome = match run {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Sandbox execution failed: {:#}", e);
                return ExecutionResult::failure(
                    format!("Execution failed: {:#}", e),
                    elapsed,
                    timeout,
                    limits,
                );
            }
        };

        match outcome.status {
            RunStatus::TimedOut => ExecutionResult::failure(
                format!("Execution timed out after {} seconds", timeout.as_secs()),
                elapsed,
                timeout,
                limits,
            ),
            RunStatus::Exited(code) => ExecutionResult {
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                returncode: code,
                execution_time: elapsed.as_secs_f64(),
                timeout: timeout.as_secs(),
                success: code == 0,
                resource_limits: limits,
            },
            RunStatus::Signaled(signal) => {
                let mut stderr = outcome.stderr;
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("Killed by signal {}", signal));
                ExecutionResult {
                    stdout: outcome.stdout,
                    stderr,
                    returncode: -1,
                    execution_time: elapsed.as_secs_f64(),
                    timeout: timeout.as_secs(),
                    success: false,
                    resource_limits: limits,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{test_config, write_script, FakeBehavior, FakeRunner};

    struct Harness {
        executor: Arc<Executor>,
        runner: Arc<FakeRunner>,
        gate: ConcurrencyGate,
        stats: StatsTracker,
        config: Arc<Config>,
        _dir: tempfile::TempDir,
    }

    fn harness(runner: FakeRunner, tweak: impl FnOnce(&mut Config)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let config = Arc::new(config);

        let store = Arc::new(MemoryStore::new());
        let gate = ConcurrencyGate::new(store.clone(), config.max_concurrent_jobs);
        let stats = StatsTracker::new(store);
        let limits = ResourceLimitBuilder::new(&config.cgroup_dir, config.limits.clone());
        let runner = Arc::new(runner);

        let executor = Arc::new(Executor::new(
            config.clone(),
            gate.clone(),
            limits,
            stats.clone(),
            runner.clone(),
        ));

        Harness {
            executor,
            runner,
            gate,
            stats,
            config,
            _dir: dir,
        }
    }

    fn finished(outcome: ExecutionOutcome) -> ExecutionResult {
        match outcome {
            ExecutionOutcome::Finished(result) => result,
            ExecutionOutcome::Denied { reason } => panic!("unexpected denial: {}", reason),
        }
    }

    #[tokio::test]
    async fn test_builds_isolated_command() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |_| {});
        write_script(&h.config, "alice", "main.py");

        let result = finished(
            h.executor
                .run(&ExecutionRequest::new("alice", "main.py"))
                .await
                .unwrap(),
        );
        assert!(result.success);
        assert_eq!(result.stdout, "fake stdout");

        let calls = h.runner.calls();
        assert_eq!(calls.len(), 1);
        let args = &calls[0].0.args;
        assert_eq!(args[0], "exec");
        for flag in ["--contain", "--cleanenv", "--no-home", "--apply-cgroups"] {
            assert!(args.contains(&flag.to_string()), "missing {}", flag);
        }
        let bind = args.iter().find(|a| a.ends_with(":/workspace:rw")).unwrap();
        assert!(bind.contains("user_alice"));
        assert_eq!(&args[args.len() - 2..], ["python3", "/workspace/main.py"]);
        assert!(matches!(result.resource_limits, LimitsApplication::Applied { .. }));
    }

    #[tokio::test]
    async fn test_timeout_clamping_reaches_runner() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |_| {});
        write_script(&h.config, "alice", "main.py");

        let huge = ExecutionRequest::new("alice", "main.py")
            .with_timeout(h.config.max_timeout() * 10);
        h.executor.run(&huge).await.unwrap();
        let unset = ExecutionRequest::new("alice", "main.py");
        h.executor.run(&unset).await.unwrap();
        let zero = ExecutionRequest::new("alice", "main.py").with_timeout(Duration::ZERO);
        h.executor.run(&zero).await.unwrap();

        let timeouts: Vec<Duration> = h.runner.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(
            timeouts,
            vec![
                h.config.max_timeout(),
                h.config.default_timeout(),
                h.config.default_timeout()
            ]
        );
    }

    #[tokio::test]
    async fn test_unbound_workspace_exposes_only_the_script() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |_| {});
        let script = write_script(&h.config, "alice", "job.sh");

        let request = ExecutionRequest::new("alice", "job.sh")
            .with_bind_workspace(false)
            .with_capture_output(false);
        finished(h.executor.run(&request).await.unwrap());

        let (cmd, _) = h.runner.calls().remove(0);
        assert!(!cmd.capture_output);
        assert!(!cmd.args.iter().any(|a| a.ends_with(":/workspace:rw")));
        assert!(!cmd.args.contains(&"--pwd".to_string()));

        let binds: Vec<&String> = cmd.args.iter().filter(|a| a.ends_with(":ro")).collect();
        assert_eq!(binds.len(), 1);
        let canonical = std::fs::canonicalize(&script).unwrap();
        assert_eq!(
            binds[0],
            &format!("{}:/opt/job/job.sh:ro", canonical.display())
        );
        assert_eq!(&cmd.args[cmd.args.len() - 2..], ["bash", "/opt/job/job.sh"]);
    }

    async fn assert_rejected(h: &Harness, request: ExecutionRequest) {
        let result = finished(h.executor.run(&request).await.unwrap());
        assert!(!result.success);
        assert_eq!(result.returncode, -1);
        assert!(result.stderr.contains("Script not found"));
        assert!(h.runner.calls().is_empty());
        assert_eq!(h.gate.active_jobs().await.unwrap(), 0);
        assert_eq!(h.stats.get("alice").await.unwrap().total_jobs, 0);
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal_into_other_workspace() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |_| {});
        write_script(&h.config, "alice", "main.py");
        write_script(&h.config, "bob", "secret.py");

        assert_rejected(&h, ExecutionRequest::new("alice", "../user_bob/secret.py")).await;
        let unbound =
            ExecutionRequest::new("alice", "../user_bob/secret.py").with_bind_workspace(false);
        assert_rejected(&h, unbound).await;
    }

    #[tokio::test]
    async fn test_rejects_absolute_path_outside_workspace() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |_| {});
        write_script(&h.config, "alice", "main.py");
        let foreign = write_script(&h.config, "bob", "secret.py");

        assert_rejected(&h, ExecutionRequest::new("alice", &foreign)).await;

        let host_file = h.config.workspace_root.parent().unwrap().join("host.py");
        std::fs::write(&host_file, "print('host')\n").unwrap();
        let unbound = ExecutionRequest::new("alice", &host_file).with_bind_workspace(false);
        assert_rejected(&h, unbound).await;
    }

    #[tokio::test]
    async fn test_rejects_symlink_leaving_workspace() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |_| {});
        let own = write_script(&h.config, "alice", "main.py");
        let foreign = write_script(&h.config, "bob", "secret.py");
        std::os::unix::fs::symlink(&foreign, own.with_file_name("link.py")).unwrap();

        assert_rejected(&h, ExecutionRequest::new("alice", "link.py")).await;
    }

    #[tokio::test]
    async fn test_symlink_within_workspace_is_allowed() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |_| {});
        let own = write_script(&h.config, "alice", "main.py");
        std::os::unix::fs::symlink(&own, own.with_file_name("alias.py")).unwrap();

        let result = finished(
            h.executor
                .run(&ExecutionRequest::new("alice", "alias.py"))
                .await
                .unwrap(),
        );
        assert!(result.success);
        let (cmd, _) = h.runner.calls().remove(0);
        assert_eq!(cmd.args.last().unwrap(), "/workspace/main.py");
    }

    #[tokio::test]
    async fn test_missing_script_spawns_nothing() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |_| {});

        let result = finished(
            h.executor
                .run(&ExecutionRequest::new("alice", "missing.py"))
                .await
                .unwrap(),
        );
        assert!(!result.success);
        assert_eq!(result.returncode, -1);
        assert!(result.stderr.contains("Script not found"));
        assert!(h.runner.calls().is_empty());
        assert_eq!(h.gate.active_jobs().await.unwrap(), 0);
        assert_eq!(h.stats.get("alice").await.unwrap().total_jobs, 0);
    }

    #[tokio::test]
    async fn test_runner_error_becomes_failure_result() {
        let h = harness(FakeRunner::new(FakeBehavior::Fail), |_| {});
        write_script(&h.config, "alice", "main.py");

        let result = finished(
            h.executor
                .run(&ExecutionRequest::new("alice", "main.py"))
                .await
                .unwrap(),
        );
        assert!(!result.success);
        assert_eq!(result.returncode, -1);
        assert!(result.stderr.contains("permission denied"));
        assert_eq!(h.gate.active_jobs().await.unwrap(), 0);

        let stats = h.stats.get("alice").await.unwrap();
        assert_eq!(stats.failed_jobs, 1);
        assert_eq!(stats.total_jobs, 1);
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure_result() {
        let h = harness(FakeRunner::new(FakeBehavior::TimeOut), |_| {});
        write_script(&h.config, "alice", "main.py");

        let request = ExecutionRequest::new("alice", "main.py").with_timeout(Duration::from_secs(7));
        let result = finished(h.executor.run(&request).await.unwrap());

        assert!(!result.success);
        assert_eq!(result.returncode, -1);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.contains("timed out after 7 seconds"));
        assert_eq!(result.timeout, 7);
        assert_eq!(h.stats.get("alice").await.unwrap().failed_jobs, 1);
        assert_eq!(h.gate.active_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_signal_keeps_output_and_fails() {
        let h = harness(FakeRunner::new(FakeBehavior::Signal(9)), |_| {});
        write_script(&h.config, "alice", "main.py");

        let result = finished(
            h.executor
                .run(&ExecutionRequest::new("alice", "main.py"))
                .await
                .unwrap(),
        );

        assert!(!result.success);
        assert_eq!(result.returncode, -1);
        assert_eq!(result.stdout, "fake stdout");
        assert_eq!(result.stderr, "Killed by signal 9");
        assert!(matches!(result.resource_limits, LimitsApplication::Applied { .. }));

        let stats = h.stats.get("alice").await.unwrap();
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.failed_jobs, 1);
        assert_eq!(h.gate.active_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(2)), |_| {});
        write_script(&h.config, "alice", "main.py");

        let result = finished(
            h.executor
                .run(&ExecutionRequest::new("alice", "main.py"))
                .await
                .unwrap(),
        );
        assert_eq!(result.returncode, 2);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_panicking_runner_releases_slot() {
        let h = harness(FakeRunner::new(FakeBehavior::Panic), |_| {});
        write_script(&h.config, "alice", "main.py");

        let executor = h.executor.clone();
        let joined = tokio::spawn(async move {
            executor
                .run(&ExecutionRequest::new("alice", "main.py"))
                .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.gate.active_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_slot() {
        let h = harness(
            FakeRunner::new(FakeBehavior::Exit(0)).with_delay(Duration::from_secs(5)),
            |_| {},
        );
        write_script(&h.config, "alice", "main.py");

        let request = ExecutionRequest::new("alice", "main.py");
        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), h.executor.run(&request)).await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.gate.active_jobs().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admission_invariant_under_load() {
        let h = harness(
            FakeRunner::new(FakeBehavior::Exit(0)).with_delay(Duration::from_millis(100)),
            |c| c.max_concurrent_jobs = 2,
        );
        for i in 0..12 {
            write_script(&h.config, &format!("u{}", i), "main.py");
        }

        let mut handles = Vec::new();
        for i in 0..12 {
            let executor = h.executor.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .run(&ExecutionRequest::new(format!("u{}", i), "main.py"))
                    .await
                    .unwrap()
            }));
        }

        let mut finished_count = 0;
        let mut denied_count = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ExecutionOutcome::Finished(result) => {
                    assert!(result.success);
                    finished_count += 1;
                }
                ExecutionOutcome::Denied { reason } => {
                    assert_eq!(reason, "Maximum concurrent jobs reached (2)");
                    denied_count += 1;
                }
            }
        }

        assert!(h.runner.max_in_flight() <= 2);
        assert!(finished_count >= 2);
        assert_eq!(finished_count + denied_count, 12);
        assert_eq!(h.gate.active_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_denied_when_ceiling_reached() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |c| {
            c.max_concurrent_jobs = 1
        });
        write_script(&h.config, "alice", "main.py");
        h.gate.increment().await.unwrap();

        let outcome = h
            .executor
            .run(&ExecutionRequest::new("alice", "main.py"))
            .await
            .unwrap();
        assert!(outcome.is_denied());
        assert!(h.runner.calls().is_empty());
        assert_eq!(h.stats.get("alice").await.unwrap().total_jobs, 0);
    }

    #[tokio::test]
    async fn test_runs_unconfined_when_limits_unavailable() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |c| {
            let blocker = c.workspace_root.parent().unwrap().join("blocker");
            std::fs::write(&blocker, "file").unwrap();
            c.cgroup_dir = blocker.join("cgroups");
        });
        write_script(&h.config, "alice", "main.py");

        let result = finished(
            h.executor
                .run(&ExecutionRequest::new("alice", "main.py"))
                .await
                .unwrap(),
        );
        assert!(result.success);
        assert!(matches!(result.resource_limits, LimitsApplication::Skipped { .. }));
        let (cmd, _) = h.runner.calls().remove(0);
        assert!(!cmd.args.contains(&"--apply-cgroups".to_string()));
    }

    #[tokio::test]
    async fn test_rejects_invalid_user_id() {
        let h = harness(FakeRunner::new(FakeBehavior::Exit(0)), |_| {});
        let err = h
            .executor
            .run(&ExecutionRequest::new("../root", "main.py"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidUserId(_)));
    }
}
