//! Shared test helpers: stub executables, configs and a scriptable runner

use anyhow::Result;
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{ClusterSettings, Config};
use crate::runner::{CommandSpec, RunOutcome, RunStatus, Runner};

/// Write an executable `/bin/sh` script
pub fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Config rooted in `dir` with a stub sandbox binary that echoes its
/// arguments and exits 0
pub fn test_config(dir: &Path) -> Config {
    let sandbox_binary = write_stub(dir, "apptainer", r#"echo "$@""#);
    let image = dir.join("runtime.sif");
    std::fs::write(&image, b"sif").unwrap();

    Config {
        sandbox_binary,
        image,
        max_concurrent_jobs: 2,
        default_timeout_secs: 30,
        max_timeout_secs: 60,
        workspace_root: dir.join("workspaces"),
        cgroup_dir: dir.join("cgroups"),
        cluster: ClusterSettings {
            submit_command: dir.join("sbatch").display().to_string(),
            status_command: dir.join("squeue").display().to_string(),
            ..ClusterSettings::default()
        },
        ..Config::default()
    }
}

/// Create `<workspace_root>/user_<id>/<name>` with a trivial body
pub fn write_script(config: &Config, user_id: &str, name: &str) -> PathBuf {
    let dir = config.workspace_root.join(format!("user_{}", user_id));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, "print('hello')\n").unwrap();
    path
}

#[derive(Debug, Clone, Copy)]
pub enum FakeBehavior {
    Exit(i32),
    TimeOut,
    Signal(i32),
    Fail,
    Panic,
}

/// Runner that records calls and plays back a fixed behavior
pub struct FakeRunner {
    behavior: FakeBehavior,
    delay: Duration,
    calls: Mutex<Vec<(CommandSpec, Duration)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRunner {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<(CommandSpec, Duration)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        _stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<RunOutcome> {
        self.calls.lock().unwrap().push((cmd.clone(), timeout));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let status = match self.behavior {
            FakeBehavior::Exit(code) => RunStatus::Exited(code),
            FakeBehavior::TimeOut => RunStatus::TimedOut,
            FakeBehavior::Signal(signal) => RunStatus::Signaled(signal),
            FakeBehavior::Fail => anyhow::bail!("spawn failed: permission denied"),
            FakeBehavior::Panic => panic!("runner exploded"),
        };

        Ok(RunOutcome {
            status,
            stdout: "fake stdout".to_string(),
            stderr: String::new(),
            elapsed: self.delay,
        })
    }
}
