//! Execution manager configuration
//!
//! Loaded from environment variables (with defaults) or from a TOML file,
//! then verified against the host: the sandbox binary must answer
//! `--version` and the container image must exist. Verification failure is a
//! startup abort.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ExecError;
use crate::sandbox::ResourceLimits;

/// Ceiling on the `--version` check of the sandbox binary
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable naming an optional TOML config file
pub const CONFIG_FILE_ENV: &str = "EXEC_MANAGER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sandbox binary (Apptainer-compatible CLI)
    pub sandbox_binary: PathBuf,
    /// Container image passed to the sandbox binary
    pub image: PathBuf,
    /// Global ceiling on simultaneously running sandboxed jobs
    pub max_concurrent_jobs: u64,
    /// Timeout used when a request does not set one (seconds)
    pub default_timeout_secs: u64,
    /// Upper bound for requested timeouts (seconds)
    pub max_timeout_secs: u64,
    /// Host directory holding one workspace per user
    pub workspace_root: PathBuf,
    /// Host directory holding one resource-limit file per user
    pub cgroup_dir: PathBuf,
    /// Mount point of the user workspace inside the sandbox
    pub sandbox_workdir: String,
    /// Interpreter used when the script extension is not in `interpreters`
    pub default_interpreter: Vec<String>,
    /// Interpreter per script extension (lowercase, without dot)
    pub interpreters: HashMap<String, Vec<String>>,
    pub limits: ResourceLimits,
    pub cluster: ClusterSettings,
    pub redis_url: String,
}

/// Batch scheduler settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Submission command, reads the batch script from stdin
    pub submit_command: String,
    /// Status query command
    pub status_command: String,
    /// Cluster-side directory holding one workspace per user
    pub workspace_root: String,
    /// Cluster-side directory for job stdout/stderr logs
    pub log_dir: String,
    pub submit_timeout_secs: u64,
    pub status_timeout_secs: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            submit_command: "sbatch".to_string(),
            status_command: "squeue".to_string(),
            workspace_root: "/scratch/exec-manager/workspaces".to_string(),
            log_dir: "/scratch/exec-manager/logs".to_string(),
            submit_timeout_secs: 30,
            status_timeout_secs: 10,
        }
    }
}

impl ClusterSettings {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        let interpreters = [
            ("py", vec!["python3"]),
            ("sh", vec!["bash"]),
            ("r", vec!["Rscript"]),
            ("jl", vec!["julia"]),
        ]
        .into_iter()
        .map(|(ext, cmd)| {
            (
                ext.to_string(),
                cmd.into_iter().map(String::from).collect(),
            )
        })
        .collect();

        Self {
            sandbox_binary: PathBuf::from("apptainer"),
            image: PathBuf::from("/opt/exec-manager/images/runtime.sif"),
            max_concurrent_jobs: 10,
            default_timeout_secs: 300,
            max_timeout_secs: 3600,
            workspace_root: PathBuf::from("/var/lib/exec-manager/workspaces"),
            cgroup_dir: PathBuf::from("/var/lib/exec-manager/cgroups"),
            sandbox_workdir: "/workspace".to_string(),
            default_interpreter: vec!["python3".to_string()],
            interpreters,
            limits: ResourceLimits::default(),
            cluster: ClusterSettings::default(),
            redis_url: "redis://localhost:6379".to_string(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// If `EXEC_MANAGER_CONFIG` is set, the TOML file it names is the base;
    /// otherwise defaults are used. Individual environment variables
    /// override either.
    pub fn from_env() -> Result<Self, ExecError> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::load(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(value) = std::env::var("EXEC_SANDBOX_BINARY") {
            config.sandbox_binary = value.into();
        }
        if let Ok(value) = std::env::var("EXEC_IMAGE") {
            config.image = value.into();
        }
        if let Some(value) = env_u64("EXEC_MAX_CONCURRENT_JOBS")? {
            config.max_concurrent_jobs = value;
        }
        if let Some(value) = env_u64("EXEC_DEFAULT_TIMEOUT")? {
            config.default_timeout_secs = value;
        }
        if let Some(value) = env_u64("EXEC_MAX_TIMEOUT")? {
            config.max_timeout_secs = value;
        }
        if let Ok(value) = std::env::var("EXEC_WORKSPACE_ROOT") {
            config.workspace_root = value.into();
        }
        if let Ok(value) = std::env::var("EXEC_CGROUP_DIR") {
            config.cgroup_dir = value.into();
        }
        if let Ok(value) = std::env::var("REDIS_URL") {
            config.redis_url = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file; missing keys take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ExecError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExecError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            ExecError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value consistency (no host access)
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ExecError::Config(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(ExecError::Config(
                "default_timeout_secs must be positive".into(),
            ));
        }
        if self.default_timeout_secs > self.max_timeout_secs {
            return Err(ExecError::Config(format!(
                "default_timeout_secs ({}) exceeds max_timeout_secs ({})",
                self.default_timeout_secs, self.max_timeout_secs
            )));
        }
        if self.default_interpreter.is_empty() {
            return Err(ExecError::Config(
                "default_interpreter must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    /// Clamp a requested timeout: unset falls back to the default, anything
    /// above the maximum becomes the maximum
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout.min(self.max_timeout()),
            _ => self.default_timeout(),
        }
    }

    /// Interpreter command for a script, chosen by file extension
    pub fn interpreter_for(&self, script: &Path) -> &[String] {
        script
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.interpreters.get(&ext.to_ascii_lowercase()))
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or(&self.default_interpreter)
    }

    /// Verify the sandbox binary and the image. Run once at startup.
    pub async fn verify(&self) -> Result<(), ExecError> {
        self.validate()?;
        let version = self.verify_sandbox_binary().await?;
        info!(
            "Sandbox binary {} ok ({})",
            self.sandbox_binary.display(),
            version
        );
        self.verify_image().await?;
        info!("Sandbox image {} ok", self.image.display());
        Ok(())
    }

    async fn verify_sandbox_binary(&self) -> Result<String, ExecError> {
        let binary = self.sandbox_binary.display();
        debug!("Probing sandbox binary {} --version", binary);

        let child = Command::new(&self.sandbox_binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ExecError::Verification(format!("sandbox binary {} not found", binary))
                }
                std::io::ErrorKind::PermissionDenied => ExecError::Verification(format!(
                    "sandbox binary {} is not executable",
                    binary
                )),
                _ => ExecError::Verification(format!(
                    "failed to run sandbox binary {}: {}",
                    binary, e
                )),
            })?;

        let output = tokio::time::timeout(VERIFY_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                ExecError::Verification(format!(
                    "sandbox binary {} --version timed out after {} seconds",
                    binary,
                    VERIFY_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| {
                ExecError::Verification(format!("failed to wait for {}: {}", binary, e))
            })?;

        if !output.status.success() {
            return Err(ExecError::Verification(format!(
                "sandbox binary {} --version exited with {}: {}",
                binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn verify_image(&self) -> Result<(), ExecError> {
        match tokio::fs::metadata(&self.image).await {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(ExecError::Verification(format!(
                "sandbox image {} is not a regular file",
                self.image.display()
            ))),
            Err(e) => Err(ExecError::Verification(format!(
                "sandbox image {} not found: {}",
                self.image.display(),
                e
            ))),
        }
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, ExecError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ExecError::Config(format!("{} must be an integer, got {:?}", name, value))),
        Err(_) => Ok(None),
    }
}
