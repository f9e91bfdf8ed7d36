//! Batch script rendering

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::config::Config;
use crate::core::utils::shell_quote;
use crate::error::ExecError;
use crate::sandbox::{BindMode, SandboxCommand};

/// In-sandbox mount point for scripts outside the cluster workspace
const SCRIPT_MOUNT_DIR: &str = "/opt/job";

/// Resources requested from the batch scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterJobSpec {
    pub partition: String,
    /// Wall time, e.g. `01:00:00`
    pub time: String,
    pub cpus: u32,
    /// Memory request, e.g. `4G`
    pub memory: String,
    /// Stdout log path; defaults to the cluster log directory
    pub output: Option<String>,
    /// Stderr log path; defaults to the cluster log directory
    pub error: Option<String>,
}

impl Default for ClusterJobSpec {
    fn default() -> Self {
        Self {
            partition: "compute".to_string(),
            time: "01:00:00".to_string(),
            cpus: 1,
            memory: "4G".to_string(),
            output: None,
            error: None,
        }
    }
}

impl ClusterJobSpec {
    /// Reject values that would break out of a `#SBATCH` directive
    pub fn validate(&self) -> Result<(), ExecError> {
        let fields = [
            ("partition", Some(&self.partition)),
            ("time", Some(&self.time)),
            ("memory", Some(&self.memory)),
            ("output", self.output.as_ref()),
            ("error", self.error.as_ref()),
        ];
        for (name, value) in fields {
            let Some(value) = value else { continue };
            if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(ExecError::Scheduler(format!(
                    "invalid {} value {:?}",
                    name, value
                )));
            }
        }
        if self.cpus == 0 {
            return Err(ExecError::Scheduler("cpus must be at least 1".into()));
        }
        Ok(())
    }
}

/// Cluster-side workspace of a user
pub fn cluster_workspace(config: &Config, user_id: &str) -> String {
    format!(
        "{}/user_{}",
        config.cluster.workspace_root.trim_end_matches('/'),
        user_id
    )
}

/// Render the batch script for one job
pub fn render_batch_script(
    config: &Config,
    user_id: &str,
    script_path: &str,
    spec: &ClusterJobSpec,
) -> String {
    let workspace = cluster_workspace(config, user_id);
    let log_dir = config.cluster.log_dir.trim_end_matches('/');
    let job_name = format!("exec_{}", user_id);
    let output = spec
        .output
        .clone()
        .unwrap_or_else(|| format!("{}/{}_%j.out", log_dir, job_name));
    let error = spec
        .error
        .clone()
        .unwrap_or_else(|| format!("{}/{}_%j.err", log_dir, job_name));

    let host_script = if script_path.starts_with('/') {
        script_path.to_string()
    } else {
        format!("{}/{}", workspace, script_path)
    };
    let workdir = config.sandbox_workdir.trim_end_matches('/');

    let mut sandbox = SandboxCommand::new(&config.sandbox_binary, &config.image)
        .bind(&workspace, workdir, BindMode::ReadWrite)
        .workdir(workdir);
    let sandbox_script = match host_script.strip_prefix(&format!("{}/", workspace)) {
        Some(relative) => format!("{}/{}", workdir, relative),
        None => {
            let name = host_script.rsplit('/').next().unwrap_or("script");
            let target = format!("{}/{}", SCRIPT_MOUNT_DIR, name);
            sandbox = sandbox.bind(&host_script, &target, BindMode::ReadOnly);
            target
        }
    };

    let interpreter = config.interpreter_for(std::path::Path::new(&host_script));
    let command_line = sandbox
        .command(interpreter.iter().cloned().chain(std::iter::once(sandbox_script)))
        .to_vec()
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");

    let mut script = String::from("#!/bin/bash\n");
    let directives = [
        ("job-name", job_name.clone()),
        ("partition", spec.partition.clone()),
        ("time", spec.time.clone()),
        ("cpus-per-task", spec.cpus.to_string()),
        ("mem", spec.memory.clone()),
        ("output", output),
        ("error", error),
    ];
    for (flag, value) in directives {
        let _ = writeln!(script, "#SBATCH --{}={}", flag, value);
    }
    script.push('\n');
    script.push_str("set -euo pipefail\n");
    let _ = writeln!(script, "mkdir -p {}", shell_quote(&workspace));
    let _ = writeln!(script, "cd {}", shell_quote(&workspace));
    let _ = writeln!(script, "{}", command_line);
    script
}
