//! Per-user resource-limit descriptors
//!
//! The sandbox binary applies cgroup limits from a TOML file passed with
//! `--apply-cgroups`. One file per user lives under the configured cgroup
//! directory and is rewritten on every execution.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Resource ceilings applied to every sandboxed run
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Relative CPU weight (1024 = one full core)
    pub cpu_shares: u64,
    /// Memory ceiling in bytes; swap is capped to the same value
    pub memory_bytes: u64,
    /// Maximum number of processes/threads
    pub pids: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_shares: 350,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            pids: 256,
        }
    }
}

/// On-disk cgroup descriptor layout
#[derive(Serialize)]
struct LimitsFile {
    cpu: CpuSection,
    memory: MemorySection,
    pids: PidsSection,
}

#[derive(Serialize)]
struct CpuSection {
    shares: u64,
}

#[derive(Serialize)]
struct MemorySection {
    limit: u64,
    swap: u64,
}

#[derive(Serialize)]
struct PidsSection {
    limit: u64,
}

impl From<&ResourceLimits> for LimitsFile {
    fn from(limits: &ResourceLimits) -> Self {
        Self {
            cpu: CpuSection {
                shares: limits.cpu_shares,
            },
            memory: MemorySection {
                limit: limits.memory_bytes,
                swap: limits.memory_bytes,
            },
            pids: PidsSection { limit: limits.pids },
        }
    }
}

/// Whether resource limits were applied to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LimitsApplication {
    Applied { path: PathBuf },
    /// The run went ahead unconfined
    Skipped { reason: String },
}

impl LimitsApplication {
    pub fn path(&self) -> Option<&Path> {
        match self {
            LimitsApplication::Applied { path } => Some(path),
            LimitsApplication::Skipped { .. } => None,
        }
    }
}

/// Writes per-user limit files
#[derive(Debug, Clone)]
pub struct ResourceLimitBuilder {
    cgroup_dir: PathBuf,
    limits: ResourceLimits,
}

impl ResourceLimitBuilder {
    pub fn new(cgroup_dir: impl AsRef<Path>, limits: ResourceLimits) -> Self {
        Self {
            cgroup_dir: cgroup_dir.as_ref().to_path_buf(),
            limits,
        }
    }

    /// Destination file for a user
    pub fn path_for(&self, user_id: &str) -> PathBuf {
        self.cgroup_dir.join(format!("user_{}.toml", user_id))
    }

    /// Render the descriptor
    pub fn render(&self) -> Result<String> {
        toml::to_string(&LimitsFile::from(&self.limits))
            .context("Failed to serialize resource limits")
    }

    /// Write (or overwrite) the user's limit file and return its path
    pub async fn build(&self, user_id: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.cgroup_dir)
            .await
            .with_context(|| format!("Failed to create cgroup dir {:?}", self.cgroup_dir))?;

        let path = self.path_for(user_id);
        let content = self.render()?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write limits file {:?}", path))?;

        debug!("Wrote resource limits for user {} to {:?}", user_id, path);
        Ok(path)
    }

    /// Best-effort `build`: failures become `Skipped` and are logged
    pub async fn apply(&self, user_id: &str) -> LimitsApplication {
        match self.build(user_id).await {
            Ok(path) => LimitsApplication::Applied { path },
            Err(e) => {
                warn!(
                    "Running user {} without resource limits: {:#}",
                    user_id, e
                );
                LimitsApplication::Skipped {
                    reason: format!("{:#}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ResourceLimitBuilder::new(dir.path().join("cgroups"), ResourceLimits::default());

        let first_path = builder.build("alice").await.unwrap();
        let first = std::fs::read(&first_path).unwrap();
        let second_path = builder.build("alice").await.unwrap();
        let second = std::fs::read(&second_path).unwrap();

        assert_eq!(first_path, second_path);
        assert_eq!(first_path.file_name().unwrap(), "user_alice.toml");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_default_values_written() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ResourceLimitBuilder::new(dir.path(), ResourceLimits::default());
        let path = builder.build("bob").await.unwrap();

        let parsed: toml::Value = toml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed["cpu"]["shares"].as_integer(), Some(350));
        assert_eq!(parsed["memory"]["limit"].as_integer(), Some(2147483648));
        assert_eq!(parsed["memory"]["swap"].as_integer(), Some(2147483648));
        assert_eq!(parsed["pids"]["limit"].as_integer(), Some(256));
    }

    #[tokio::test]
    async fn test_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ResourceLimitBuilder::new(dir.path(), ResourceLimits::default());
        std::fs::write(builder.path_for("carol"), "garbage").unwrap();

        let path = builder.build("carol").await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), builder.render().unwrap());
    }

    #[tokio::test]
    async fn test_apply_skips_when_dir_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let builder = ResourceLimitBuilder::new(blocker.join("cgroups"), ResourceLimits::default());

        match builder.apply("dave").await {
            LimitsApplication::Skipped { reason } => assert!(reason.contains("cgroup dir")),
            other => panic!("expected Skipped, got {:?}", other),
        }
    }
}
