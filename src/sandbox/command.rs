//! Sandbox command line construction
//!
//! Produces `<binary> exec <isolation flags> [binds] [--pwd] [--apply-cgroups]
//! <image> <command...>` for an Apptainer-compatible CLI.

use std::path::{Path, PathBuf};

use crate::runner::CommandSpec;

/// Flags applied to every sandboxed run: private /tmp and /var/tmp, no
/// inherited environment, no home directory mount
pub const ISOLATION_FLAGS: [&str; 3] = ["--contain", "--cleanenv", "--no-home"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    ReadOnly,
    ReadWrite,
}

impl BindMode {
    fn as_str(self) -> &'static str {
        match self {
            BindMode::ReadOnly => "ro",
            BindMode::ReadWrite => "rw",
        }
    }
}

/// Builder for a sandboxed invocation
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    binary: String,
    image: String,
    binds: Vec<String>,
    workdir: Option<String>,
    limits_file: Option<PathBuf>,
    command: Vec<String>,
}

impl SandboxCommand {
    pub fn new(binary: impl AsRef<Path>, image: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().display().to_string(),
            image: image.as_ref().display().to_string(),
            binds: Vec::new(),
            workdir: None,
            limits_file: None,
            command: Vec::new(),
        }
    }

    /// Bind `host` at `target` inside the sandbox
    pub fn bind(mut self, host: impl AsRef<Path>, target: &str, mode: BindMode) -> Self {
        self.binds.push(format!(
            "{}:{}:{}",
            host.as_ref().display(),
            target,
            mode.as_str()
        ));
        self
    }

    /// Working directory inside the sandbox
    pub fn workdir(mut self, path: impl Into<String>) -> Self {
        self.workdir = Some(path.into());
        self
    }

    /// Resource-limit file passed with `--apply-cgroups`
    pub fn limits_file(mut self, path: Option<&Path>) -> Self {
        self.limits_file = path.map(Path::to_path_buf);
        self
    }

    /// Command run inside the sandbox
    pub fn command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments passed to the sandbox binary
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        args.extend(ISOLATION_FLAGS.iter().map(|f| f.to_string()));

        for bind in &self.binds {
            args.push("--bind".to_string());
            args.push(bind.clone());
        }
        if let Some(workdir) = &self.workdir {
            args.push("--pwd".to_string());
            args.push(workdir.clone());
        }
        if let Some(limits_file) = &self.limits_file {
            args.push("--apply-cgroups".to_string());
            args.push(limits_file.display().to_string());
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }

    /// Full command line (binary + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.binary.clone()];
        v.extend(self.args());
        v
    }

    pub fn into_spec(self) -> CommandSpec {
        CommandSpec::new(self.binary.clone()).with_args(self.args())
    }
}
