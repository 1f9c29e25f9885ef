//! Agent process descriptions.
//!
//! A [`SpawnConfig`] describes *what* to launch (binary, args, working
//! directory, optional shell prefix, extra environment). The process handles
//! turn it into a concrete launcher:
//!
//! - [`SpawnConfig::to_command`] builds a `std::process::Command` for pipes
//! - [`SpawnConfig::to_pty_command`] builds a `portable_pty::CommandBuilder`
//!
//! Each call returns a brand-new description, so a failed pty attempt never
//! leaks partial state into the pipe fallback.
//!
//! Agent-specific configurations live in their own modules:
//! - [`crate::agents::codex::CodexExecConfig`]

use crate::shell::{build_command, command_line, path_with_binary_dir};
use portable_pty::CommandBuilder;
use std::process::Command;

/// Configuration for spawning an agent process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Path to the agent binary
    pub binary_path: String,
    /// Arguments to pass to the binary
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<String>,
    /// Custom shell prefix (e.g., "/bin/zsh -l -c")
    pub shell_prefix: Option<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl SpawnConfig {
    /// Create a new spawn config with required fields.
    pub fn new(binary_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args,
            ..Self::default()
        }
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set a custom shell prefix.
    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Build a fresh `std::process::Command` (stdio left to the caller).
    pub fn to_command(&self) -> Result<Command, String> {
        let mut cmd = build_command(
            &self.binary_path,
            &self.args,
            self.working_dir.as_deref(),
            self.shell_prefix.as_deref(),
        )?;
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        Ok(cmd)
    }

    /// Build a fresh pty command description.
    pub fn to_pty_command(&self) -> Result<CommandBuilder, String> {
        let (program, argv) = command_line(
            &self.binary_path,
            &self.args,
            self.shell_prefix.as_deref(),
        )?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(argv);

        match self.working_dir.as_deref() {
            Some(dir) => cmd.cwd(dir),
            None => {
                if let Ok(dir) = std::env::current_dir() {
                    cmd.cwd(dir);
                }
            }
        }

        if let Some(path) = path_with_binary_dir(&self.binary_path) {
            cmd.env("PATH", path);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        Ok(cmd)
    }
}
