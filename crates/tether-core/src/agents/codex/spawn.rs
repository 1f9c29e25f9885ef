//! Codex exec spawn configuration and global argument assembly.

use crate::shell::read_help;
use crate::spawn::SpawnConfig;
use std::path::Path;
use std::time::Duration;

/// Deadline for the `--help` probe.
pub const HELP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Maximum help text inspected by [`detect_fixed_args`].
pub const HELP_PROBE_MAX_CHARS: usize = 8000;

/// Configuration for one `codex exec` turn.
#[derive(Debug, Clone, Default)]
pub struct CodexExecConfig {
    pub binary_path: String,
    /// Global flags placed before the `exec` subcommand.
    pub global_args: Vec<String>,
    pub skip_git_repo_check: bool,
    pub working_dir: Option<String>,
    pub shell_prefix: Option<String>,
}

impl CodexExecConfig {
    /// Argument vector for one turn.
    ///
    /// `<global> exec [resume] --json [--skip-git-repo-check] [<id>] <prompt>`
    pub fn turn_args(&self, continuation: Option<&str>, prompt: &str) -> Vec<String> {
        let mut args = self.global_args.clone();
        args.push("exec".to_string());

        let continuation = continuation.map(str::trim).filter(|id| !id.is_empty());
        if continuation.is_some() {
            args.push("resume".to_string());
        }
        args.push("--json".to_string());
        if self.skip_git_repo_check {
            args.push("--skip-git-repo-check".to_string());
        }
        if let Some(id) = continuation {
            args.push(id.to_string());
        }
        args.push(prompt.to_string());
        args
    }

    /// Build a SpawnConfig for one turn.
    pub fn build(&self, continuation: Option<&str>, prompt: &str) -> SpawnConfig {
        let mut config = SpawnConfig::new(&self.binary_path, self.turn_args(continuation, prompt));

        if let Some(ref dir) = self.working_dir {
            config = config.working_dir(dir);
        }
        if let Some(ref shell) = self.shell_prefix {
            config = config.shell_prefix(shell);
        }

        config
    }
}

/// Whether the binary is the codex CLI (by file name, ignoring `.exe`).
pub fn is_codex_binary(binary_path: &str) -> bool {
    let name = Path::new(binary_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(binary_path)
        .to_lowercase();
    name == "codex" || name == "codex.exe"
}

/// Whether the args already select a working directory.
pub fn has_cd_flag(args: &[String]) -> bool {
    args.iter()
        .any(|a| a == "-C" || a == "--cd" || a.starts_with("--cd="))
}

/// Pick the cosmetic flags a CLI advertises in its `--help` text.
pub fn detect_fixed_args(help: &str) -> Vec<String> {
    let mut fixed: Vec<String> = Vec::new();
    let mut add = |flag: &str| {
        if !fixed.iter().any(|f| f == flag) {
            fixed.push(flag.to_string());
        }
    };

    if help.contains("--no-color") {
        add("--no-color");
    } else if help.contains("--color") && help.contains("never") {
        add("--color=never");
    }

    if help.contains("--no-ansi") {
        add("--no-ansi");
    } else if help.contains("--ansi") && help.contains("never") {
        add("--ansi=never");
    }

    if help.contains("--no-progress") {
        add("--no-progress");
    }

    fixed
}

/// Probe `<binary> --help` and detect its cosmetic flags.
pub fn probe_fixed_args(binary_path: &str) -> Vec<String> {
    detect_fixed_args(&read_help(
        binary_path,
        HELP_PROBE_TIMEOUT,
        HELP_PROBE_MAX_CHARS,
    ))
}

/// Combine detected flags and user args into the global argument list.
///
/// For codex binaries a missing `--cd <dir>` and an enabled `--search` are
/// prepended.
pub fn assemble_global_args(
    binary_path: &str,
    fixed_args: &[String],
    user_args: &[String],
    working_dir: Option<&str>,
    enable_search: bool,
) -> Vec<String> {
    let mut args: Vec<String> = fixed_args.to_vec();
    args.extend(user_args.iter().cloned());

    if !is_codex_binary(binary_path) {
        return args;
    }

    if let Some(dir) = working_dir.map(str::trim).filter(|d| !d.is_empty()) {
        if !has_cd_flag(&args) {
            args.splice(0..0, ["--cd".to_string(), dir.to_string()]);
        }
    }
    if enable_search && !args.iter().any(|a| a == "--search") {
        args.insert(0, "--search".to_string());
    }

    args
}
