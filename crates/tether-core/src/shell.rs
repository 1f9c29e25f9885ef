//! Command-line construction for agent processes.
//!
//! # Overview
//!
//! Agent processes are normally executed directly. When an `AGENT_SHELL`
//! prefix is configured (e.g. `/bin/zsh -l -c`), the agent runs inside that
//! shell instead so it picks up the user's PATH and profile:
//!
//! - The prefix is split on whitespace into the shell program and its flags
//! - The binary and every argument are shell-quoted with `shlex`
//! - The final command is `<prefix> '<quoted command>'`
//!
//! Both process-handle variants build on [`command_line`], so the pty
//! (`portable_pty::CommandBuilder`) and pipe (`std::process::Command`) paths
//! launch exactly the same program.

use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Environment that asks CLIs to drop colors and spinners.
pub const PLAIN_OUTPUT_ENV: [(&str, &str); 3] =
    [("NO_COLOR", "1"), ("CLICOLOR", "0"), ("FORCE_COLOR", "0")];

/// Exit code used when the real one cannot be decoded (e.g. killed by a signal).
pub const FALLBACK_EXIT_CODE: i32 = 1;

/// Resolve the program and argv to execute.
///
/// Without a prefix this is simply `(binary_path, args)`.
pub fn command_line(
    binary_path: &str,
    args: &[String],
    shell_prefix: Option<&str>,
) -> Result<(String, Vec<String>), String> {
    let prefix = match shell_prefix.map(str::trim) {
        Some(prefix) if !prefix.is_empty() && cfg!(unix) => prefix,
        _ => return Ok((binary_path.to_string(), args.to_vec())),
    };

    let prefix_parts: Vec<&str> = prefix.split_whitespace().collect();
    let Some((shell_program, shell_args)) = prefix_parts.split_first() else {
        return Err("Empty shell prefix".to_string());
    };

    let mut command_parts = Vec::with_capacity(args.len() + 1);
    command_parts.push(
        shlex::try_quote(binary_path)
            .map_err(|_| format!("Invalid path: {}", binary_path))?
            .into_owned(),
    );
    for arg in args {
        command_parts.push(
            shlex::try_quote(arg)
                .map_err(|_| format!("Invalid argument: {}", arg))?
                .into_owned(),
        );
    }

    let mut argv: Vec<String> = shell_args.iter().map(|s| s.to_string()).collect();
    argv.push(command_parts.join(" "));
    Ok((shell_program.to_string(), argv))
}

/// Build a `std::process::Command` for the agent.
pub fn build_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, String> {
    let (program, argv) = command_line(binary_path, args, shell_prefix)?;

    let mut cmd = Command::new(program);
    cmd.args(argv);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    prepare_path_env(&mut cmd, binary_path);
    Ok(cmd)
}

/// Prepend the binary's parent directory to PATH so node/etc. are found.
pub fn prepare_path_env(cmd: &mut Command, binary_path: &str) {
    if let Some(combined) = path_with_binary_dir(binary_path) {
        cmd.env("PATH", combined);
    }
}

/// PATH with the binary's directory prepended, if the binary has one.
pub fn path_with_binary_dir(binary_path: &str) -> Option<String> {
    if !binary_path.contains('/') {
        return None;
    }
    let dir = std::path::Path::new(binary_path).parent()?.to_str()?;
    if dir.is_empty() {
        return None;
    }
    let existing = std::env::var("PATH").unwrap_or_default();
    Some(if existing.is_empty() {
        dir.to_string()
    } else {
        format!("{}:{}", dir, existing)
    })
}

/// Convert an OS exit status into a plain exit code.
pub fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(FALLBACK_EXIT_CODE)
}

/// Capture `<binary> --help` (stdout + stderr) with a deadline.
///
/// Whitespace is collapsed and the result truncated to `max_chars`. Any
/// failure yields an empty string: help probing is a nicety, never fatal.
pub fn read_help(binary_path: &str, timeout: Duration, max_chars: usize) -> String {
    let child = Command::new(binary_path)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            log::debug!("help probe for {} failed to spawn: {}", binary_path, e);
            return String::new();
        }
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() >= deadline => {
                log::debug!("help probe for {} timed out", binary_path);
                let _ = child.kill();
                let _ = child.wait();
                return String::new();
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            Err(_) => return String::new(),
        }
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(_) => return String::new(),
    };
    let text = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}

// ============================================================================
// TESTS
// ============================================================================
