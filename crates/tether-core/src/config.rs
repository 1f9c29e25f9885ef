//! Bridge configuration from plain key-value settings.
//!
//! Values come from a lookup function so tests can feed a map and the daemon
//! can feed the process environment. Malformed booleans and numbers keep
//! their defaults instead of failing startup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::agents::codex::is_codex_binary;
use crate::compaction::{CompactionSettings, DEFAULT_TOKEN_THRESHOLD, DEFAULT_TURN_THRESHOLD};
use crate::paths::expand_home;

pub const DEFAULT_BINARY: &str = "codex";
pub const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown driver '{0}' (expected 'exec' or 'interactive')")]
    UnknownDriver(String),

    #[error("working directory does not exist: {0}")]
    WorkingDir(String),
}

/// How the agent is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// One `exec --json` process per message.
    Exec,
    /// One long-lived process on a pseudo-terminal.
    Interactive,
}

impl Driver {
    /// Default driver for a binary: exec for codex, interactive otherwise.
    pub fn infer(binary_path: &str) -> Self {
        if is_codex_binary(binary_path) {
            Driver::Exec
        } else {
            Driver::Interactive
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Driver::Exec => write!(f, "exec"),
            Driver::Interactive => write!(f, "interactive"),
        }
    }
}

impl FromStr for Driver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exec" => Ok(Driver::Exec),
            "interactive" => Ok(Driver::Interactive),
            other => Err(ConfigError::UnknownDriver(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub binary_path: String,
    /// Extra global arguments supplied by the user.
    pub user_args: Vec<String>,
    /// Shell command the agent is run through, e.g. `/bin/zsh -l -c`.
    pub shell_prefix: Option<String>,
    pub working_dir: Option<String>,
    /// Root for the state file, memory file and transcripts.
    pub log_dir: PathBuf,
    pub driver: Driver,
    pub skip_git_repo_check: bool,
    pub enable_search: bool,
    /// Probe `--help` for cosmetic output flags.
    pub detect_flags: bool,
    pub memory_enabled: bool,
    pub compaction: CompactionSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            binary_path: DEFAULT_BINARY.to_string(),
            user_args: Vec::new(),
            shell_prefix: None,
            working_dir: None,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            driver: Driver::Exec,
            skip_git_repo_check: true,
            enable_search: false,
            detect_flags: true,
            memory_enabled: true,
            compaction: CompactionSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Read the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from a key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let first = |keys: &[&str]| keys.iter().find_map(|&key| get(key));

        let binary_path = first(&["CODEX_CMD", "CODEX_BIN", "ADAPTER_CMD"])
            .unwrap_or_else(|| DEFAULT_BINARY.to_string());
        let is_codex = is_codex_binary(&binary_path);

        let driver = match get("CODEX_DRIVER") {
            Some(value) => value.parse().unwrap_or_else(|e| {
                log::warn!("{}; using interactive", e);
                Driver::Interactive
            }),
            None => Driver::infer(&binary_path),
        };

        let working_dir = get("WORKDIR").or_else(|| {
            std::env::current_dir()
                .ok()
                .map(|dir| dir.to_string_lossy().into_owned())
        });

        Self {
            user_args: first(&["CODEX_ARGS", "ADAPTER_ARGS"])
                .map(|args| split_args(&args))
                .unwrap_or_default(),
            shell_prefix: get("AGENT_SHELL"),
            working_dir,
            log_dir: get("LOG_DIR")
                .map(|dir| expand_home(&dir))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            driver,
            skip_git_repo_check: parse_bool(get("CODEX_SKIP_GIT_REPO_CHECK"), is_codex),
            enable_search: parse_bool(get("CODEX_ENABLE_SEARCH"), false),
            detect_flags: parse_bool(get("CODEX_DETECT_FLAGS"), true),
            memory_enabled: parse_bool(get("MEMORY_ENABLE"), true),
            compaction: CompactionSettings {
                token_threshold: parse_positive(get("MEMORY_TOKEN_THRESHOLD"), DEFAULT_TOKEN_THRESHOLD),
                turn_threshold: parse_positive(get("MEMORY_TURN_THRESHOLD"), DEFAULT_TURN_THRESHOLD),
            },
            binary_path,
        }
    }

    /// Memory only works with exec continuations.
    pub fn memory_active(&self) -> bool {
        self.memory_enabled && self.driver == Driver::Exec
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref dir) = self.working_dir {
            if !Path::new(dir).is_dir() {
                return Err(ConfigError::WorkingDir(dir.clone()));
            }
        }
        Ok(())
    }
}

/// Shell-word split, falling back to whitespace for unbalanced quotes.
pub fn split_args(raw: &str) -> Vec<String> {
    shlex::split(raw).unwrap_or_else(|| raw.split_whitespace().map(str::to_string).collect())
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.map(|v| v.to_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "y" | "on") => true,
        Some("0" | "false" | "no" | "n" | "off") => false,
        _ => default,
    }
}

fn parse_positive(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}
