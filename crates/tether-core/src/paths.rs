use regex::Regex;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Result<String, String> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Ok(home);
        }
    }

    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.is_empty() {
            return Ok(profile);
        }
    }

    Err("Home directory not set".to_string())
}

/// Expand a leading `~` to the home directory.
///
/// Paths without `~` (or with no resolvable home) are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return PathBuf::from(path),
    };
    match get_home_dir() {
        Ok(home) => PathBuf::from(format!("{}{}", home, rest)),
        Err(_) => PathBuf::from(path),
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` so a session id is a safe file name.
pub fn sanitize_file_name(name: &str) -> String {
    static UNSAFE: OnceLock<Option<Regex>> = OnceLock::new();
    let cleaned = match UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").ok()) {
        Some(re) => re.replace_all(name, "_").into_owned(),
        None => name.to_string(),
    };
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// On-disk layout under the log directory.
///
/// ```text
/// <log_dir>/state.json        continuation ids
/// <log_dir>/memory.json       chat memory
/// <log_dir>/sessions/*.log    transcripts
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        Self {
            root: log_dir.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn memory_file(&self) -> PathBuf {
        self.root.join("memory.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Transcript file name (without extension) for a session id.
    pub fn transcript_name(&self, session_id: &str) -> String {
        sanitize_file_name(session_id)
    }
}
