//! Persistence layer for continuation ids and chat memory.
//!
//! # Overview
//!
//! Two independent JSON files live under the log directory:
//!
//! - **Threads** - conversation id → provider continuation id
//! - **Memory** - per-conversation summary, rules, prefs and usage counters
//!
//! ```text
//! <log_dir>/
//! ├── state.json      # {"threads": {"<conv>": "<thread id>"}}
//! └── memory.json     # {"chats": {"<conv>": {...}}}
//! ```
//!
//! # Design Principles
//!
//! ## Atomic Writes
//!
//! All save operations use write-then-rename to prevent corruption:
//!
//! 1. Write to `file.json.tmp`
//! 2. Rename to `file.json` (atomic on Unix)
//!
//! ## Explicit Stores
//!
//! Each file is owned by one store object holding its own mutex and path.
//! There is no global state, so independent adapters (e.g. in tests) never
//! share maps by accident.
//!
//! ## Failures Are Absorbed
//!
//! The helpers here return `std::io::Error`, but the stores log and swallow
//! them: a broken state file must never break a conversation.

pub mod memory;
pub mod threads;

pub use memory::{
    merge_unique, trim_list, ChatMemory, CompactionReply, MemoryStore, MEMORY_LIST_CAP,
    SKILL_IDEAS_CAP,
};
pub use threads::ThreadStore;

use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;

    let temp = temp_path(path);
    fs::write(&temp, json)?;
    fs::rename(&temp, path)?;
    Ok(())
}

/// Load JSON from `path`, returning `T::default()` when the file is missing.
pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, Error> {
    if !path.exists() {
        return Ok(T::default());
    }

    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&contents).map_err(|e| Error::new(ErrorKind::InvalidData, e))
}
