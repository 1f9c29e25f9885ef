//! Per-session transcripts.
//!
//! Each session gets an append-only plain-text file used for debugging and
//! audit. Raw agent output is appended verbatim; bookkeeping notes are
//! written as timestamped `[ts] TAG: text` lines. Everything is best-effort:
//! a transcript that cannot be opened silently becomes a no-op.

use chrono::Utc;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

/// Format current UTC time as ISO 8601 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
pub fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Thread-safe handle to an append-only transcript file.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    file: Arc<Mutex<Option<File>>>,
    path: Option<PathBuf>,
}

impl Transcript {
    /// Open (or create) `{dir}/{name}.log`.
    pub fn open(dir: &Path, name: &str) -> Self {
        let path = dir.join(format!("{}.log", name));
        let file = std::fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));

        match file {
            Ok(file) => Self {
                file: Arc::new(Mutex::new(Some(file))),
                path: Some(path),
            },
            Err(e) => {
                log::warn!("transcript {} unavailable: {}", path.display(), e);
                Self::disabled()
            }
        }
    }

    /// A transcript that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Append raw text exactly as received.
    pub fn append(&self, data: &str) {
        self.with_file(|file| file.write_all(data.as_bytes()));
    }

    /// Write a timestamped bookkeeping line.
    pub fn note(&self, tag: &str, text: &str) {
        let ts = utc_timestamp();
        self.with_file(|file| writeln!(file, "[{}] {}: {}", ts, tag, text));
    }

    fn with_file(&self, write: impl FnOnce(&mut File) -> std::io::Result<()>) {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ref mut file) = *guard {
            let _ = write(file).and_then(|_| file.flush());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn utc_timestamp_format() {
        let ts = utc_timestamp();
        // Should be ISO 8601 format: YYYY-MM-DDTHH:MM:SS.mmmZ
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 24);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[7..8], "-");
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[13..14], ":");
        assert_eq!(&ts[16..17], ":");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn open_creates_file_and_dirs() {
        let dir = tempdir().unwrap();
        let sessions = dir.path().join("sessions");

        let transcript = Transcript::open(&sessions, "chat-1-42");
        assert!(transcript.is_enabled());
        assert!(sessions.join("chat-1-42.log").exists());
    }

    #[test]
    fn append_and_note() {
        let dir = tempdir().unwrap();
        let transcript = Transcript::open(dir.path(), "t");
        transcript.append("raw output\n");
        transcript.note("STATUS", "hello world");

        let contents = std::fs::read_to_string(dir.path().join("t.log")).unwrap();
        assert!(contents.starts_with("raw output\n"));
        assert!(contents.contains("] STATUS: hello world"));
        assert!(contents.contains('Z'));
    }

    #[test]
    fn clones_share_the_file() {
        let dir = tempdir().unwrap();
        let transcript = Transcript::open(dir.path(), "shared");
        let clone = transcript.clone();
        transcript.append("a");
        clone.append("b");

        let contents = std::fs::read_to_string(dir.path().join("shared.log")).unwrap();
        assert_eq!(contents, "ab");
    }

    #[test]
    fn unwritable_dir_is_noop() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        // A regular file where the directory should be.
        let transcript = Transcript::open(&blocker, "t");
        assert!(!transcript.is_enabled());
        transcript.append("ignored");
        transcript.note("TAG", "ignored");
    }
}
