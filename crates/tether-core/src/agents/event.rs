//! Unified event type emitted by every process handle.
//!
//! Both handle variants (pseudo-terminal and exec/JSON-lines) normalize what
//! the agent process produces into this one shape, so the front-end renders
//! them uniformly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of payload an [`Event`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Output meant for the user (terminal bytes or an agent message).
    Stdout,
    /// Diagnostics: stderr lines, malformed protocol lines, read errors.
    Stderr,
    /// Informational notes from the bridge itself.
    Status,
    /// The process (or, in exec mode, the turn) finished.
    Exit,
}

/// A single immutable event flowing from a handle to its consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub text: String,
    pub time: DateTime<Utc>,
    /// Exit code; only meaningful for [`EventKind::Exit`].
    #[serde(default)]
    pub code: i32,
}

impl Event {
    pub fn new(kind: EventKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            time: Utc::now(),
            code: 0,
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(EventKind::Stdout, text)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(EventKind::Stderr, text)
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self::new(EventKind::Status, text)
    }

    pub fn exit(code: i32, text: impl Into<String>) -> Self {
        Self {
            code,
            ..Self::new(EventKind::Exit, text)
        }
    }

    pub fn is_exit(&self) -> bool {
        self.kind == EventKind::Exit
    }
}
