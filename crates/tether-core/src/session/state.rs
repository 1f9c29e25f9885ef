//! Per-session state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::process::{EventStream, HandleMode, ProcessHandle};

/// Stable external key of one chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Nanosecond wall-clock stamp, strictly increasing within this process.
fn next_stamp() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut prev = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_STAMP.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Identifier of one Session: `chat-<conversation>-<nanos>[-fresh]`.
///
/// The parts are kept structured so nothing has to parse the display form
/// back (conversation ids may themselves contain dashes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    conversation: ConversationId,
    stamp: i64,
    fresh: bool,
}

impl SessionId {
    pub fn new(conversation: ConversationId, fresh: bool) -> Self {
        Self {
            conversation,
            stamp: next_stamp(),
            fresh,
        }
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Whether the session was started without resuming a continuation.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat-{}-{}", self.conversation, self.stamp)?;
        if self.fresh {
            f.write_str("-fresh")?;
        }
        Ok(())
    }
}

/// One live agent conversation: a handle plus bookkeeping.
pub struct Session {
    handle: Arc<dyn ProcessHandle>,
    running: AtomicBool,
    /// Serializes sends so turns never interleave.
    input: Mutex<()>,
    last_error: Mutex<Option<String>>,
}

impl Session {
    pub fn new(handle: Arc<dyn ProcessHandle>) -> Self {
        Self {
            handle,
            running: AtomicBool::new(true),
            input: Mutex::new(()),
            last_error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        self.handle.session_id()
    }

    pub fn handle(&self) -> &Arc<dyn ProcessHandle> {
        &self.handle
    }

    pub fn mode(&self) -> HandleMode {
        self.handle.mode()
    }

    pub fn events(&self) -> EventStream {
        self.handle.events()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.handle.is_finished()
    }

    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub(crate) fn lock_input(&self) -> MutexGuard<'_, ()> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", self.id())
            .field("mode", &self.mode())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Snapshot reported by `SessionManager::status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub session_id: String,
    pub running: bool,
    pub last_error: Option<String>,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session={} running={}",
            self.session_id, self.running
        )?;
        if let Some(ref err) = self.last_error {
            write!(f, " last_error={}", err)?;
        }
        Ok(())
    }
}
