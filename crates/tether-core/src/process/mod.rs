//! Agent process handles.
//!
//! A [`ProcessHandle`] wraps one agent subprocess (or, for exec mode, the
//! sequence of short-lived subprocesses that make up a conversation) behind
//! a uniform `send` / `stop` / `events` contract:
//!
//! - [`interactive::InteractiveHandle`] keeps one process alive on a pty
//! - [`exec::ExecHandle`] runs one `exec --json` process per message
//!
//! # Event Delivery
//!
//! Each handle owns a bounded queue ([`EVENT_QUEUE_CAPACITY`]) split into an
//! [`EventSink`] (producer side, shared by the reader threads) and an
//! [`EventStream`] (consumer side). Informational events use
//! [`EventSink::try_send`] and are dropped when the queue is full; agent
//! output and exit events use [`EventSink::send`], which waits for room.
//! The sink is closed exactly once, after which the stream ends.

pub mod exec;
pub mod interactive;
pub mod signal;
pub mod terminal;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::agents::Event;
use crate::session::SessionId;

pub use exec::{ExecContext, ExecHandle};
pub use interactive::{InteractiveConfig, InteractiveHandle, SpawnMode};
pub use signal::{platform_interrupter, DirectInterrupter, Interrupter};

#[cfg(unix)]
pub use signal::ProcessGroupInterrupter;

/// Capacity of each handle's event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Which transport a handle drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleMode {
    /// Long-lived process on a pseudo-terminal (or pipes as fallback).
    Interactive,
    /// One `exec --json` process per message.
    Exec,
}

impl fmt::Display for HandleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleMode::Interactive => write!(f, "interactive"),
            HandleMode::Exec => write!(f, "exec"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandleError {
    /// Spawning failed; for interactive handles both the pty and the pipe
    /// attempt are reported.
    #[error("{}", spawn_message(.pty, .pipe))]
    Spawn { pty: Option<String>, pipe: String },

    /// The command line could not be built (e.g. unquotable argument).
    #[error("invalid command: {0}")]
    Command(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The child's input side is gone.
    #[error("agent input closed")]
    Closed,

    /// An exec turn finished with a non-zero exit code.
    #[error("agent exited with code {code}")]
    Exited { code: i32 },
}

fn spawn_message(pty: &Option<String>, pipe: &str) -> String {
    match pty {
        Some(pty) => format!("failed to spawn agent (pty: {}; pipes: {})", pty, pipe),
        None => format!("failed to spawn agent: {}", pipe),
    }
}

/// Uniform control surface over one agent conversation.
pub trait ProcessHandle: Send + Sync {
    fn session_id(&self) -> &SessionId;

    fn mode(&self) -> HandleMode;

    /// Deliver text to the agent.
    ///
    /// Interactive handles write a line to the child's input. Exec handles
    /// run one full turn and return when the subprocess exits.
    fn send(&self, text: &str) -> Result<(), HandleError>;

    /// Mark the handle as superseded by a newer Session. Work still in
    /// flight may finish but must not update shared conversation state.
    fn retire(&self) {}

    /// Interrupt the running process tree. A no-op when nothing runs.
    fn stop(&self) -> Result<(), HandleError>;

    /// The event stream (a shared view; see [`EventStream::try_attach`]).
    fn events(&self) -> EventStream;

    /// Whether the handle can no longer do work (process exited).
    fn is_finished(&self) -> bool;
}

/// Create a bounded event queue.
pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_CAPACITY);
    (
        EventSink {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        EventStream {
            rx: Arc::new(Mutex::new(rx)),
            attached: Arc::new(AtomicBool::new(false)),
        },
    )
}

/// Producer side of a handle's event queue.
///
/// Clones share the same underlying sender, so [`EventSink::close`] closes
/// the queue for all of them.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Arc<Mutex<Option<SyncSender<Event>>>>,
}

impl EventSink {
    fn sender(&self) -> Option<SyncSender<Event>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send, waiting for room in the queue. Returns false once closed.
    pub fn send(&self, event: Event) -> bool {
        // Clone the sender out so a full queue never blocks `close`.
        match self.sender() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Send without waiting; the event is dropped if the queue is full.
    pub fn try_send(&self, event: Event) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                log::debug!("event queue full, dropping {:?} event", event.kind);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Close the queue. Idempotent.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Consumer side of a handle's event queue.
///
/// Finite: ends once the sink is closed and the queue drained. Not
/// restartable.
#[derive(Debug, Clone)]
pub struct EventStream {
    rx: Arc<Mutex<Receiver<Event>>>,
    attached: Arc<AtomicBool>,
}

impl EventStream {
    fn receiver(&self) -> MutexGuard<'_, Receiver<Event>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block for the next event; `None` once the stream has ended.
    pub fn recv(&self) -> Option<Event> {
        self.receiver().recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.receiver().recv_timeout(timeout)
    }

    /// Next event if one is queued.
    pub fn try_recv(&self) -> Option<Event> {
        self.receiver().try_recv().ok()
    }

    /// Claim the stream for a consumer.
    ///
    /// Returns `None` if another consumer is attached. The claim is released
    /// when the returned [`EventConsumer`] is dropped.
    pub fn try_attach(&self) -> Option<EventConsumer> {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| EventConsumer {
                stream: self.clone(),
            })
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

/// An exclusive claim on an [`EventStream`].
#[derive(Debug)]
pub struct EventConsumer {
    stream: EventStream,
}

impl EventConsumer {
    pub fn recv(&self) -> Option<Event> {
        self.stream.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.stream.recv_timeout(timeout)
    }
}

impl Iterator for EventConsumer {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.stream.recv()
    }
}

impl Drop for EventConsumer {
    fn drop(&mut self) {
        self.stream.attached.store(false, Ordering::Release);
    }
}
