//! # tether-core
//!
//! Session engine that bridges chat conversations to a locally spawned
//! agent CLI.
//!
//! The crate is front-end agnostic: a chat bot, a console, or a test drives
//! it through [`SessionManager`] and reads [`Event`]s back.
//!
//! ## Key Concepts
//!
//! - **Conversation**: a stable chat identity ([`ConversationId`])
//! - **Session**: the live agent process (or exec turn sequence) serving one
//!   conversation
//! - **Continuation**: the agent-assigned thread id that lets a new process
//!   resume an old conversation; persisted in the [`ThreadStore`]
//! - **Compaction**: summarizing a long conversation into [`ChatMemory`] and
//!   starting over from a new continuation

pub mod adapter;
pub mod agents;
pub mod compaction;
pub mod config;
pub mod logging;
pub mod paths;
pub mod persistence;
pub mod process;
pub mod session;
pub mod shell;
pub mod spawn;

// Re-export commonly used types
pub use adapter::Adapter;
pub use agents::{Event, EventKind};
pub use config::{BridgeConfig, ConfigError, Driver};
pub use persistence::{ChatMemory, MemoryStore, ThreadStore};
pub use process::{EventStream, HandleError, HandleMode, ProcessHandle};
pub use session::{ConversationId, Session, SessionError, SessionId, SessionManager, SessionStatus};
