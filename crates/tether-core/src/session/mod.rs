//! Session management for chat conversations.
//!
//! A conversation keeps one installed Session at a time. The Session
//! survives across turns; it is replaced on `/new`, or when its process
//! has finished.

mod manager;
mod state;

pub use manager::{SessionBackend, SessionError, SessionManager};
pub use state::{ConversationId, Session, SessionId, SessionStatus};
