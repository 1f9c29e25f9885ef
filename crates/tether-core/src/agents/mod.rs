//! Agent protocols and the unified event type.

pub mod codex;
pub mod event;

pub use event::{Event, EventKind};
