//! Codex-specific JSON types for the `exec --json` protocol.
//!
//! # Protocol Overview
//!
//! `codex exec --json` prints one JSON object per line on stdout. Every
//! record carries a `type` discriminator:
//!
//! ```json
//! {"type":"thread.started","thread_id":"0199a213-81c0-7800-8aa1-bbab2a035a53"}
//! {"type":"turn.started"}
//! {"type":"item.completed","item":{"id":"item_3","type":"agent_message","text":"Done."}}
//! {"type":"turn.completed","usage":{"input_tokens":24763,"cached_input_tokens":24448,"output_tokens":122}}
//! ```
//!
//! Only three record types matter to the bridge. Everything else (turn
//! started, reasoning items, command executions, ...) is ignored.
//!
//! # Rust Concept: Flat Structs vs Tagged Enums
//!
//! serde could parse this into an internally tagged enum
//! (`#[serde(tag = "type")]`), but that rejects any object without a `type`
//! field. The agent CLI is free to add records, so we parse into one flat
//! struct with every field optional and classify afterwards. A line only
//! counts as malformed when it isn't a JSON object at all.

use serde::Deserialize;

/// Record type announcing the provider-assigned thread (continuation) id.
pub const THREAD_STARTED: &str = "thread.started";
/// Record type for a finished item (agent message, reasoning, command, ...).
pub const ITEM_COMPLETED: &str = "item.completed";
/// Record type closing a turn, carrying token usage.
pub const TURN_COMPLETED: &str = "turn.completed";
/// Item type of text written by the agent for the user.
pub const AGENT_MESSAGE: &str = "agent_message";

/// One line of `exec --json` output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecRecord {
    /// The discriminator, e.g. `thread.started`.
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Present on `thread.started`.
    #[serde(default)]
    pub thread_id: Option<String>,

    /// Present on `item.*` records.
    #[serde(default)]
    pub item: Option<ExecItem>,

    /// Present on `turn.completed`.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// The nested `item` of an `item.completed` record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecItem {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub text: Option<String>,
}

/// Token usage reported by `turn.completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Tokens that count toward the compaction threshold.
    ///
    /// Cached input is already included in `input_tokens`, so it is not
    /// added a second time.
    pub fn billable(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}
