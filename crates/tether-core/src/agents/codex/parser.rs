//! Codex `exec --json` stream parser.
//!
//! Turns line-delimited JSON records into [`ExecLine`] values the exec
//! handle acts on. The parser itself has no side effects: adopting thread
//! ids, writing transcripts and emitting events are the caller's job.
//!
//! # Buffering
//!
//! Data may arrive in arbitrary chunks, so [`ExecParser::feed`] buffers until
//! it has complete newline-terminated lines, and [`ExecParser::flush`] parses
//! whatever is left once the stream ends. Callers that already read whole
//! lines can use [`parse_line`] directly.

use super::types::{
    ExecRecord, TokenUsage, AGENT_MESSAGE, ITEM_COMPLETED, THREAD_STARTED, TURN_COMPLETED,
};

/// What a single protocol line means to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecLine {
    /// `thread.started` with a non-empty id.
    ThreadStarted(String),
    /// `item.completed` carrying non-empty agent text.
    AgentMessage(String),
    /// `turn.completed` with its usage (zeroed when absent).
    TurnCompleted(TokenUsage),
    /// Valid JSON the bridge has no use for.
    Ignored,
    /// Not a JSON object; the payload is the parse error.
    Malformed(String),
}

/// Parse a single complete line.
pub fn parse_line(line: &str) -> ExecLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ExecLine::Ignored;
    }

    let record: ExecRecord = match serde_json::from_str(trimmed) {
        Ok(record) => record,
        Err(e) => return ExecLine::Malformed(e.to_string()),
    };

    match record.kind.as_str() {
        THREAD_STARTED => match record.thread_id {
            Some(id) if !id.trim().is_empty() => ExecLine::ThreadStarted(id.trim().to_string()),
            _ => ExecLine::Ignored,
        },
        ITEM_COMPLETED => match record.item {
            Some(item) if item.kind == AGENT_MESSAGE => match item.text {
                Some(text) if !text.is_empty() => ExecLine::AgentMessage(text),
                _ => ExecLine::Ignored,
            },
            _ => ExecLine::Ignored,
        },
        TURN_COMPLETED => ExecLine::TurnCompleted(record.usage.unwrap_or_default()),
        _ => ExecLine::Ignored,
    }
}

/// Whether a stderr line is a known cosmetic warning from the agent CLI.
///
/// Example of a filtered line:
/// `ERROR codex_core::rollout::list: state db missing rollout path for thread ...`
pub fn is_cosmetic_stderr(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("codex_core::rollout::list") && lower.contains("missing rollout path")
}

/// Incremental parser for chunked `exec --json` output.
#[derive(Debug, Default)]
pub struct ExecParser {
    /// Buffer for the trailing incomplete line.
    buffer: String,
}

impl ExecParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect the lines it completed.
    pub fn feed(&mut self, data: &str) -> Vec<ExecLine> {
        self.buffer.push_str(data);

        // Take ownership of the buffer so we can split it without borrowing self.
        let buffer = std::mem::take(&mut self.buffer);
        let mut lines: Vec<&str> = buffer.split('\n').collect();

        // Keep the last incomplete line in the buffer
        if let Some(incomplete) = lines.pop() {
            self.buffer = incomplete.to_string();
        }

        lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .map(parse_line)
            .collect()
    }

    /// Parse any remaining buffered content.
    pub fn flush(&mut self) -> Vec<ExecLine> {
        let remaining = std::mem::take(&mut self.buffer);
        if remaining.trim().is_empty() {
            Vec::new()
        } else {
            vec![parse_line(&remaining)]
        }
    }
}

/// Return the text of the last agent message in a complete `exec --json`
/// transcript, if any.
pub fn last_agent_message(output: &str) -> Option<String> {
    let mut parser = ExecParser::new();
    let mut lines = parser.feed(output);
    lines.extend(parser.flush());

    lines.into_iter().rev().find_map(|line| match line {
        ExecLine::AgentMessage(text) => Some(text),
        _ => None,
    })
}
