//! Chat memory persistence.
//!
//! # File Format
//!
//! ```json
//! {
//!   "chats": {
//!     "12345": {
//!       "summary": "...",
//!       "rules": ["answer in English"],
//!       "prefs": ["short replies"],
//!       "updated_at": "2026-01-01T10:00:00Z",
//!       "compacted_at": null,
//!       "tokens_since_compact": 1200,
//!       "turns_since_compact": 3,
//!       "skill_ideas": []
//!     }
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{load_json, save_json};
use crate::session::ConversationId;

/// Cap for durable rules and preferences.
pub const MEMORY_LIST_CAP: usize = 20;
/// Cap for skill ideas.
pub const SKILL_IDEAS_CAP: usize = 5;

/// Durable memory for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMemory {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub prefs: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub compacted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens_since_compact: u64,
    #[serde(default)]
    pub turns_since_compact: u64,
    /// Suggestions from the last compaction, shown to the user.
    #[serde(default)]
    pub skill_ideas: Vec<String>,
}

impl ChatMemory {
    /// Render rules, summary and prefs as a prompt prefix.
    ///
    /// Returns `None` when there is nothing to inject.
    pub fn render_prefix(&self) -> Option<String> {
        let mut out = String::new();

        let rules = trim_list(&self.rules, 0);
        if !rules.is_empty() {
            out.push_str("Durable rules (long-term, follow these first):\n");
            for rule in &rules {
                out.push_str("- ");
                out.push_str(rule);
                out.push('\n');
            }
            out.push('\n');
        }

        let summary = self.summary.trim();
        if !summary.is_empty() {
            out.push_str("Conversation summary (for continuity):\n");
            out.push_str(summary);
            out.push_str("\n\n");
        }

        let prefs = trim_list(&self.prefs, 0);
        if !prefs.is_empty() {
            out.push_str("Preferences (follow when possible):\n");
            for pref in &prefs {
                out.push_str("- ");
                out.push_str(pref);
                out.push('\n');
            }
            out.push('\n');
        }

        (!out.is_empty()).then_some(out)
    }
}

/// The structured reply requested from the agent during compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompactionReply {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub durable_rules: Vec<String>,
    #[serde(default)]
    pub user_prefs: Vec<String>,
    #[serde(default)]
    pub skill_ideas: Vec<String>,
}

/// Append `add` to `base`, trimming, dropping blanks and exact duplicates,
/// then truncate to `limit` (0 means unlimited).
pub fn merge_unique(base: &[String], add: &[String], limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in base.iter().chain(add) {
        let item = item.trim();
        if item.is_empty() || !seen.insert(item.to_string()) {
            continue;
        }
        out.push(item.to_string());
    }
    if limit > 0 {
        out.truncate(limit);
    }
    out
}

/// Trim entries, drop blanks and truncate to `limit` (0 means unlimited).
pub fn trim_list(items: &[String], limit: usize) -> Vec<String> {
    let mut out: Vec<String> = items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if limit > 0 {
        out.truncate(limit);
    }
    out
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    #[serde(default)]
    chats: BTreeMap<ConversationId, ChatMemory>,
}

/// Durable per-conversation memory.
#[derive(Debug)]
pub struct MemoryStore {
    path: Option<PathBuf>,
    chats: Mutex<BTreeMap<ConversationId, ChatMemory>>,
}

impl MemoryStore {
    /// Load the store from `path`. Read errors are logged and yield an empty map.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let chats = match load_json::<MemoryFile>(&path) {
            Ok(file) => file.chats,
            Err(e) => {
                log::warn!("memory file {} unreadable: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self {
            path: Some(path),
            chats: Mutex::new(chats),
        }
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            chats: Mutex::new(BTreeMap::new()),
        }
    }

    /// Memory for a conversation (default when unknown).
    pub fn get(&self, conversation: &ConversationId) -> ChatMemory {
        self.lock().get(conversation).cloned().unwrap_or_default()
    }

    /// Count one completed turn and persist. Returns the updated memory.
    pub fn record_turn(&self, conversation: &ConversationId, tokens: u64) -> ChatMemory {
        let mut chats = self.lock();
        let memory = chats.entry(conversation.clone()).or_default();
        memory.turns_since_compact = memory.turns_since_compact.saturating_add(1);
        memory.tokens_since_compact = memory.tokens_since_compact.saturating_add(tokens);
        memory.updated_at = Some(Utc::now());
        let updated = memory.clone();
        self.persist(&chats);
        updated
    }

    /// Merge a compaction reply, reset counters and persist.
    pub fn apply_compaction(
        &self,
        conversation: &ConversationId,
        reply: &CompactionReply,
    ) -> ChatMemory {
        let now = Utc::now();
        let mut chats = self.lock();
        let memory = chats.entry(conversation.clone()).or_default();
        memory.summary = reply.summary.trim().to_string();
        memory.rules = merge_unique(&memory.rules, &reply.durable_rules, MEMORY_LIST_CAP);
        memory.prefs = merge_unique(&memory.prefs, &reply.user_prefs, MEMORY_LIST_CAP);
        memory.skill_ideas = trim_list(&reply.skill_ideas, SKILL_IDEAS_CAP);
        memory.tokens_since_compact = 0;
        memory.turns_since_compact = 0;
        memory.compacted_at = Some(now);
        memory.updated_at = Some(now);
        let updated = memory.clone();
        self.persist(&chats);
        updated
    }

    pub fn snapshot(&self) -> BTreeMap<ConversationId, ChatMemory> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConversationId, ChatMemory>> {
        self.chats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, chats: &BTreeMap<ConversationId, ChatMemory>) {
        let Some(ref path) = self.path else {
            return;
        };
        let file = MemoryFile {
            chats: chats.clone(),
        };
        if let Err(e) = save_json(path, &file) {
            log::warn!("failed to save memory {}: {}", path.display(), e);
        }
    }
}
