//! Continuation id persistence.
//!
//! # File Format
//!
//! ```json
//! { "threads": { "12345": "0199a213-81c0-7800-8aa1-bbab2a035a53" } }
//! ```
//!
//! Empty ids are never stored and are dropped when loading.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{load_json, save_json};
use crate::session::ConversationId;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ThreadsFile {
    #[serde(default)]
    threads: BTreeMap<ConversationId, String>,
}

/// Durable map from conversation to continuation id.
#[derive(Debug)]
pub struct ThreadStore {
    path: Option<PathBuf>,
    threads: Mutex<BTreeMap<ConversationId, String>>,
}

impl ThreadStore {
    /// Load the store from `path`. Read errors are logged and yield an empty map.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let threads = match load_json::<ThreadsFile>(&path) {
            Ok(file) => file.threads,
            Err(e) => {
                log::warn!("thread state {} unreadable: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        let threads = threads
            .into_iter()
            .filter(|(_, id)| !id.trim().is_empty())
            .collect();

        Self {
            path: Some(path),
            threads: Mutex::new(threads),
        }
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            threads: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, conversation: &ConversationId) -> Option<String> {
        self.lock().get(conversation).cloned()
    }

    /// Store a continuation id. Blank ids are ignored.
    pub fn set(&self, conversation: &ConversationId, thread_id: &str) {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() {
            return;
        }
        let mut threads = self.lock();
        if threads.get(conversation).map(String::as_str) == Some(thread_id) {
            return;
        }
        threads.insert(conversation.clone(), thread_id.to_string());
        self.persist(&threads);
    }

    /// Remove and return the continuation id.
    pub fn clear(&self, conversation: &ConversationId) -> Option<String> {
        let mut threads = self.lock();
        let removed = threads.remove(conversation);
        if removed.is_some() {
            self.persist(&threads);
        }
        removed
    }

    /// Remove the continuation id only if it still equals `expected`.
    pub fn clear_if(&self, conversation: &ConversationId, expected: &str) -> bool {
        let mut threads = self.lock();
        if threads.get(conversation).map(String::as_str) != Some(expected) {
            return false;
        }
        threads.remove(conversation);
        self.persist(&threads);
        true
    }

    pub fn snapshot(&self) -> BTreeMap<ConversationId, String> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConversationId, String>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called with the map lock held so writes land in mutation order.
    fn persist(&self, threads: &BTreeMap<ConversationId, String>) {
        let Some(ref path) = self.path else {
            return;
        };
        let file = ThreadsFile {
            threads: threads.clone(),
        };
        if let Err(e) = save_json(path, &file) {
            log::warn!("failed to save thread state {}: {}", path.display(), e);
        }
    }
}
