//! Memory compaction.
//!
//! # Overview
//!
//! Exec-mode conversations grow without bound. After every completed turn
//! the [`Compactor`] adds the turn's usage to the conversation's counters;
//! once a threshold is crossed it asks the agent, on a background thread, to
//! summarize the conversation as strict JSON:
//!
//! ```json
//! {"summary": "...", "durable_rules": [], "user_prefs": [], "skill_ideas": []}
//! ```
//!
//! The reply is merged into [`ChatMemory`](crate::persistence::ChatMemory)
//! and the stored continuation id is cleared (compare-and-clear), so the next
//! turn starts a fresh thread primed by the caller with
//! [`ChatMemory::render_prefix`](crate::persistence::ChatMemory::render_prefix).
//!
//! # Guarantees
//!
//! - At most one compaction per conversation runs at a time
//! - A failed compaction leaves memory and thread state untouched
//! - Progress is reported only through the [`Notifier`]

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::agents::codex::{last_agent_message, CodexExecConfig, TokenUsage};
use crate::persistence::{ChatMemory, CompactionReply, MemoryStore, ThreadStore};
use crate::process::Interrupter;
use crate::session::ConversationId;
use crate::shell::exit_code;

/// Callback receiving user-facing progress messages.
pub type Notifier = Arc<dyn Fn(String) + Send + Sync>;

pub const DEFAULT_TOKEN_THRESHOLD: u64 = 60_000;
pub const DEFAULT_TURN_THRESHOLD: u64 = 40;

/// Instruction sent to the agent to produce a compaction reply.
pub const COMPACTION_PROMPT: &str = "Compress our conversation so far into a memory record. \
Output strict JSON only (no markdown, no code fences) in this shape:\n\
{\n\
  \"summary\": \"... a 200-600 word summary ...\",\n\
  \"durable_rules\": [\"... long-term rules ...\"],\n\
  \"user_prefs\": [\"... preferences ...\"],\n\
  \"skill_ideas\": [\"... optional workflows worth turning into skills ...\"]\n\
}\n\
Requirements:\n\
- summary focuses on facts, decisions and open todos\n\
- durable_rules keeps only rules the user stated explicitly and repeatedly for the long term (at most 20)\n\
- user_prefs keeps only writing, formatting and interaction preferences (at most 20)\n\
- skill_ideas lists 0-5 directions worth capturing as reusable skills\n";

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("no continuation id to compact")]
    NoContinuation,

    #[error("failed to run compaction: {0}")]
    Spawn(String),

    #[error("compaction run failed with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
}

/// Thresholds that trigger a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSettings {
    pub token_threshold: u64,
    pub turn_threshold: u64,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            token_threshold: DEFAULT_TOKEN_THRESHOLD,
            turn_threshold: DEFAULT_TURN_THRESHOLD,
        }
    }
}

impl CompactionSettings {
    pub fn is_due(&self, memory: &ChatMemory) -> bool {
        memory.tokens_since_compact >= self.token_threshold
            || memory.turns_since_compact >= self.turn_threshold
    }
}

/// Runs one resume turn against a continuation and returns the agent's reply.
pub trait CompactionRunner: Send + Sync {
    fn resume_turn(&self, thread_id: &str, prompt: &str) -> Result<String, CompactionError>;
}

/// [`CompactionRunner`] that spawns `codex exec resume --json`.
pub struct ExecCompactionRunner {
    config: CodexExecConfig,
    interrupter: Arc<dyn Interrupter>,
}

impl ExecCompactionRunner {
    pub fn new(config: CodexExecConfig, interrupter: Arc<dyn Interrupter>) -> Self {
        Self {
            config,
            interrupter,
        }
    }
}

impl CompactionRunner for ExecCompactionRunner {
    fn resume_turn(&self, thread_id: &str, prompt: &str) -> Result<String, CompactionError> {
        if thread_id.trim().is_empty() {
            return Err(CompactionError::NoContinuation);
        }

        let mut cmd = self
            .config
            .build(Some(thread_id), prompt)
            .to_command()
            .map_err(CompactionError::Spawn)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.interrupter.prepare(&mut cmd);

        let output = cmd
            .output()
            .map_err(|e| CompactionError::Spawn(e.to_string()))?;
        if !output.status.success() {
            return Err(CompactionError::Failed {
                code: exit_code(&output.status),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(match last_agent_message(&stdout) {
            Some(text) if !text.trim().is_empty() => text,
            _ => stdout,
        })
    }
}

/// Substring from the first `{` to the last `}`, or the trimmed input.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

/// Parse the agent's reply; unparseable text becomes the summary.
pub fn parse_reply(text: &str) -> CompactionReply {
    serde_json::from_str(extract_json(text)).unwrap_or_else(|_| CompactionReply {
        summary: text.trim().to_string(),
        ..CompactionReply::default()
    })
}

/// User-facing message after a successful compaction.
pub fn success_message(memory: &ChatMemory) -> String {
    let mut msg = format!(
        "memory compacted: summary updated, {} durable rules",
        memory.rules.len()
    );
    if !memory.skill_ideas.is_empty() {
        msg.push_str("\nideas worth capturing as skills:\n");
        for idea in &memory.skill_ideas {
            msg.push_str("- ");
            msg.push_str(idea);
            msg.push('\n');
        }
    }
    msg
}

/// Counts usage and triggers background compactions.
#[derive(Clone)]
pub struct Compactor {
    memory: Arc<MemoryStore>,
    threads: Arc<ThreadStore>,
    runner: Arc<dyn CompactionRunner>,
    settings: CompactionSettings,
    in_flight: Arc<Mutex<HashSet<ConversationId>>>,
}

/// Releases the per-conversation compaction claim on drop.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<ConversationId>>>,
    conversation: ConversationId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.conversation);
    }
}

impl Compactor {
    pub fn new(
        memory: Arc<MemoryStore>,
        threads: Arc<ThreadStore>,
        runner: Arc<dyn CompactionRunner>,
        settings: CompactionSettings,
    ) -> Self {
        Self {
            memory,
            threads,
            runner,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn settings(&self) -> CompactionSettings {
        self.settings
    }

    pub fn is_compacting(&self, conversation: &ConversationId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(conversation)
    }

    /// Record a completed turn; start a background compaction when due.
    ///
    /// Returns the compaction thread if one was started.
    pub fn on_turn_completed(
        &self,
        conversation: &ConversationId,
        thread_id: Option<&str>,
        usage: TokenUsage,
        notify: Option<Notifier>,
    ) -> Option<JoinHandle<()>> {
        let memory = self.memory.record_turn(conversation, usage.billable());
        if !self.settings.is_due(&memory) {
            return None;
        }
        let thread_id = thread_id.map(str::trim).filter(|id| !id.is_empty())?.to_string();

        let guard = self.try_claim(conversation)?;
        let compactor = self.clone();
        let conversation = conversation.clone();

        Some(thread::spawn(move || {
            let _guard = guard;
            let say = |msg: String| {
                if let Some(ref notify) = notify {
                    notify(msg);
                }
            };

            log::info!(
                "compacting memory for {} (tokens={} turns={})",
                conversation,
                memory.tokens_since_compact,
                memory.turns_since_compact
            );
            say(format!(
                "compacting memory (tokens={} turns={})",
                memory.tokens_since_compact, memory.turns_since_compact
            ));

            match compactor.compact(&conversation, &thread_id) {
                Ok(updated) => {
                    log::info!("memory for {} compacted", conversation);
                    say(success_message(&updated));
                }
                Err(e) => {
                    log::warn!("memory compaction for {} failed: {}", conversation, e);
                    say(format!(
                        "memory compaction failed (continuing with the current thread): {}",
                        e
                    ));
                }
            }
        }))
    }

    /// Run one compaction synchronously.
    pub fn compact(
        &self,
        conversation: &ConversationId,
        thread_id: &str,
    ) -> Result<ChatMemory, CompactionError> {
        let text = self.runner.resume_turn(thread_id, COMPACTION_PROMPT)?;
        let reply = parse_reply(&text);
        let updated = self.memory.apply_compaction(conversation, &reply);
        self.threads.clear_if(conversation, thread_id);
        Ok(updated)
    }

    fn try_claim(&self, conversation: &ConversationId) -> Option<InFlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(conversation.clone()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            conversation: conversation.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Runner returning a canned reply, optionally blocking until released.
    struct FakeRunner {
        reply: Result<String, String>,
        calls: AtomicUsize,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl FakeRunner {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
                gate: Mutex::new(None),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err("boom".to_string()),
                calls: AtomicUsize::new(0),
                gate: Mutex::new(None),
            })
        }
    }

    impl CompactionRunner for FakeRunner {
        fn resume_turn(&self, _thread_id: &str, prompt: &str) -> Result<String, CompactionError> {
            assert_eq!(prompt, COMPACTION_PROMPT);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.gate.lock().unwrap().take() {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            }
            self.reply.clone().map_err(|stderr| CompactionError::Failed {
                code: 1,
                stderr,
            })
        }
    }

    fn conv() -> ConversationId {
        ConversationId::from("chat-1")
    }

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            cached_input_tokens: 0,
            output_tokens: output,
        }
    }

    fn setup(runner: Arc<FakeRunner>, token_threshold: u64) -> (Compactor, Arc<MemoryStore>, Arc<ThreadStore>) {
        let memory = Arc::new(MemoryStore::in_memory());
        let threads = Arc::new(ThreadStore::in_memory());
        let compactor = Compactor::new(
            Arc::clone(&memory),
            Arc::clone(&threads),
            runner,
            CompactionSettings {
                token_threshold,
                turn_threshold: 40,
            },
        );
        (compactor, memory, threads)
    }

    mod reply_parsing {
        use super::*;

        #[test]
        fn extracts_json_from_prose() {
            let text = "Sure! Here it is:\n{\"summary\":\"s\"}\nHope that helps.";
            assert_eq!(extract_json(text), "{\"summary\":\"s\"}");
        }

        #[test]
        fn extract_without_braces_returns_trimmed() {
            assert_eq!(extract_json("  plain  "), "plain");
        }

        #[test]
        fn parses_full_reply() {
            let reply = parse_reply(
                r#"{"summary":"s","durable_rules":["r"],"user_prefs":["p"],"skill_ideas":["i"]}"#,
            );
            assert_eq!(reply.summary, "s");
            assert_eq!(reply.durable_rules, vec!["r"]);
            assert_eq!(reply.user_prefs, vec!["p"]);
            assert_eq!(reply.skill_ideas, vec!["i"]);
        }

        #[test]
        fn unparseable_reply_becomes_summary() {
            let reply = parse_reply("  I could not do that {oops}  ");
            assert_eq!(reply.summary, "I could not do that {oops}");
            assert!(reply.durable_rules.is_empty());
        }
    }

    mod triggering {
        use super::*;

        #[test]
        fn triggers_exactly_once_at_threshold() {
            let runner = FakeRunner::replying(r#"{"summary":"done"}"#);
            let (compactor, memory, threads) = setup(Arc::clone(&runner), 200);
            threads.set(&conv(), "T1");

            assert!(compactor
                .on_turn_completed(&conv(), Some("T1"), usage(100, 50), None)
                .is_none());
            // 300 >= 200
            let handle = compactor
                .on_turn_completed(&conv(), Some("T1"), usage(100, 50), None)
                .expect("second turn reaches the threshold");
            handle.join().unwrap();

            let mem = memory.get(&conv());
            assert_eq!(mem.summary, "done");
            assert_eq!(mem.tokens_since_compact, 0);
            assert!(threads.get(&conv()).is_none());

            assert!(compactor
                .on_turn_completed(&conv(), Some("T1"), usage(100, 50), None)
                .is_none());
            assert_eq!(memory.get(&conv()).tokens_since_compact, 150);
            assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn turn_threshold_triggers() {
            let runner = FakeRunner::replying("{}");
            let memory = Arc::new(MemoryStore::in_memory());
            let threads = Arc::new(ThreadStore::in_memory());
            let compactor = Compactor::new(
                memory,
                threads,
                runner,
                CompactionSettings {
                    token_threshold: u64::MAX,
                    turn_threshold: 2,
                },
            );
            assert!(compactor
                .on_turn_completed(&conv(), Some("T"), TokenUsage::default(), None)
                .is_none());
            let handle = compactor.on_turn_completed(&conv(), Some("T"), TokenUsage::default(), None);
            handle.expect("second turn triggers").join().unwrap();
        }

        #[test]
        fn no_thread_no_compaction() {
            let runner = FakeRunner::replying("{}");
            let (compactor, memory, _) = setup(Arc::clone(&runner), 10);
            assert!(compactor
                .on_turn_completed(&conv(), None, usage(100, 0), None)
                .is_none());
            assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
            assert_eq!(memory.get(&conv()).tokens_since_compact, 100);
        }

        #[test]
        fn concurrent_compactions_are_skipped() {
            let runner = FakeRunner::replying("{}");
            let (release, gate) = mpsc::channel();
            *runner.gate.lock().unwrap() = Some(gate);
            let (compactor, _, _) = setup(Arc::clone(&runner), 10);

            let first = compactor
                .on_turn_completed(&conv(), Some("T"), usage(10, 0), None)
                .expect("first compaction starts");
            assert!(compactor.is_compacting(&conv()));
            assert!(compactor
                .on_turn_completed(&conv(), Some("T"), usage(10, 0), None)
                .is_none());

            release.send(()).unwrap();
            first.join().unwrap();
            assert!(!compactor.is_compacting(&conv()));
            assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        }
    }

    mod outcomes {
        use super::*;

        #[test]
        fn failure_leaves_state_untouched() {
            let (compactor, memory, threads) = setup(FakeRunner::failing(), 10);
            threads.set(&conv(), "T1");

            let messages = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&messages);
            let notify: Notifier = Arc::new(move |msg: String| sink.lock().unwrap().push(msg));

            compactor
                .on_turn_completed(&conv(), Some("T1"), usage(20, 0), Some(notify))
                .unwrap()
                .join()
                .unwrap();

            assert_eq!(threads.get(&conv()).as_deref(), Some("T1"));
            let mem = memory.get(&conv());
            assert_eq!(mem.tokens_since_compact, 20);
            assert!(mem.compacted_at.is_none());

            let messages = messages.lock().unwrap();
            assert_eq!(messages[0], "compacting memory (tokens=20 turns=1)");
            assert!(messages[1].starts_with("memory compaction failed (continuing with the current thread):"));
        }

        #[test]
        fn success_notifies_with_ideas() {
            let runner = FakeRunner::replying(
                r#"{"summary":"s","durable_rules":["a","b"],"skill_ideas":["release notes"]}"#,
            );
            let (compactor, _, _) = setup(runner, 10);

            let messages = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&messages);
            let notify: Notifier = Arc::new(move |msg: String| sink.lock().unwrap().push(msg));

            compactor
                .on_turn_completed(&conv(), Some("T1"), usage(20, 0), Some(notify))
                .unwrap()
                .join()
                .unwrap();

            let messages = messages.lock().unwrap();
            assert!(messages[1].starts_with("memory compacted: summary updated, 2 durable rules"));
            assert!(messages[1].contains("- release notes"));
        }

        #[test]
        fn clear_is_compare_and_clear() {
            let runner = FakeRunner::replying("{}");
            let (compactor, _, threads) = setup(runner, 10);
            // A newer thread was adopted while compacting T1.
            threads.set(&conv(), "T2");

            compactor.compact(&conv(), "T1").unwrap();
            assert_eq!(threads.get(&conv()).as_deref(), Some("T2"));
        }

        #[test]
        fn rules_merge_across_compactions() {
            let runner = FakeRunner::replying(r#"{"durable_rules":["b","c"]}"#);
            let (compactor, memory, _) = setup(runner, 10);
            memory.apply_compaction(
                &conv(),
                &CompactionReply {
                    durable_rules: vec!["a".to_string(), "b".to_string()],
                    ..CompactionReply::default()
                },
            );

            let updated = compactor.compact(&conv(), "T").unwrap();
            assert_eq!(updated.rules, vec!["a", "b", "c"]);
        }
    }

    #[cfg(unix)]
    mod exec_runner {
        use super::*;
        use crate::process::DirectInterrupter;
        use tempfile::tempdir;

        fn runner_for(dir: &std::path::Path, body: &str) -> ExecCompactionRunner {
            let script = dir.join("agent.sh");
            std::fs::write(&script, body).unwrap();
            ExecCompactionRunner::new(
                CodexExecConfig {
                    binary_path: "/bin/sh".to_string(),
                    global_args: vec![script.to_string_lossy().into_owned()],
                    ..CodexExecConfig::default()
                },
                Arc::new(DirectInterrupter),
            )
        }

        #[test]
        fn returns_last_agent_message() {
            let dir = tempdir().unwrap();
            let body = "printf '%s\\n' '{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"{\\\"summary\\\":\\\"x\\\"}\"}}'\n";
            let runner = runner_for(dir.path(), body);
            assert_eq!(runner.resume_turn("T1", "p").unwrap(), "{\"summary\":\"x\"}");
        }

        #[test]
        fn falls_back_to_raw_stdout() {
            let dir = tempdir().unwrap();
            let runner = runner_for(dir.path(), "echo 'plain text'\n");
            assert_eq!(runner.resume_turn("T1", "p").unwrap(), "plain text\n");
        }

        #[test]
        fn non_zero_exit_is_failure() {
            let dir = tempdir().unwrap();
            let runner = runner_for(dir.path(), "echo nope >&2\nexit 2\n");
            match runner.resume_turn("T1", "p") {
                Err(CompactionError::Failed { code, stderr }) => {
                    assert_eq!(code, 2);
                    assert_eq!(stderr, "nope");
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn empty_thread_is_rejected() {
            let dir = tempdir().unwrap();
            let runner = runner_for(dir.path(), "exit 0\n");
            assert!(matches!(
                runner.resume_turn(" ", "p"),
                Err(CompactionError::NoContinuation)
            ));
        }
    }
}
