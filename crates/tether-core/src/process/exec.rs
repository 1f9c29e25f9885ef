//! One `exec --json` subprocess per message.
//!
//! # Turn Flow
//!
//! ```text
//! send(prompt)
//!   ├─ read continuation id from the ThreadStore
//!   ├─ spawn <agent> <global> exec [resume] --json ... <prompt>
//!   ├─ stdout: JSON lines ──► adopt thread id, agent messages, usage
//!   ├─ stderr: lines ──► diagnostics (cosmetic warnings to transcript only)
//!   ├─ wait ──► exit event
//!   └─ usage ──► Compactor (may start a background compaction)
//! ```
//!
//! The continuation id is re-read at the start of every turn, so a
//! compaction that cleared it takes effect on the very next message.

use std::io::{BufRead, BufReader, Read};
use std::process::{ChildStdout, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use super::{event_channel, EventSink, EventStream, HandleError, HandleMode, Interrupter, ProcessHandle};
use crate::agents::codex::{is_cosmetic_stderr, parse_line, CodexExecConfig, ExecLine, TokenUsage};
use crate::agents::Event;
use crate::compaction::{Compactor, Notifier};
use crate::logging::Transcript;
use crate::persistence::ThreadStore;
use crate::session::SessionId;
use crate::shell::{exit_code, FALLBACK_EXIT_CODE};

/// Shared wiring for every exec handle an adapter creates.
#[derive(Clone)]
pub struct ExecContext {
    pub config: CodexExecConfig,
    pub threads: Arc<ThreadStore>,
    /// `None` when memory is disabled.
    pub compactor: Option<Compactor>,
    pub interrupter: Arc<dyn Interrupter>,
}

/// What the stdout reader learned during one turn.
#[derive(Debug, Default)]
struct TurnOutcome {
    thread_id: Option<String>,
    usage: Option<TokenUsage>,
}

pub struct ExecHandle {
    session_id: SessionId,
    context: ExecContext,
    /// Pid of the subprocess running the current turn.
    running: Mutex<Option<u32>>,
    /// Set once a newer Session replaced this one; the shared stores are
    /// no longer written.
    retired: AtomicBool,
    sink: EventSink,
    events: EventStream,
    transcript: Transcript,
    notifier: Notifier,
}

impl ExecHandle {
    /// Prepare a handle. Nothing is spawned until the first `send`.
    ///
    /// Fresh sessions drop any stored continuation id first.
    pub fn start(session_id: SessionId, context: ExecContext, transcript: Transcript) -> Self {
        let (sink, events) = event_channel();
        let conversation = session_id.conversation();

        if session_id.is_fresh() {
            if let Some(old) = context.threads.clear(conversation) {
                log::info!("fresh session {} dropped thread {}", session_id, old);
            }
        }

        if let Some(thread_id) = context.threads.get(conversation) {
            let text = format!("resumed thread_id={}", thread_id);
            transcript.note("STATUS", &text);
            sink.try_send(Event::status(text));
        }
        transcript.note("STATUS", "started mode=exec");
        sink.try_send(Event::status("started mode=exec"));

        let notifier: Notifier = {
            let sink = sink.clone();
            let transcript = transcript.clone();
            Arc::new(move |msg: String| {
                transcript.note("MEMORY", &msg);
                sink.try_send(Event::status(msg));
            })
        };

        Self {
            session_id,
            context,
            running: Mutex::new(None),
            retired: AtomicBool::new(false),
            sink,
            events,
            transcript,
            notifier,
        }
    }

    /// Whether a turn's subprocess is currently running.
    pub fn is_busy(&self) -> bool {
        self.running_pid().is_some()
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn running(&self) -> MutexGuard<'_, Option<u32>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_pid(&self) -> Option<u32> {
        *self.running()
    }

    fn run_turn(&self, prompt: &str) -> Result<(), HandleError> {
        let conversation = self.session_id.conversation();
        let stored = self.context.threads.get(conversation);

        let mut cmd = self
            .context
            .config
            .build(stored.as_deref(), prompt)
            .to_command()
            .map_err(HandleError::Command)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.context.interrupter.prepare(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| HandleError::Spawn {
            pty: None,
            pipe: e.to_string(),
        })?;
        let pid = child.id();
        *self.running() = Some(pid);
        log::debug!(
            "session {} turn started pid={} resume={}",
            self.session_id,
            pid,
            stored.is_some()
        );

        self.transcript.append(&format!("\n> {}\n", prompt));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, outcome) = thread::scope(|scope| {
            let diagnostics = stderr.map(|stderr| {
                scope.spawn(|| read_stderr(stderr, self.sink.clone(), self.transcript.clone()))
            });
            let reader = stdout.map(|stdout| scope.spawn(|| self.read_json_lines(stdout, stored)));
            let status = child.wait();
            {
                let mut running = self.running();
                if *running == Some(pid) {
                    *running = None;
                }
            }
            let outcome = reader
                .and_then(|reader| reader.join().ok())
                .unwrap_or_default();
            if let Some(diagnostics) = diagnostics {
                let _ = diagnostics.join();
            }
            (status, outcome)
        });

        let code = match status {
            Ok(ref status) => exit_code(status),
            Err(ref e) => {
                log::warn!("waiting for turn of {} failed: {}", self.session_id, e);
                FALLBACK_EXIT_CODE
            }
        };
        self.transcript.note("EXIT", &format!("code={}", code));
        self.sink.send(Event::exit(code, "process exited"));

        if self.is_retired() {
            log::debug!("session {} is retired, skipping memory update", self.session_id);
        } else if let (Some(compactor), Some(usage)) = (&self.context.compactor, outcome.usage) {
            compactor.on_turn_completed(
                conversation,
                outcome.thread_id.as_deref(),
                usage,
                Some(Arc::clone(&self.notifier)),
            );
        }

        status?;
        if code != 0 {
            return Err(HandleError::Exited { code });
        }
        Ok(())
    }

    /// Consume the turn's JSON lines. `known` is the id the turn resumed.
    fn read_json_lines(&self, stdout: ChildStdout, known: Option<String>) -> TurnOutcome {
        let mut outcome = TurnOutcome {
            thread_id: known,
            usage: None,
        };
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    self.handle_line(&line, &mut outcome);
                }
                Err(e) => {
                    self.sink
                        .try_send(Event::stderr(format!("jsonl read error: {}\n", e)));
                    break;
                }
            }
        }

        outcome
    }

    fn handle_line(&self, line: &str, outcome: &mut TurnOutcome) {
        match parse_line(line) {
            ExecLine::ThreadStarted(id) => {
                // First writer wins: a resumed or already adopted id is kept.
                if outcome.thread_id.is_some() {
                    return;
                }
                if self.is_retired() {
                    log::info!("session {} is retired, not adopting thread {}", self.session_id, id);
                    self.transcript
                        .append(&format!("[ignored thread_id {}]\n", id));
                    return;
                }
                self.context
                    .threads
                    .set(self.session_id.conversation(), &id);
                self.transcript
                    .append(&format!("[resume thread_id {}]\n", id));
                log::info!("session {} adopted thread {}", self.session_id, id);
                outcome.thread_id = Some(id);
            }
            ExecLine::AgentMessage(mut text) => {
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                self.transcript.append(&text);
                self.sink.send(Event::stdout(text));
            }
            ExecLine::TurnCompleted(usage) => {
                let total = outcome.usage.get_or_insert_with(TokenUsage::default);
                total.input_tokens += usage.input_tokens;
                total.cached_input_tokens += usage.cached_input_tokens;
                total.output_tokens += usage.output_tokens;
            }
            ExecLine::Ignored => {}
            ExecLine::Malformed(err) => {
                self.sink
                    .try_send(Event::stderr(format!("bad json: {}\n", err)));
            }
        }
    }
}

fn read_stderr(stderr: impl Read, sink: EventSink, transcript: Transcript) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let mut line = String::from_utf8_lossy(&buf).into_owned();
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                if is_cosmetic_stderr(&line) {
                    transcript.append(&format!("[filtered stderr] {}", line));
                    continue;
                }
                transcript.append(&line);
                sink.try_send(Event::stderr(line));
            }
        }
    }
}

impl ProcessHandle for ExecHandle {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn mode(&self) -> HandleMode {
        HandleMode::Exec
    }

    fn send(&self, text: &str) -> Result<(), HandleError> {
        let prompt = text.trim();
        if prompt.is_empty() {
            return Ok(());
        }
        self.run_turn(prompt)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn stop(&self) -> Result<(), HandleError> {
        match self.running_pid() {
            Some(pid) => Ok(self.context.interrupter.interrupt(pid)?),
            None => Ok(()),
        }
    }

    fn events(&self) -> EventStream {
        self.events.clone()
    }

    fn is_finished(&self) -> bool {
        false
    }
}

impl Drop for ExecHandle {
    fn drop(&mut self) {
        self.sink.close();
    }
}
