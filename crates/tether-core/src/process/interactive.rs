//! Long-lived agent process on a pseudo-terminal.
//!
//! # Lifecycle
//!
//! ```text
//! start ──► openpty + spawn ──ok──► reader thread (raw chunks, cursor replies)
//!              │                     wait thread   (exit code, close stream)
//!              └─err──► new Command with pipes ──► stdout + stderr line readers
//!                                                  wait thread
//! ```
//!
//! The pipe fallback builds a brand-new command from the [`SpawnConfig`]
//! instead of reusing the pty description.
//!
//! All writes to the child (user input and cursor-position replies) go
//! through one writer lock.

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, MasterPty, PtySize};

use super::terminal::{CursorQueryFilter, CURSOR_REPLY};
use super::{event_channel, EventSink, EventStream, HandleError, HandleMode, Interrupter, ProcessHandle};
use crate::agents::Event;
use crate::logging::Transcript;
use crate::session::SessionId;
use crate::shell::{exit_code, FALLBACK_EXIT_CODE, PLAIN_OUTPUT_ENV};
use crate::spawn::SpawnConfig;

/// Terminal size given to pty children.
pub const PTY_ROWS: u16 = 40;
pub const PTY_COLS: u16 = 120;

/// How long the wait thread lets readers drain after the child exits.
pub const READER_GRACE: Duration = Duration::from_millis(500);

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// Transport the child ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    Pty,
    Pipes,
}

impl fmt::Display for SpawnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnMode::Pty => write!(f, "pty"),
            SpawnMode::Pipes => write!(f, "pipes"),
        }
    }
}

/// What to launch for an interactive session.
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub spawn: SpawnConfig,
    pub transcript: Transcript,
    /// Skip the pty attempt (pipes only).
    pub force_pipes: bool,
}

impl InteractiveConfig {
    pub fn new(spawn: SpawnConfig, transcript: Transcript) -> Self {
        Self {
            spawn,
            transcript,
            force_pipes: false,
        }
    }
}

/// Handle to a long-lived interactive agent process.
pub struct InteractiveHandle {
    session_id: SessionId,
    spawn_mode: SpawnMode,
    pid: Option<u32>,
    writer: SharedWriter,
    interrupter: Arc<dyn Interrupter>,
    events: EventStream,
    finished: Arc<AtomicBool>,
    transcript: Transcript,
}

/// Everything the background threads need, produced by a spawn attempt.
struct Spawned {
    mode: SpawnMode,
    pid: Option<u32>,
    writer: Box<dyn Write + Send>,
    /// Keeps the pty open until the wait thread drops it.
    master: Option<Box<dyn MasterPty + Send>>,
    wait: Box<dyn FnOnce() -> i32 + Send>,
    readers: Vec<Reader>,
}

enum Reader {
    Pty(Box<dyn Read + Send>),
    Lines(Box<dyn Read + Send>, fn(String) -> Event),
}

impl InteractiveHandle {
    /// Spawn the agent (pty first, pipes as fallback) and start its threads.
    pub fn start(
        session_id: SessionId,
        config: InteractiveConfig,
        interrupter: Arc<dyn Interrupter>,
    ) -> Result<Self, HandleError> {
        let mut spawn = config.spawn.clone();
        for (key, value) in PLAIN_OUTPUT_ENV {
            spawn = spawn.env(key, value);
        }

        let spawned = if config.force_pipes {
            spawn_pipes(&spawn, interrupter.as_ref()).map_err(|pipe| HandleError::Spawn {
                pty: None,
                pipe,
            })?
        } else {
            match spawn_pty(&spawn) {
                Ok(spawned) => spawned,
                Err(pty) => {
                    log::warn!("pty unavailable for {}: {}; falling back to pipes", session_id, pty);
                    spawn_pipes(&spawn, interrupter.as_ref()).map_err(|pipe| {
                        HandleError::Spawn {
                            pty: Some(pty),
                            pipe,
                        }
                    })?
                }
            }
        };

        let (sink, events) = event_channel();
        let writer: SharedWriter = Arc::new(Mutex::new(Some(spawned.writer)));
        let finished = Arc::new(AtomicBool::new(false));
        let transcript = config.transcript;

        let status = format!(
            "started pid={} mode={} cmd={}",
            spawned.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
            spawned.mode,
            spawn.binary_path
        );
        log::info!("session {} {}", session_id, status);
        transcript.note("STATUS", &status);
        sink.try_send(Event::status(status));

        let (done_tx, done_rx) = mpsc::channel();
        let reader_count = spawned.readers.len();
        for reader in spawned.readers {
            let sink = sink.clone();
            let transcript = transcript.clone();
            let done = done_tx.clone();
            match reader {
                Reader::Pty(stream) => {
                    let writer = Arc::clone(&writer);
                    thread::spawn(move || read_pty(stream, writer, sink, transcript, done));
                }
                Reader::Lines(stream, make_event) => {
                    thread::spawn(move || read_lines(stream, make_event, sink, transcript, done));
                }
            }
        }
        drop(done_tx);

        {
            let writer = Arc::clone(&writer);
            let finished = Arc::clone(&finished);
            let transcript = transcript.clone();
            let master = spawned.master;
            let wait = spawned.wait;
            let session = session_id.clone();
            thread::spawn(move || {
                let code = wait();
                drain_readers(&done_rx, reader_count, READER_GRACE);

                log::info!("session {} exited with code {}", session, code);
                transcript.note("EXIT", &format!("code={}", code));
                sink.send(Event::exit(code, "process exited"));

                finished.store(true, Ordering::Release);
                writer.lock().unwrap_or_else(PoisonError::into_inner).take();
                drop(master);
                sink.close();
            });
        }

        Ok(Self {
            session_id,
            spawn_mode: spawned.mode,
            pid: spawned.pid,
            writer,
            interrupter,
            events,
            finished,
            transcript,
        })
    }

    pub fn spawn_mode(&self) -> SpawnMode {
        self.spawn_mode
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl ProcessHandle for InteractiveHandle {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn mode(&self) -> HandleMode {
        HandleMode::Interactive
    }

    fn send(&self, text: &str) -> Result<(), HandleError> {
        let mut input = text.to_string();
        if !input.ends_with('\n') {
            input.push('\n');
        }

        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = guard.as_mut().ok_or(HandleError::Closed)?;
        writer.write_all(input.as_bytes())?;
        writer.flush()?;
        drop(guard);

        self.transcript.note("STDIN", input.trim_end());
        Ok(())
    }

    fn stop(&self) -> Result<(), HandleError> {
        if self.is_finished() {
            return Ok(());
        }
        match self.pid {
            Some(pid) => Ok(self.interrupter.interrupt(pid)?),
            None => Ok(()),
        }
    }

    fn events(&self) -> EventStream {
        self.events.clone()
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

fn spawn_pty(spawn: &SpawnConfig) -> Result<Spawned, String> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: PTY_ROWS,
            cols: PTY_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| format!("Failed to open PTY: {}", e))?;

    let cmd = spawn.to_pty_command()?;
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| format!("Failed to spawn: {}", e))?;

    // Drop slave - we only need the master side
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| format!("Failed to clone reader: {}", e))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| format!("Failed to take writer: {}", e))?;

    let pid = child.process_id();
    let wait = Box::new(move || match child.wait() {
        Ok(status) => i32::try_from(status.exit_code()).unwrap_or(FALLBACK_EXIT_CODE),
        Err(e) => {
            log::warn!("waiting for pty child failed: {}", e);
            FALLBACK_EXIT_CODE
        }
    });

    Ok(Spawned {
        mode: SpawnMode::Pty,
        pid,
        writer,
        master: Some(pair.master),
        wait,
        readers: vec![Reader::Pty(reader)],
    })
}

fn spawn_pipes(spawn: &SpawnConfig, interrupter: &dyn Interrupter) -> Result<Spawned, String> {
    let mut cmd = spawn.to_command()?;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    interrupter.prepare(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| format!("Failed to spawn: {}", e))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| "Failed to capture stdin".to_string())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let pid = Some(child.id());
    let wait = Box::new(move || match child.wait() {
        Ok(status) => exit_code(&status),
        Err(e) => {
            log::warn!("waiting for child failed: {}", e);
            FALLBACK_EXIT_CODE
        }
    });

    Ok(Spawned {
        mode: SpawnMode::Pipes,
        pid,
        writer: Box::new(stdin),
        master: None,
        wait,
        readers: vec![
            Reader::Lines(Box::new(stdout), |line| Event::stdout(line)),
            Reader::Lines(Box::new(stderr), |line| Event::stderr(line)),
        ],
    })
}

fn read_pty(
    mut stream: Box<dyn Read + Send>,
    writer: SharedWriter,
    sink: EventSink,
    transcript: Transcript,
    done: Sender<()>,
) {
    let mut filter = CursorQueryFilter::new();
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf) {
            Ok(0) => break, // EOF
            Ok(n) => {
                let filtered = filter.feed(&buf[..n]);
                if filtered.queries > 0 {
                    answer_cursor_queries(&writer, filtered.queries);
                }
                forward(&sink, &transcript, filtered.text);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !is_pty_eof(&e) {
                    sink.try_send(Event::stderr(format!("read error: {}\n", e)));
                }
                break;
            }
        }
    }

    forward(&sink, &transcript, filter.finish().text);
    let _ = done.send(());
}

fn read_lines(
    stream: Box<dyn Read + Send>,
    make_event: fn(String) -> Event,
    sink: EventSink,
    transcript: Transcript,
    done: Sender<()>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let mut line = String::from_utf8_lossy(&buf).into_owned();
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                transcript.append(&line);
                if !sink.send(make_event(line)) {
                    break;
                }
            }
            Err(e) => {
                sink.try_send(Event::stderr(format!("read error: {}\n", e)));
                break;
            }
        }
    }

    let _ = done.send(());
}

fn forward(sink: &EventSink, transcript: &Transcript, text: String) {
    if text.is_empty() {
        return;
    }
    transcript.append(&text);
    sink.send(Event::stdout(text));
}

/// Write one cursor-position reply per query, under the writer lock.
fn answer_cursor_queries(writer: &SharedWriter, count: usize) {
    let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(writer) = guard.as_mut() {
        for _ in 0..count {
            if writer.write_all(CURSOR_REPLY).is_err() {
                return;
            }
        }
        let _ = writer.flush();
    }
}

/// Linux reports EIO on the master once the child side is gone.
fn is_pty_eof(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EIO)
    }
    #[cfg(not(unix))]
    {
        err.kind() == std::io::ErrorKind::BrokenPipe
    }
}

fn drain_readers(done: &Receiver<()>, count: usize, grace: Duration) {
    let deadline = Instant::now() + grace;
    for _ in 0..count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if done.recv_timeout(remaining).is_err() {
            break;
        }
    }
}
