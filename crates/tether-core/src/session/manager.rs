//! SessionManager - one live Session per conversation.
//!
//! The manager owns the map from conversation to installed Session and is
//! the only place Sessions are created. Creation is serialized so concurrent
//! first messages for a conversation end up on the same Session, and a
//! replaced Session is stopped only after its successor is installed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::state::{ConversationId, Session, SessionId, SessionStatus};
use crate::process::{HandleError, ProcessHandle};

/// Produces process handles for new Sessions.
pub trait SessionBackend: Send + Sync {
    fn start(&self, session_id: &SessionId) -> Result<Arc<dyn ProcessHandle>, HandleError>;
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to start session: {0}")]
    Start(#[source] HandleError),

    #[error("send to {session_id} failed: {source}")]
    Send {
        session_id: String,
        #[source]
        source: HandleError,
    },

    #[error("failed to stop session: {0}")]
    Stop(#[source] HandleError),
}

pub struct SessionManager {
    backend: Arc<dyn SessionBackend>,
    sessions: Mutex<HashMap<ConversationId, Arc<Session>>>,
    creating: Mutex<()>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
            creating: Mutex::new(()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ConversationId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn creating(&self) -> MutexGuard<'_, ()> {
        self.creating.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The installed Session, if any.
    pub fn current(&self, conversation: &ConversationId) -> Option<Arc<Session>> {
        self.sessions().get(conversation).cloned()
    }

    /// Existing Session, or a new resuming one.
    pub fn get_or_create(&self, conversation: &ConversationId) -> Result<Arc<Session>, SessionError> {
        let _creating = self.creating();
        if let Some(session) = self.current(conversation) {
            return Ok(session);
        }
        self.install(conversation, false)
    }

    /// Replace the conversation's Session with one that starts a new
    /// continuation.
    pub fn new_fresh(&self, conversation: &ConversationId) -> Result<Arc<Session>, SessionError> {
        let _creating = self.creating();
        self.install(conversation, true)
    }

    /// Replace the conversation's Session with one that resumes the stored
    /// continuation.
    pub fn new_resume(&self, conversation: &ConversationId) -> Result<Arc<Session>, SessionError> {
        let _creating = self.creating();
        self.install(conversation, false)
    }

    /// Caller must hold `creating`.
    fn install(&self, conversation: &ConversationId, fresh: bool) -> Result<Arc<Session>, SessionError> {
        let session_id = SessionId::new(conversation.clone(), fresh);
        let handle = self.backend.start(&session_id).map_err(SessionError::Start)?;
        let session = Arc::new(Session::new(handle));

        let previous = self
            .sessions()
            .insert(conversation.clone(), Arc::clone(&session));
        log::info!(
            "session {} installed (mode={}, fresh={})",
            session_id,
            session.mode(),
            fresh
        );

        if let Some(previous) = previous {
            previous.mark_stopped();
            previous.handle().retire();
            if let Err(e) = previous.handle().stop() {
                log::debug!("stopping replaced session {} failed: {}", previous.id(), e);
            }
        }

        Ok(session)
    }

    pub fn send(&self, conversation: &ConversationId, text: &str) -> Result<(), SessionError> {
        self.send_with(conversation, text, |_| {})
    }

    /// Send `text`, calling `on_session` with the receiving Session first.
    ///
    /// Sends for one Session are serialized. A stopped Session is replaced
    /// by a resuming one before delivery.
    pub fn send_with<F>(
        &self,
        conversation: &ConversationId,
        text: &str,
        on_session: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(&Arc<Session>),
    {
        let session = self.get_or_create(conversation)?;
        let _input = session.lock_input();
        if session.is_running() {
            return deliver(&session, text, on_session);
        }

        let replacement = self.replacement_for(conversation, &session)?;
        let _replacement_input = replacement.lock_input();
        deliver(&replacement, text, on_session)
    }

    /// A running Session to use instead of `stale`.
    fn replacement_for(
        &self,
        conversation: &ConversationId,
        stale: &Arc<Session>,
    ) -> Result<Arc<Session>, SessionError> {
        let _creating = self.creating();
        if let Some(current) = self.current(conversation) {
            if !Arc::ptr_eq(&current, stale) && current.is_running() {
                return Ok(current);
            }
        }
        log::info!("session {} is stopped, resuming", stale.id());
        self.install(conversation, false)
    }

    /// Interrupt the current Session's work. A no-op without a Session.
    pub fn cancel(&self, conversation: &ConversationId) -> Result<(), SessionError> {
        match self.current(conversation) {
            Some(session) => session.handle().stop().map_err(SessionError::Stop),
            None => Ok(()),
        }
    }

    pub fn status(&self, conversation: &ConversationId) -> Option<SessionStatus> {
        self.current(conversation).map(|session| SessionStatus {
            session_id: session.id().to_string(),
            running: session.is_running(),
            last_error: session.last_error(),
        })
    }

    /// Stop every installed Session.
    pub fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions().values().cloned().collect();
        for session in sessions {
            session.mark_stopped();
            if let Err(e) = session.handle().stop() {
                log::warn!("stopping session {} failed: {}", session.id(), e);
            }
        }
    }
}

fn deliver<F>(session: &Arc<Session>, text: &str, on_session: F) -> Result<(), SessionError>
where
    F: FnOnce(&Arc<Session>),
{
    on_session(session);
    match session.handle().send(text) {
        Ok(()) => {
            session.set_last_error(None);
            Ok(())
        }
        Err(e) => {
            if matches!(e, HandleError::Closed) {
                session.mark_stopped();
            }
            session.set_last_error(Some(e.to_string()));
            Err(SessionError::Send {
                session_id: session.id().to_string(),
                source: e,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{event_channel, EventSink, EventStream, HandleMode};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeHandle {
        session_id: SessionId,
        sent: Mutex<Vec<String>>,
        stops: AtomicUsize,
        retired: AtomicBool,
        finished: AtomicBool,
        fail_with: Option<i32>,
        delay: Duration,
        sink: EventSink,
        events: EventStream,
    }

    impl ProcessHandle for FakeHandle {
        fn session_id(&self) -> &SessionId {
            &self.session_id
        }

        fn mode(&self) -> HandleMode {
            HandleMode::Exec
        }

        fn send(&self, text: &str) -> Result<(), HandleError> {
            self.sent.lock().unwrap().push(format!("{} start", text));
            std::thread::sleep(self.delay);
            self.sent.lock().unwrap().push(format!("{} end", text));
            match self.fail_with {
                Some(code) => Err(HandleError::Exited { code }),
                None => Ok(()),
            }
        }

        fn retire(&self) {
            self.retired.store(true, Ordering::SeqCst);
        }

        fn stop(&self) -> Result<(), HandleError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn events(&self) -> EventStream {
            self.events.clone()
        }

        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.sink.close();
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        created: Mutex<Vec<Arc<FakeHandle>>>,
        fail_start: AtomicBool,
        fail_send_with: Option<i32>,
        delay: Duration,
    }

    impl FakeBackend {
        fn handles(&self) -> Vec<Arc<FakeHandle>> {
            self.created.lock().unwrap().clone()
        }
    }

    impl SessionBackend for FakeBackend {
        fn start(&self, session_id: &SessionId) -> Result<Arc<dyn ProcessHandle>, HandleError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(HandleError::Spawn {
                    pty: Some("denied".to_string()),
                    pipe: "not found".to_string(),
                });
            }
            // Make the race window for concurrent creation wide.
            std::thread::sleep(Duration::from_millis(5));
            let (sink, events) = event_channel();
            let handle = Arc::new(FakeHandle {
                session_id: session_id.clone(),
                sent: Mutex::new(Vec::new()),
                stops: AtomicUsize::new(0),
                retired: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                fail_with: self.fail_send_with,
                delay: self.delay,
                sink,
                events,
            });
            self.created.lock().unwrap().push(Arc::clone(&handle));
            Ok(handle as Arc<dyn ProcessHandle>)
        }
    }

    fn conv(id: &str) -> ConversationId {
        ConversationId::from(id)
    }

    fn manager(backend: &Arc<FakeBackend>) -> SessionManager {
        SessionManager::new(Arc::clone(backend) as Arc<dyn SessionBackend>)
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn get_or_create_reuses_session() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);

            let a = manager.get_or_create(&conv("1")).unwrap();
            let b = manager.get_or_create(&conv("1")).unwrap();
            assert!(Arc::ptr_eq(&a, &b));
            assert!(!a.id().is_fresh());
            assert_eq!(backend.handles().len(), 1);
        }

        #[test]
        fn conversations_are_independent() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);

            let a = manager.get_or_create(&conv("1")).unwrap();
            let b = manager.get_or_create(&conv("2")).unwrap();
            assert!(!Arc::ptr_eq(&a, &b));
            assert_eq!(backend.handles().len(), 2);
        }

        #[test]
        fn concurrent_first_use_creates_one_session() {
            let backend = Arc::new(FakeBackend::default());
            let manager = Arc::new(manager(&backend));

            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    std::thread::spawn(move || manager.get_or_create(&conv("1")).unwrap())
                })
                .collect();
            let sessions: Vec<Arc<Session>> =
                threads.into_iter().map(|t| t.join().unwrap()).collect();

            assert_eq!(backend.handles().len(), 1);
            assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        }

        #[test]
        fn new_fresh_replaces_and_stops_previous() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);

            let old = manager.get_or_create(&conv("1")).unwrap();
            let fresh = manager.new_fresh(&conv("1")).unwrap();

            assert!(fresh.id().is_fresh());
            assert!(!old.is_running());
            assert!(fresh.is_running());
            assert!(Arc::ptr_eq(&manager.current(&conv("1")).unwrap(), &fresh));

            let handles = backend.handles();
            assert_eq!(handles[0].stops.load(Ordering::SeqCst), 1);
            assert_eq!(handles[1].stops.load(Ordering::SeqCst), 0);
            assert!(handles[0].retired.load(Ordering::SeqCst));
            assert!(!handles[1].retired.load(Ordering::SeqCst));
        }

        #[test]
        fn new_resume_is_not_fresh() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);
            let session = manager.new_resume(&conv("1")).unwrap();
            assert!(!session.id().is_fresh());
        }

        #[test]
        fn start_failure_installs_nothing() {
            let backend = Arc::new(FakeBackend::default());
            backend.fail_start.store(true, Ordering::SeqCst);
            let manager = manager(&backend);

            let err = manager.get_or_create(&conv("1")).unwrap_err();
            assert!(matches!(err, SessionError::Start(_)));
            assert!(manager.current(&conv("1")).is_none());
            assert!(manager.status(&conv("1")).is_none());
        }

        #[test]
        fn stop_all_stops_every_session() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);
            manager.get_or_create(&conv("1")).unwrap();
            manager.get_or_create(&conv("2")).unwrap();

            manager.stop_all();
            assert!(backend
                .handles()
                .iter()
                .all(|h| h.stops.load(Ordering::SeqCst) == 1));
            assert!(!manager.status(&conv("1")).unwrap().running);
        }
    }

    mod sending {
        use super::*;

        #[test]
        fn send_creates_session_and_delivers() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);

            let mut seen = None;
            manager
                .send_with(&conv("1"), "hi", |s| seen = Some(s.id().clone()))
                .unwrap();

            let handles = backend.handles();
            assert_eq!(handles.len(), 1);
            assert_eq!(*handles[0].sent.lock().unwrap(), vec!["hi start", "hi end"]);
            assert_eq!(seen.as_ref(), Some(&handles[0].session_id));
        }

        #[test]
        fn stopped_session_is_replaced_before_delivery() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);

            let first = manager.get_or_create(&conv("1")).unwrap();
            first.mark_stopped();
            manager.send(&conv("1"), "again").unwrap();

            let handles = backend.handles();
            assert_eq!(handles.len(), 2);
            assert!(handles[0].sent.lock().unwrap().is_empty());
            assert_eq!(handles[1].sent.lock().unwrap().len(), 2);
            assert!(!handles[1].session_id.is_fresh());
        }

        #[test]
        fn finished_handle_is_replaced() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);

            manager.get_or_create(&conv("1")).unwrap();
            backend.handles()[0].finished.store(true, Ordering::SeqCst);
            manager.send(&conv("1"), "x").unwrap();
            assert_eq!(backend.handles().len(), 2);
        }

        #[test]
        fn sends_to_one_session_never_interleave() {
            let backend = Arc::new(FakeBackend {
                delay: Duration::from_millis(20),
                ..FakeBackend::default()
            });
            let manager = Arc::new(manager(&backend));

            let threads: Vec<_> = (0..4)
                .map(|i| {
                    let manager = Arc::clone(&manager);
                    std::thread::spawn(move || manager.send(&conv("1"), &format!("m{}", i)).unwrap())
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }

            let sent = backend.handles()[0].sent.lock().unwrap().clone();
            assert_eq!(sent.len(), 8);
            for pair in sent.chunks(2) {
                let name = pair[0].trim_end_matches(" start");
                assert_eq!(pair[1], format!("{} end", name));
            }
        }

        #[test]
        fn send_error_is_recorded_in_status() {
            let backend = Arc::new(FakeBackend {
                fail_send_with: Some(3),
                ..FakeBackend::default()
            });
            let manager = manager(&backend);

            let err = manager.send(&conv("1"), "x").unwrap_err();
            assert!(matches!(
                err,
                SessionError::Send {
                    source: HandleError::Exited { code: 3 },
                    ..
                }
            ));

            let status = manager.status(&conv("1")).unwrap();
            assert!(status.running);
            assert_eq!(status.last_error.as_deref(), Some("agent exited with code 3"));
        }
    }

    mod cancel {
        use super::*;

        #[test]
        fn cancel_without_session_is_noop() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);
            assert!(manager.cancel(&conv("1")).is_ok());
            assert!(backend.handles().is_empty());
        }

        #[test]
        fn cancel_stops_current_handle() {
            let backend = Arc::new(FakeBackend::default());
            let manager = manager(&backend);
            manager.get_or_create(&conv("1")).unwrap();

            manager.cancel(&conv("1")).unwrap();
            assert_eq!(backend.handles()[0].stops.load(Ordering::SeqCst), 1);
            // Cancel interrupts work but keeps the Session installed.
            assert!(manager.status(&conv("1")).unwrap().running);
        }
    }

    #[cfg(unix)]
    mod superseded {
        use super::*;
        use crate::agents::codex::CodexExecConfig;
        use crate::agents::EventKind;
        use crate::logging::Transcript;
        use crate::persistence::ThreadStore;
        use crate::process::{platform_interrupter, ExecContext, ExecHandle};
        use std::path::Path;
        use std::time::Instant;
        use tempfile::tempdir;

        struct ExecBackend {
            context: ExecContext,
        }

        impl SessionBackend for ExecBackend {
            fn start(&self, session_id: &SessionId) -> Result<Arc<dyn ProcessHandle>, HandleError> {
                Ok(Arc::new(ExecHandle::start(
                    session_id.clone(),
                    self.context.clone(),
                    Transcript::disabled(),
                )))
            }
        }

        /// A "slow" turn ignores SIGINT and reports its thread late; any
        /// other turn reports T_NEW and echoes its argv.
        fn exec_manager(dir: &Path, threads: Arc<ThreadStore>) -> SessionManager {
            let ready = dir.join("ready");
            let body = format!(
                r#"case "$*" in
*slow*)
  trap '' INT
  touch '{ready}'
  sleep 0.5
  echo '{{"type":"thread.started","thread_id":"T_OLD"}}'
  ;;
*)
  echo '{{"type":"thread.started","thread_id":"T_NEW"}}'
  printf '{{"type":"item.completed","item":{{"type":"agent_message","text":"%s"}}}}\n' "$*"
  ;;
esac
"#,
                ready = ready.display()
            );
            let script = dir.join("agent.sh");
            std::fs::write(&script, body).unwrap();

            let context = ExecContext {
                config: CodexExecConfig {
                    binary_path: "/bin/sh".to_string(),
                    global_args: vec![script.to_string_lossy().into_owned()],
                    skip_git_repo_check: false,
                    working_dir: Some(dir.to_string_lossy().into_owned()),
                    shell_prefix: None,
                },
                threads,
                compactor: None,
                interrupter: Arc::from(platform_interrupter()),
            };
            SessionManager::new(Arc::new(ExecBackend { context }))
        }

        #[test]
        fn late_thread_from_replaced_turn_is_not_adopted() {
            let dir = tempdir().unwrap();
            let threads = Arc::new(ThreadStore::in_memory());
            let manager = Arc::new(exec_manager(dir.path(), Arc::clone(&threads)));

            let old_turn = {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || manager.send(&conv("1"), "slow"))
            };
            let deadline = Instant::now() + Duration::from_secs(5);
            while !dir.path().join("ready").exists() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }

            let fresh = manager.new_fresh(&conv("1")).unwrap();
            assert!(threads.get(&conv("1")).is_none());

            // The old process ignores the interrupt and still prints its thread.
            let _ = old_turn.join().unwrap();
            assert!(threads.get(&conv("1")).is_none());

            manager.send(&conv("1"), "first fresh turn").unwrap();
            let stdout: Vec<String> = std::iter::from_fn(|| fresh.events().try_recv())
                .filter(|e| e.kind == EventKind::Stdout)
                .map(|e| e.text)
                .collect();
            assert_eq!(stdout, vec!["exec --json first fresh turn\n"]);
            assert_eq!(threads.get(&conv("1")).as_deref(), Some("T_NEW"));
        }
    }

    #[test]
    fn error_messages() {
        let err = SessionError::Send {
            session_id: "chat-1-2".to_string(),
            source: HandleError::Closed,
        };
        assert_eq!(err.to_string(), "send to chat-1-2 failed: agent input closed");
    }
}
