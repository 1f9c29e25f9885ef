//! Adapter: turns a [`BridgeConfig`] into process handles.
//!
//! The driver is chosen once, at construction. Every handle created by one
//! adapter shares its stores, so tests can run several adapters side by side
//! without sharing state by accident.

use std::sync::Arc;

use crate::agents::codex::{assemble_global_args, probe_fixed_args, CodexExecConfig};
use crate::compaction::{Compactor, ExecCompactionRunner};
use crate::config::{BridgeConfig, Driver};
use crate::logging::Transcript;
use crate::paths::StatePaths;
use crate::persistence::{ChatMemory, MemoryStore, ThreadStore};
use crate::process::{
    platform_interrupter, EventStream, ExecContext, ExecHandle, HandleError, InteractiveConfig,
    InteractiveHandle, Interrupter, ProcessHandle,
};
use crate::session::{ConversationId, SessionBackend, SessionId};
use crate::spawn::SpawnConfig;

pub struct Adapter {
    driver: Driver,
    paths: StatePaths,
    /// Launch description for interactive sessions.
    interactive: SpawnConfig,
    exec: ExecContext,
    memory: Option<Arc<MemoryStore>>,
}

impl Adapter {
    /// Build an adapter, probing the agent's `--help` for cosmetic flags
    /// when enabled.
    pub fn new(config: &BridgeConfig) -> Self {
        let fixed = if config.detect_flags {
            probe_fixed_args(&config.binary_path)
        } else {
            Vec::new()
        };
        if !fixed.is_empty() {
            log::debug!("detected agent flags: {:?}", fixed);
        }
        let global_args = assemble_global_args(
            &config.binary_path,
            &fixed,
            &config.user_args,
            config.working_dir.as_deref(),
            config.enable_search,
        );
        Self::from_parts(
            config,
            global_args,
            Arc::from(platform_interrupter()),
        )
    }

    /// Build an adapter from already assembled global arguments.
    pub fn from_parts(
        config: &BridgeConfig,
        global_args: Vec<String>,
        interrupter: Arc<dyn Interrupter>,
    ) -> Self {
        let paths = StatePaths::new(&config.log_dir);
        let threads = Arc::new(ThreadStore::open(paths.state_file()));

        let exec_config = CodexExecConfig {
            binary_path: config.binary_path.clone(),
            global_args: global_args.clone(),
            skip_git_repo_check: config.skip_git_repo_check,
            working_dir: config.working_dir.clone(),
            shell_prefix: config.shell_prefix.clone(),
        };

        let memory = config
            .memory_active()
            .then(|| Arc::new(MemoryStore::open(paths.memory_file())));
        let compactor = memory.as_ref().map(|memory| {
            Compactor::new(
                Arc::clone(memory),
                Arc::clone(&threads),
                Arc::new(ExecCompactionRunner::new(
                    exec_config.clone(),
                    Arc::clone(&interrupter),
                )),
                config.compaction,
            )
        });

        let mut interactive = SpawnConfig::new(&config.binary_path, global_args);
        if let Some(ref dir) = config.working_dir {
            interactive = interactive.working_dir(dir);
        }
        if let Some(ref prefix) = config.shell_prefix {
            interactive = interactive.shell_prefix(prefix);
        }

        log::info!(
            "adapter ready: driver={} binary={} memory={}",
            config.driver,
            config.binary_path,
            memory.is_some()
        );

        Self {
            driver: config.driver,
            paths,
            interactive,
            exec: ExecContext {
                config: exec_config,
                threads,
                compactor,
                interrupter,
            },
            memory,
        }
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn threads(&self) -> &Arc<ThreadStore> {
        &self.exec.threads
    }

    /// The memory store; `None` unless memory is active.
    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    /// Memory record of a conversation, if memory is active.
    pub fn chat_memory(&self, conversation: &ConversationId) -> Option<ChatMemory> {
        self.memory.as_ref().map(|memory| memory.get(conversation))
    }

    /// Persisted continuation id of a conversation.
    pub fn continuation(&self, conversation: &ConversationId) -> Option<String> {
        self.exec.threads.get(conversation)
    }

    pub fn is_compacting(&self, conversation: &ConversationId) -> bool {
        self.exec
            .compactor
            .as_ref()
            .is_some_and(|c| c.is_compacting(conversation))
    }

    /// Start a resuming handle for a conversation.
    pub fn open(&self, conversation: &ConversationId) -> Result<Arc<dyn ProcessHandle>, HandleError> {
        self.start(&SessionId::new(conversation.clone(), false))
    }

    pub fn send(handle: &dyn ProcessHandle, text: &str) -> Result<(), HandleError> {
        handle.send(text)
    }

    pub fn stop(handle: &dyn ProcessHandle) -> Result<(), HandleError> {
        handle.stop()
    }

    pub fn events(handle: &dyn ProcessHandle) -> EventStream {
        handle.events()
    }

    fn transcript(&self, session_id: &SessionId) -> Transcript {
        Transcript::open(
            &self.paths.sessions_dir(),
            &self.paths.transcript_name(&session_id.to_string()),
        )
    }
}

impl SessionBackend for Adapter {
    fn start(&self, session_id: &SessionId) -> Result<Arc<dyn ProcessHandle>, HandleError> {
        let transcript = self.transcript(session_id);
        match self.driver {
            Driver::Exec => Ok(Arc::new(ExecHandle::start(
                session_id.clone(),
                self.exec.clone(),
                transcript,
            ))),
            Driver::Interactive => {
                let handle = InteractiveHandle::start(
                    session_id.clone(),
                    InteractiveConfig::new(self.interactive.clone(), transcript),
                    Arc::clone(&self.exec.interrupter),
                )?;
                Ok(Arc::new(handle))
            }
        }
    }
}
