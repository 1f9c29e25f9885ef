//! Console front-end: routes input lines to the session manager and pumps
//! agent events to stdout.

use std::io::Write;
use std::sync::Arc;
use std::thread;

use tether_core::session::SessionBackend;
use tether_core::{Adapter, ConversationId, Driver, Session, SessionManager};

use crate::commands::{Command, Input, HELP};
use crate::render::{ideas_report, memory_report, render_event, with_memory_prefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    adapter: Arc<Adapter>,
    manager: Arc<SessionManager>,
    conversation: ConversationId,
}

impl Console {
    pub fn new(adapter: Arc<Adapter>, conversation: ConversationId) -> Self {
        let backend: Arc<dyn SessionBackend> = adapter.clone();
        Self {
            manager: Arc::new(SessionManager::new(backend)),
            adapter,
            conversation,
        }
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn handle(&mut self, input: Input) -> Flow {
        match input {
            Input::Empty => Flow::Continue,
            Input::Message(text) => {
                self.send(text);
                Flow::Continue
            }
            Input::Command(command) => self.run(command),
        }
    }

    fn run(&mut self, command: Command) -> Flow {
        match command {
            Command::New => match self.manager.new_fresh(&self.conversation) {
                Ok(session) => {
                    attach_pump(&session);
                    say(&format!("new thread started ({})", session.id()));
                }
                Err(e) => say(&format!("error: {}", e)),
            },
            Command::Cancel => match self.manager.cancel(&self.conversation) {
                Ok(()) => say("cancel requested"),
                Err(e) => say(&format!("error: {}", e)),
            },
            Command::Status => say(&self.status_text()),
            Command::Memory { ideas } => match self.adapter.chat_memory(&self.conversation) {
                Some(memory) if ideas => print_block(&ideas_report(&memory)),
                Some(memory) => print_block(&memory_report(&memory)),
                None => say("memory is off (enable MEMORY_ENABLE with the exec driver)"),
            },
            Command::Chat(Some(id)) => {
                self.conversation = ConversationId::from(id);
                say(&format!("switched to conversation {}", self.conversation));
            }
            Command::Chat(None) => say("usage: /chat <id>"),
            Command::Help => print_block(HELP),
            Command::Quit => return Flow::Quit,
            Command::Unknown(name) => say(&format!("unknown command /{} (try /help)", name)),
        }
        Flow::Continue
    }

    fn status_text(&self) -> String {
        let mut text = format!("conversation={} driver={}", self.conversation, self.adapter.driver());
        match self.manager.status(&self.conversation) {
            Some(status) => text.push_str(&format!(" {}", status)),
            None => text.push_str(" session=none"),
        }
        if self.adapter.driver() == Driver::Exec {
            let thread = self.adapter.continuation(&self.conversation);
            text.push_str(&format!(" thread={}", thread.as_deref().unwrap_or("none")));
            if self.adapter.is_compacting(&self.conversation) {
                text.push_str(" compacting=true");
            }
        }
        text
    }

    /// The prompt with memory prepended when no continuation carries the
    /// conversation.
    fn prompt_for(&self, text: &str) -> String {
        if self.adapter.continuation(&self.conversation).is_some() {
            return text.to_string();
        }
        let prefix = self
            .adapter
            .chat_memory(&self.conversation)
            .and_then(|memory| memory.render_prefix());
        with_memory_prefix(prefix, text)
    }

    /// Deliver on a worker thread; exec sends block for the whole turn.
    fn send(&self, text: String) {
        let manager = Arc::clone(&self.manager);
        let conversation = self.conversation.clone();
        let prompt = self.prompt_for(&text);

        thread::spawn(move || {
            if let Err(e) = manager.send_with(&conversation, &prompt, attach_pump) {
                log::debug!("send for {} failed: {}", conversation, e);
                say(&format!("error: {}", e));
            }
        });
    }

    pub fn shutdown(&self) {
        self.manager.stop_all();
    }
}

/// Start printing a Session's events unless a pump is already attached.
fn attach_pump(session: &Arc<Session>) {
    let Some(consumer) = session.events().try_attach() else {
        return;
    };
    let session_id = session.id().to_string();
    thread::spawn(move || {
        for event in consumer {
            if let Some(text) = render_event(&event) {
                print_block(&text);
            }
        }
        log::debug!("event stream of {} ended", session_id);
    });
}

fn say(line: &str) {
    print_block(&format!("* {}\n", line));
}

fn print_block(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}
