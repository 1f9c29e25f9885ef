//! Console input parsing.

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Message(String),
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New,
    Cancel,
    Status,
    Memory { ideas: bool },
    /// Switch conversation; `None` when the id is missing.
    Chat(Option<String>),
    Help,
    Quit,
    Unknown(String),
}

pub const HELP: &str = "\
/new            start a fresh conversation thread
/cancel         interrupt the running agent
/status         show session state
/memory [ideas] show conversation memory (or skill ideas)
/chat <id>      switch to another conversation
/help           show this help
/quit           stop all sessions and exit
";

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    let arg = parts.next();

    Input::Command(match name.as_str() {
        "new" => Command::New,
        "cancel" | "stop" => Command::Cancel,
        "status" => Command::Status,
        "memory" => Command::Memory {
            ideas: arg.is_some_and(|a| a.eq_ignore_ascii_case("ideas")),
        },
        "chat" => Command::Chat(arg.map(str::to_string)),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(name),
    })
}
