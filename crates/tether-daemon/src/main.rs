//! tether: console front-end for the tether session engine.
//!
//! Reads lines from stdin, sends them to the agent for the current
//! conversation and prints the agent's events as they arrive.

mod commands;
mod console;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tether_core::paths::expand_home;
use tether_core::{Adapter, BridgeConfig, ConversationId, Driver};
use tokio::sync::mpsc;

use crate::commands::parse_input;
use crate::console::{Console, Flow};

#[derive(Parser, Debug)]
#[command(name = "tether", about = "Chat with a local agent CLI from the console")]
struct Args {
    /// Conversation to start in.
    #[arg(long, default_value = "console")]
    conversation: String,

    /// Directory for state, memory and transcripts (overrides LOG_DIR).
    #[arg(long)]
    log_dir: Option<String>,

    /// Agent working directory (overrides WORKDIR).
    #[arg(long)]
    workdir: Option<String>,

    /// How to drive the agent (overrides CODEX_DRIVER).
    #[arg(long)]
    driver: Option<Driver>,

    /// Settings file to load before reading the environment.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(ref dir) = self.log_dir {
            config.log_dir = expand_home(dir);
        }
        if let Some(ref dir) = self.workdir {
            config.working_dir = Some(expand_home(dir).to_string_lossy().into_owned());
        }
        if let Some(driver) = self.driver {
            config.driver = driver;
        }
    }
}

fn load_env_file(path: Option<&PathBuf>) {
    let result = match path {
        Some(path) => dotenvy::from_path(path).map(|_| path.clone()),
        None => dotenvy::dotenv(),
    };
    match result {
        Ok(path) => log::info!("loaded settings from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => log::warn!("could not load settings file: {}", e),
    }
}

/// Stdin lines, read on a plain thread so shutdown never waits on a read.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    load_env_file(args.env_file.as_ref());

    let mut config = BridgeConfig::from_env();
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("tether: {}", e);
        return ExitCode::FAILURE;
    }

    let adapter = Arc::new(Adapter::new(&config));
    let mut console = Console::new(adapter, ConversationId::from(args.conversation.clone()));
    println!(
        "tether: {} via {} (conversation {}, /help for commands)",
        config.binary_path,
        config.driver,
        console.conversation()
    );

    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, stopping sessions");
                break;
            }
            line = lines.recv() => match line {
                Some(line) => {
                    if console.handle(parse_input(&line)) == Flow::Quit {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    console.shutdown();
    ExitCode::SUCCESS
}
