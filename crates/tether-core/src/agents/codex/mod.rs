//! Codex `exec --json` protocol parser and spawn configuration.

mod parser;
pub mod spawn;
mod types;

pub use parser::{is_cosmetic_stderr, last_agent_message, parse_line, ExecLine, ExecParser};
pub use spawn::{
    assemble_global_args, detect_fixed_args, has_cd_flag, is_codex_binary, probe_fixed_args,
    CodexExecConfig,
};
pub use types::*;
