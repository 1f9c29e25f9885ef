//! Console rendering of agent events and memory.

use std::sync::OnceLock;

use regex::Regex;
use tether_core::{ChatMemory, Event, EventKind};

fn ansi_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").ok())
        .as_ref()
}

/// Remove CSI escape sequences (colors, cursor movement).
pub fn strip_ansi(text: &str) -> String {
    match ansi_re() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Console text for an event; `None` when nothing is left to show.
pub fn render_event(event: &Event) -> Option<String> {
    let text = strip_ansi(&event.text);
    let rendered = match event.kind {
        EventKind::Stdout => text,
        EventKind::Stderr => {
            if text.trim().is_empty() {
                return None;
            }
            format!("[stderr] {}", with_newline(text))
        }
        EventKind::Status => format!("[status] {}", with_newline(text)),
        EventKind::Exit => format!("[exit code {}]\n", event.code),
    };
    (!rendered.is_empty()).then_some(rendered)
}

fn with_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Prepend the rendered memory to a prompt.
pub fn with_memory_prefix(prefix: Option<String>, prompt: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}{}", prefix, prompt),
        None => prompt.to_string(),
    }
}

/// `/memory` output.
pub fn memory_report(memory: &ChatMemory) -> String {
    let mut out = String::new();

    let summary = memory.summary.trim();
    out.push_str("summary: ");
    out.push_str(if summary.is_empty() { "(none)" } else { summary });
    out.push('\n');

    push_list(&mut out, "rules", &memory.rules);
    push_list(&mut out, "preferences", &memory.prefs);

    out.push_str(&format!(
        "since last compaction: {} tokens, {} turns\n",
        memory.tokens_since_compact, memory.turns_since_compact
    ));
    if let Some(at) = memory.compacted_at {
        out.push_str(&format!("last compacted: {}\n", at.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    out
}

/// `/memory ideas` output.
pub fn ideas_report(memory: &ChatMemory) -> String {
    if memory.skill_ideas.is_empty() {
        return "no skill ideas yet\n".to_string();
    }
    let mut out = String::from("ideas worth capturing as skills:\n");
    for idea in &memory.skill_ideas {
        out.push_str("- ");
        out.push_str(idea);
        out.push('\n');
    }
    out
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        out.push_str(&format!("{}: (none)\n", title));
        return;
    }
    out.push_str(&format!("{}:\n", title));
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod events {
        use super::*;

        #[test]
        fn strips_colors() {
            assert_eq!(strip_ansi("\x1b[1;31merror\x1b[0m done"), "error done");
            assert_eq!(strip_ansi("\x1b[?25lhidden"), "hidden");
        }

        #[test]
        fn renders_each_kind() {
            assert_eq!(render_event(&Event::stdout("hi\n")).as_deref(), Some("hi\n"));
            assert_eq!(
                render_event(&Event::stderr("oops")).as_deref(),
                Some("[stderr] oops\n")
            );
            assert_eq!(
                render_event(&Event::status("started mode=exec")).as_deref(),
                Some("[status] started mode=exec\n")
            );
            assert_eq!(
                render_event(&Event::exit(2, "process exited")).as_deref(),
                Some("[exit code 2]\n")
            );
        }

        #[test]
        fn skips_empty_output() {
            assert!(render_event(&Event::stdout("\x1b[2J")).is_none());
            assert!(render_event(&Event::stderr("  \n")).is_none());
        }
    }

    mod memory {
        use super::*;

        #[test]
        fn prefix_is_prepended() {
            assert_eq!(with_memory_prefix(None, "hi"), "hi");
            assert_eq!(
                with_memory_prefix(Some("Conversation summary:\nx\n\n".to_string()), "hi"),
                "Conversation summary:\nx\n\nhi"
            );
        }

        #[test]
        fn report_lists_sections() {
            let memory = ChatMemory {
                summary: "building a bot".to_string(),
                rules: vec!["answer briefly".to_string()],
                tokens_since_compact: 1200,
                turns_since_compact: 3,
                ..ChatMemory::default()
            };
            let report = memory_report(&memory);
            assert!(report.starts_with("summary: building a bot\n"));
            assert!(report.contains("rules:\n- answer briefly\n"));
            assert!(report.contains("preferences: (none)\n"));
            assert!(report.contains("1200 tokens, 3 turns"));
            assert!(!report.contains("last compacted"));
        }

        #[test]
        fn ideas() {
            assert_eq!(ideas_report(&ChatMemory::default()), "no skill ideas yet\n");
            let memory = ChatMemory {
                skill_ideas: vec!["release checklist".to_string()],
                ..ChatMemory::default()
            };
            assert_eq!(
                ideas_report(&memory),
                "ideas worth capturing as skills:\n- release checklist\n"
            );
        }
    }
}
