//! Slash Commands
//!
//! Commands are slash-prefixed messages (`/stop`, `/new`, `/help`) handled by
//! the agent loop instead of the model. Immediate commands run as soon as they
//! are consumed, even while a turn for the same session is in flight; the rest
//! are processed in order with the session's other messages.
//!
//! Adding a command takes a [`COMMANDS`] entry plus a handler in exactly one
//! of `AgentLoop::handle_immediate_command` or `AgentLoop::process_message`.

/// Definition of a slash command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandDef {
    pub name: &'static str,
    pub description: &'static str,
    /// Handled on arrival, bypassing per-session serialization
    pub immediate: bool,
}

pub const STOP: &str = "/stop";
pub const NEW: &str = "/new";
pub const HELP: &str = "/help";

/// Registry of all known commands
pub const COMMANDS: &[CommandDef] = &[
    CommandDef {
        name: STOP,
        description: "Stop the current task",
        immediate: true,
    },
    CommandDef {
        name: NEW,
        description: "Start a new conversation",
        immediate: false,
    },
    CommandDef {
        name: HELP,
        description: "Show available commands",
        immediate: false,
    },
];

/// Extract a slash command from message text.
///
/// Returns the lowercased first token (e.g. `"/stop"`) or `None` if the
/// trimmed text does not start with `/`.
pub fn parse_command(text: &str) -> Option<String> {
    let stripped = text.trim();
    if !stripped.starts_with('/') {
        return None;
    }
    stripped.split_whitespace().next().map(str::to_lowercase)
}

pub fn lookup(command: &str) -> Option<&'static CommandDef> {
    COMMANDS.iter().find(|def| def.name == command)
}

/// Unknown commands are not immediate.
pub fn is_immediate_command(command: &str) -> bool {
    lookup(command).is_some_and(|def| def.immediate)
}

/// Help text generated from the registry
pub fn help_text() -> String {
    let mut lines = vec!["🤖 Available commands:".to_string()];
    for def in COMMANDS {
        lines.push(format!("{} - {}", def.name, def.description));
    }
    lines.join("\n")
}
