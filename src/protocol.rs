//! Line protocol
//!
//! Stateless helpers for the newline-delimited text protocol: command
//! detection and parsing, display line formatting and nickname validation.

use chrono::{DateTime, Local};

/// Prefix that marks a line as a command
pub const COMMAND_SIGIL: char = '/';

/// Longest nickname accepted, in characters
pub const MAX_NICKNAME_LEN: usize = 20;

/// First line a fresh connection sees
pub const WELCOME: &str =
    "You are in linechat. Use /nick <name>, /who, /msg <nick> <text>, /help, /quit.";
/// Reply to `/help`
pub const HELP: &str = "Use commands: /nick <name>, /who, /msg <nick> <text>, /quit";
pub const NICK_USAGE: &str = "Error usage: /nick <name>";
pub const MSG_USAGE: &str = "Error usage: /msg <nick> <text>";
pub const EMPTY_MESSAGE: &str = "Error empty message";
pub const UNKNOWN_COMMAND: &str = "Unknown command. Try /help";
pub const MESSAGE_TOO_LONG: &str = "Message is too long";
pub const BYE: &str = "Bye";
/// Written to a connection refused at admission
pub const SERVER_FULL: &str = "Error server is full, please try again later";

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    /// Lower-cased command name without the sigil (empty for non-commands)
    pub name: String,
    /// Whitespace-separated arguments after the name
    pub args: Vec<String>,
    /// The trimmed input line
    pub raw: String,
}

impl Command {
    /// Parse a line into a command
    ///
    /// Empty input and lines without the sigil give an empty name and no
    /// arguments.
    pub fn parse(line: &str) -> Self {
        let raw = line.trim();
        if raw.is_empty() || !is_command(raw) {
            return Self {
                raw: raw.to_string(),
                ..Self::default()
            };
        }

        let mut fields = raw.split_whitespace();
        let name = fields
            .next()
            .map(|first| first[COMMAND_SIGIL.len_utf8()..].to_lowercase())
            .unwrap_or_default();
        let args = fields.map(str::to_string).collect();

        Self {
            name,
            args,
            raw: raw.to_string(),
        }
    }

    /// Raw text following the command name and the first `skip` arguments,
    /// trimmed. Interior whitespace is preserved.
    pub fn rest(&self, skip: usize) -> &str {
        let mut rest = self.raw.as_str();
        for _ in 0..=skip {
            rest = rest.trim_start();
            match rest.find(char::is_whitespace) {
                Some(end) => rest = &rest[end..],
                None => return "",
            }
        }
        rest.trim()
    }
}

/// Does this line start with the command sigil?
pub fn is_command(line: &str) -> bool {
    line.starts_with(COMMAND_SIGIL)
}

/// 1-20 characters drawn from ASCII letters, digits, `_` and `-`
pub fn is_valid_nickname(nickname: &str) -> bool {
    let len = nickname.chars().count();
    (1..=MAX_NICKNAME_LEN).contains(&len)
        && nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn stamp(at: DateTime<Local>) -> String {
    at.format("%H:%M").to_string()
}

/// `[HH:MM] <nick>: <text>`
pub fn format_user_message(nickname: &str, text: &str) -> String {
    format!("[{}] {}: {}", stamp(Local::now()), nickname, text)
}

/// `[HH:MM] <text>`
pub fn format_system_message(text: &str) -> String {
    format!("[{}] {}", stamp(Local::now()), text)
}

/// `[HH:MM] (private) <from> -> <to>: <text>`
pub fn format_private_message(from: &str, to: &str, text: &str) -> String {
    format!(
        "[{}] (private) {} -> {}: {}",
        stamp(Local::now()),
        from,
        to,
        text
    )
}
