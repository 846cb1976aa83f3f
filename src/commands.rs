//! Prefix command parsing.
//!
//! `<prefix><name> [arg]`, where `<name>` must follow the prefix directly and
//! match exactly. Anything else is not a command.

/// A recognised text command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Explicit channel id, when one parsed.
    Join(Option<u64>),
    Leave,
    Status,
}

impl Command {
    /// Parse message content. `None` for plain chat, a missing prefix, or an
    /// unknown command name.
    pub fn parse(prefix: &str, content: &str) -> Option<Self> {
        let rest = content.trim_end().strip_prefix(prefix)?;
        if rest.starts_with(char::is_whitespace) {
            return None;
        }

        let mut tokens = rest.split_whitespace();
        match tokens.next()? {
            "join" => Some(Command::Join(tokens.next().and_then(parse_channel_id))),
            "leave" => Some(Command::Leave),
            "status" => Some(Command::Status),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Join(_) => "join",
            Command::Leave => "leave",
            Command::Status => "status",
        }
    }
}

/// Channel ids are positive integers. `<#123>` mentions are accepted too.
fn parse_channel_id(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("<#")
        .and_then(|t| t.strip_suffix('>'))
        .unwrap_or(token);
    digits.parse::<u64>().ok().filter(|id| *id != 0)
}
