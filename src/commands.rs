//! Slash-command parsing
//!
//! Only input starting with `/` is a command. The first whitespace token
//! is the case-insensitive name; the rest is the argument.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Refresh and list the catalog
    Models,
    /// Refresh and list resident models
    Loaded,
    /// Load by 1-based index or name; `None` when the argument is missing
    Load(Option<String>),
    /// Clear the rendered transcript only
    Clear,
    /// Clear the rendered transcript and the history store
    Reset,
    /// Preview stored turns
    History,
    Help,
    Unknown(String),
}

/// Parse a trimmed input line. `None` means it is a chat message.
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }

    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };

    let cmd = match name.to_lowercase().as_str() {
        "/models" => Command::Models,
        "/loaded" => Command::Loaded,
        "/load" => Command::Load(if rest.is_empty() { None } else { Some(rest.to_string()) }),
        "/clear" => Command::Clear,
        "/reset" => Command::Reset,
        "/history" => Command::History,
        "/help" => Command::Help,
        _ => Command::Unknown(name.to_string()),
    };
    Some(cmd)
}

pub const HELP_TEXT: &str = "\
Available commands:
- `/models` - list available models
- `/loaded` - list models currently in memory
- `/load <number|name>` - load a model by list number or name
- `/clear` - clear the screen (history is kept)
- `/reset` - clear the screen and conversation history
- `/history` - show a preview of the conversation history
- `/help` - show this help

Press Esc while a reply is streaming to stop it.";

pub fn unknown_notice(name: &str) -> String {
    format!("Unknown command: {}. Type /help for available commands.", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_not_a_command() {
        assert_eq!(parse("hello /models"), None);
        assert_eq!(parse("  what is 2/3?"), None);
    }

    #[test]
    fn test_case_insensitive_names() {
        assert_eq!(parse("/MODELS"), Some(Command::Models));
        assert_eq!(parse("/Loaded"), Some(Command::Loaded));
        assert_eq!(parse("  /help  "), Some(Command::Help));
    }

    #[test]
    fn test_load_argument() {
        assert_eq!(parse("/load 2"), Some(Command::Load(Some("2".into()))));
        assert_eq!(parse("/LOAD   llama3:8b "), Some(Command::Load(Some("llama3:8b".into()))));
        assert_eq!(parse("/load"), Some(Command::Load(None)));
    }

    #[test]
    fn test_unknown() {
        assert_eq!(parse("/frobnicate now"), Some(Command::Unknown("/frobnicate".into())));
        assert_eq!(
            unknown_notice("/frobnicate"),
            "Unknown command: /frobnicate. Type /help for available commands."
        );
    }
}
