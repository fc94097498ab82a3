//! Terminal input commands and incremental transcript rendering.

use std::collections::HashMap;

use relay_core::events::SyncEvent;
use relay_core::types::{ConversationId, Message, MessageId, Role};

pub const HELP: &str = "\
commands:
  /list            list conversations
  /new             start a conversation
  /switch <id>     open another conversation
  /title <text>    rename the current conversation
  /delete          delete the current conversation
  /connect         retry the broker connection
  /help            show this help
  /quit            exit
anything else is sent as a message";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    List,
    New,
    Switch(ConversationId),
    Title(String),
    Delete,
    Connect,
    Help,
    Quit,
    /// A slash command that needs an argument it did not get, or is unknown.
    Invalid(String),
}

/// Parse a line of input; blank lines yield `None`.
pub fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Message(line.to_string()));
    };
    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let input = match (name, rest) {
        ("list", _) => Input::List,
        ("new", _) => Input::New,
        ("delete", _) => Input::Delete,
        ("connect", _) => Input::Connect,
        ("help", _) => Input::Help,
        ("quit" | "exit", _) => Input::Quit,
        ("switch", "") => Input::Invalid("usage: /switch <id>".into()),
        ("switch", id) => Input::Switch(ConversationId::new(id)),
        ("title", "") => Input::Invalid("usage: /title <text>".into()),
        ("title", title) => Input::Title(title.to_string()),
        (other, _) => Input::Invalid(format!("unknown command /{other} (try /help)")),
    };
    Some(input)
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

/// Turns sync events for the focused conversation into terminal output.
///
/// Streaming replies are printed as they grow: only the part of a message's
/// content not yet written is emitted for each update.
#[derive(Debug, Default)]
pub struct Transcript {
    printed: HashMap<MessageId, usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render `event` given the focused conversation's current messages.
    pub fn render(&mut self, event: &SyncEvent, messages: &[Message]) -> Option<String> {
        match event {
            SyncEvent::ConnectionChanged { state } => Some(format!("[{state}]\n")),
            SyncEvent::HistoryReplaced { .. } => Some(self.replay(messages)),
            SyncEvent::MessageAppended { message_id, .. }
            | SyncEvent::MessageUpdated { message_id, .. } => {
                let message = messages.iter().find(|m| &m.id == message_id)?;
                if message.role == Role::User && message.id.is_local() {
                    // Already on screen as typed.
                    self.printed.insert(message.id.clone(), message.content.len());
                    return None;
                }
                let mut out = self.advance(message);
                if !message.streaming {
                    out.push('\n');
                }
                Some(out).filter(|s| !s.is_empty())
            }
            SyncEvent::MessageCompleted { message_id, .. } => {
                let message = messages.iter().find(|m| &m.id == message_id)?;
                let mut out = self.advance(message);
                out.push('\n');
                Some(out)
            }
            SyncEvent::MessageFailed { .. } => Some("! message was not delivered\n".into()),
            _ => None,
        }
    }

    fn advance(&mut self, message: &Message) -> String {
        let written = self.printed.get(&message.id).copied();
        self.printed
            .insert(message.id.clone(), message.content.len());
        match written {
            None => format!("{}> {}", label(message.role), message.content),
            Some(n) => message.content.get(n..).unwrap_or_default().to_string(),
        }
    }

    fn replay(&mut self, messages: &[Message]) -> String {
        self.printed.clear();
        let mut out = String::new();
        for message in messages {
            out.push_str(&self.advance(message));
            if !message.streaming {
                out.push('\n');
            }
        }
        out
    }
}
