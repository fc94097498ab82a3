//! Folding inbound fragments into a conversation's message list.
//!
//! The server streams an assistant reply as many fragments sharing one id,
//! followed by a content-less completion marker. Users' own messages are
//! rendered optimistically and come back from the server as echoes, which
//! must not show up twice.
//!
//! [`reconcile`] is pure: it never looks at the "assistant is responding"
//! flag, it only reports how the flag should change. Applying the same
//! completion marker twice is harmless.

use relay_core::types::{Message, MessageFragment, MessageId, Role};

/// What a fragment did to the message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Appended(MessageId),
    Updated(MessageId),
    Completed(MessageId),
    EchoSuppressed(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub change: Change,
    /// New value for the responding indicator, `None` to leave it alone.
    pub assistant_responding: Option<bool>,
}

impl Reconciliation {
    fn new(change: Change, assistant_responding: Option<bool>) -> Self {
        Self {
            change,
            assistant_responding,
        }
    }
}

/// Apply one fragment to `messages`.
///
/// `echo_window_ms` is the largest timestamp distance, inclusive, at which a
/// USER fragment with identical content counts as the echo of a message
/// already shown.
pub fn reconcile(
    messages: &mut Vec<Message>,
    fragment: MessageFragment,
    echo_window_ms: i64,
) -> Reconciliation {
    match fragment.role {
        Role::Assistant => reconcile_assistant(messages, fragment),
        Role::User => reconcile_user(messages, fragment, echo_window_ms),
        Role::System => {
            let failed_reply = fragment.is_error;
            let id = fragment.id.clone();
            messages.push(Message::from(fragment));
            Reconciliation::new(Change::Appended(id), failed_reply.then_some(false))
        }
    }
}

fn reconcile_assistant(messages: &mut Vec<Message>, fragment: MessageFragment) -> Reconciliation {
    let existing = messages.iter().rposition(|m| m.id == fragment.id);

    let Some(index) = existing else {
        // Only one reply streams at a time.
        for open in messages.iter_mut().filter(|m| m.streaming) {
            open.streaming = false;
        }
        let id = fragment.id.clone();
        let mut message = Message::from(fragment);
        message.streaming = true;
        messages.push(message);
        return Reconciliation::new(Change::Appended(id), Some(false));
    };

    // A later reply has opened; this one may gain content but never streams again.
    let superseded = messages[index + 1..]
        .iter()
        .any(|m| m.role == Role::Assistant);

    let message = &mut messages[index];
    if fragment.is_completion_signal() {
        message.streaming = false;
        let responding = if superseded { None } else { Some(false) };
        return Reconciliation::new(Change::Completed(message.id.clone()), responding);
    }

    let no_content = fragment.content.is_empty();
    message.content.push_str(&fragment.content);
    message.streaming = fragment.streaming && !superseded;
    message.timestamp = fragment.timestamp;
    if fragment.is_error {
        message.is_error = true;
    }
    if fragment.image_url.is_some() {
        message.image_url = fragment.image_url;
    }

    let id = message.id.clone();
    if superseded {
        Reconciliation::new(Change::Updated(id), None)
    } else if !message.streaming {
        Reconciliation::new(Change::Completed(id), Some(false))
    } else if no_content {
        Reconciliation::new(Change::Updated(id), Some(false))
    } else {
        Reconciliation::new(Change::Updated(id), None)
    }
}

fn reconcile_user(
    messages: &mut Vec<Message>,
    fragment: MessageFragment,
    echo_window_ms: i64,
) -> Reconciliation {
    let echo_of = messages.iter().find(|m| {
        m.role == Role::User
            && m.content == fragment.content
            && m.timestamp.millis_between(&fragment.timestamp) <= echo_window_ms
    });
    if let Some(original) = echo_of {
        return Reconciliation::new(Change::EchoSuppressed(original.id.clone()), None);
    }

    let id = fragment.id.clone();
    messages.push(Message::from(fragment));
    Reconciliation::new(Change::Appended(id), None)
}
