//! Self-contained backend for running the client without a server.
//!
//! An in-process broker answers every message with a streamed echo, the same
//! fragment sequence the chat server produces: the user's message echoed back,
//! the reply in word-sized chunks, then a completion marker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_core::history::MemoryHistory;
use relay_core::types::{
    ConversationId, MessageFragment, MessageId, Role, SendRequest, Timestamp, SEND_DESTINATION,
};
use relay_transport::{MemoryBroker, Published, Responder};
use tracing::warn;

/// Broker and history service for `--offline` runs.
pub fn backend() -> (MemoryBroker, MemoryHistory) {
    let broker = MemoryBroker::new();
    broker.set_responder(echo_assistant());
    let history = MemoryHistory::new().with_conversation(
        ConversationId::new("1"),
        "Offline chat",
        Vec::new(),
    );
    (broker, history)
}

/// A responder that streams `You said: <content>` back to the sender.
pub fn echo_assistant() -> Responder {
    let counter = Arc::new(AtomicU64::new(0));
    Arc::new(move |broker: &MemoryBroker, published: &Published| {
        if published.destination != SEND_DESTINATION {
            return;
        }
        let request: SendRequest = match serde_json::from_str(&published.body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Offline assistant ignored an unreadable request");
                return;
            }
        };
        let turn = counter.fetch_add(1, Ordering::Relaxed) + 1;
        for fragment in reply(&request, turn) {
            match serde_json::to_string(&fragment) {
                Ok(body) => {
                    broker.broadcast(&request.conversation_id.topic(), &body);
                }
                Err(e) => warn!(error = %e, "Offline assistant failed to encode a fragment"),
            }
        }
    })
}

fn reply(request: &SendRequest, turn: u64) -> Vec<MessageFragment> {
    let fragment = |id: String, role: Role, content: &str, streaming: bool| MessageFragment {
        id: MessageId::new(id),
        conversation_id: request.conversation_id.clone(),
        content: content.to_string(),
        role,
        timestamp: Timestamp::now(),
        image_url: None,
        streaming,
        is_error: false,
    };

    let reply_id = format!("offline-{turn}_ai");
    let text = format!("You said: {}", request.content);

    let mut fragments = vec![MessageFragment {
        image_url: request.image_url.clone(),
        ..fragment(format!("offline-{turn}"), Role::User, &request.content, false)
    }];
    fragments.extend(
        text.split_inclusive(' ')
            .map(|chunk| fragment(reply_id.clone(), Role::Assistant, chunk, true)),
    );
    fragments.push(fragment(reply_id, Role::Assistant, "", false));
    fragments
}
