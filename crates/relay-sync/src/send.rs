//! Outgoing user messages.
//!
//! A send is optimistic: the message is shown immediately with a local id and
//! the server's echo is later suppressed by the reconciler. Each conversation
//! has a single send slot; a second send while one is in flight is rejected,
//! not queued.

use std::sync::Arc;

use relay_core::error::{RelayError, Result};
use relay_core::types::{ConversationId, Message, MessageId, SendRequest, SEND_DESTINATION};
use relay_transport::Connection;
use tracing::{debug, info, warn};

use crate::store::SessionStore;

/// Where outgoing messages go.
pub trait Publisher: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Hand `payload` to the transport. Returning `Ok` does not mean the
    /// server accepted it.
    fn publish(&self, destination: &str, payload: &str) -> Result<()>;
}

impl Publisher for Connection {
    fn is_connected(&self) -> bool {
        Connection::is_connected(self)
    }

    fn publish(&self, destination: &str, payload: &str) -> Result<()> {
        Connection::publish(self, destination, payload).map_err(RelayError::from)
    }
}

/// Why a send was refused without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InFlight,
    NotConnected,
    Empty,
    TooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Published; the optimistic message carries this id.
    Sent(MessageId),
    /// The optimistic message was shown, then flagged as failed.
    Failed(MessageId),
    Rejected(Rejection),
}

/// Releases the conversation's send slot however the send ends.
struct SendSlot<'a> {
    store: &'a SessionStore,
    conversation_id: &'a ConversationId,
}

impl Drop for SendSlot<'_> {
    fn drop(&mut self) {
        self.store.finish_send(self.conversation_id);
    }
}

pub struct SendCoordinator {
    publisher: Arc<dyn Publisher>,
    store: Arc<SessionStore>,
    max_message_chars: usize,
}

impl SendCoordinator {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        store: Arc<SessionStore>,
        max_message_chars: usize,
    ) -> Self {
        Self {
            publisher,
            store,
            max_message_chars,
        }
    }

    pub fn send(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        image_url: Option<String>,
    ) -> SendOutcome {
        if content.trim().is_empty() && image_url.is_none() {
            return SendOutcome::Rejected(Rejection::Empty);
        }
        if content.chars().count() > self.max_message_chars {
            debug!(conversation_id = %conversation_id, "Message exceeds {} chars", self.max_message_chars);
            return SendOutcome::Rejected(Rejection::TooLong);
        }
        if !self.publisher.is_connected() {
            return SendOutcome::Rejected(Rejection::NotConnected);
        }
        if !self.store.try_begin_send(conversation_id) {
            debug!(conversation_id = %conversation_id, "Send already in flight");
            return SendOutcome::Rejected(Rejection::InFlight);
        }
        let _slot = SendSlot {
            store: &self.store,
            conversation_id,
        };

        let message = Message::local_user(conversation_id.clone(), content, image_url.clone());
        let message_id = message.id.clone();
        self.store.append_local(message);

        let request = SendRequest {
            conversation_id: conversation_id.clone(),
            content: content.to_string(),
            image_url,
        };
        // Raised before publishing so a fast reply cannot be overtaken.
        self.store.set_assistant_responding(conversation_id, true);
        let published = serde_json::to_string(&request)
            .map_err(RelayError::from)
            .and_then(|payload| self.publisher.publish(SEND_DESTINATION, &payload));

        match published {
            Ok(()) => {
                info!(conversation_id = %conversation_id, message_id = %message_id, "Message sent");
                SendOutcome::Sent(message_id)
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Send failed");
                self.store.mark_error(conversation_id, &message_id);
                self.store.set_assistant_responding(conversation_id, false);
                SendOutcome::Failed(message_id)
            }
        }
    }
}

impl std::fmt::Debug for SendCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendCoordinator")
            .field("max_message_chars", &self.max_message_chars)
            .finish()
    }
}
