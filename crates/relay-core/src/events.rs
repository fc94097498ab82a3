use serde::{Deserialize, Serialize};

use crate::types::{ConnectionState, ConversationId, MessageId};

/// Observable changes to the synchronization engine's read model.
///
/// Emitted on a broadcast channel after each state change so a front end can
/// re-read the store instead of polling. Events carry identifiers only; the
/// store remains the source of truth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SyncEvent {
    // =========================================================================
    // Transport
    // =========================================================================
    /// The transport connection changed state.
    ConnectionChanged { state: ConnectionState },

    // =========================================================================
    // Messages
    // =========================================================================
    /// A new message was appended to a conversation.
    MessageAppended {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// A streaming message received more content.
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// A streaming message was finalized.
    MessageCompleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// An optimistic message could not be delivered.
    MessageFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// A server echo of a local message was discarded.
    EchoSuppressed {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    // =========================================================================
    // Sessions
    // =========================================================================
    /// The conversation's history was reloaded wholesale.
    HistoryReplaced {
        conversation_id: ConversationId,
        message_count: usize,
    },

    /// The "assistant is composing" indicator flipped.
    AssistantResponding {
        conversation_id: ConversationId,
        responding: bool,
    },

    /// A session was dropped because its conversation was deleted.
    SessionEvicted { conversation_id: ConversationId },
}

impl SyncEvent {
    /// The conversation this event concerns, if any.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            SyncEvent::ConnectionChanged { .. } => None,
            SyncEvent::MessageAppended {
                conversation_id, ..
            }
            | SyncEvent::MessageUpdated {
                conversation_id, ..
            }
            | SyncEvent::MessageCompleted {
                conversation_id, ..
            }
            | SyncEvent::MessageFailed {
                conversation_id, ..
            }
            | SyncEvent::EchoSuppressed {
                conversation_id, ..
            }
            | SyncEvent::HistoryReplaced {
                conversation_id, ..
            }
            | SyncEvent::AssistantResponding {
                conversation_id, ..
            }
            | SyncEvent::SessionEvicted { conversation_id } => Some(conversation_id),
        }
    }

    /// Returns a human-readable event name for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            SyncEvent::ConnectionChanged { .. } => "connection_changed",
            SyncEvent::MessageAppended { .. } => "message_appended",
            SyncEvent::MessageUpdated { .. } => "message_updated",
            SyncEvent::MessageCompleted { .. } => "message_completed",
            SyncEvent::MessageFailed { .. } => "message_failed",
            SyncEvent::EchoSuppressed { .. } => "echo_suppressed",
            SyncEvent::HistoryReplaced { .. } => "history_replaced",
            SyncEvent::AssistantResponding { .. } => "assistant_responding",
            SyncEvent::SessionEvicted { .. } => "session_evicted",
        }
    }
}
