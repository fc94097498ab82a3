//! Per-conversation read model.
//!
//! Readers get snapshots or a borrowed view; only this crate mutates. Every
//! visible change is announced as a [`SyncEvent`] after the lock is released.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use relay_core::events::SyncEvent;
use relay_core::types::{ConversationId, Message, MessageFragment, MessageId};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::reconciler::{reconcile, Change, Reconciliation};

/// Client-side state of one conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationSession {
    messages: Vec<Message>,
    assistant_responding: bool,
    send_in_flight: bool,
}

impl ConversationSession {
    fn is_idle(&self) -> bool {
        !self.assistant_responding
            && !self.send_in_flight
            && !self.messages.iter().any(|m| m.streaming)
    }
}

/// All sessions, keyed by conversation.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<HashMap<ConversationId, ConversationSession>>,
    events: broadcast::Sender<SyncEvent>,
    echo_window_ms: i64,
}

impl SessionStore {
    pub fn new(echo_window_ms: i64, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            sessions: Mutex::new(HashMap::new()),
            events,
            echo_window_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationId, ConversationSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        trace!(event = event.event_name(), "Sync event");
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Read model
    // =========================================================================

    /// Snapshot of a conversation's messages, oldest first.
    pub fn messages(&self, id: &ConversationId) -> Vec<Message> {
        self.with_messages(id, <[Message]>::to_vec)
    }

    /// Run `f` against the messages without copying them.
    pub fn with_messages<R>(&self, id: &ConversationId, f: impl FnOnce(&[Message]) -> R) -> R {
        let sessions = self.lock();
        match sessions.get(id) {
            Some(session) => f(&session.messages),
            None => f(&[]),
        }
    }

    pub fn assistant_responding(&self, id: &ConversationId) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|s| s.assistant_responding)
    }

    pub fn send_in_flight(&self, id: &ConversationId) -> bool {
        self.lock().get(id).is_some_and(|s| s.send_in_flight)
    }

    /// Nothing pending: no send in flight, no reply being composed.
    pub fn is_idle(&self, id: &ConversationId) -> bool {
        self.lock().get(id).map_or(true, ConversationSession::is_idle)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.lock().contains_key(id)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    pub(crate) fn apply_fragment(
        &self,
        id: &ConversationId,
        fragment: MessageFragment,
    ) -> Reconciliation {
        let (outcome, responding_changed) = {
            let mut sessions = self.lock();
            let session = sessions.entry(id.clone()).or_default();
            let outcome = reconcile(&mut session.messages, fragment, self.echo_window_ms);
            let responding_changed = match outcome.assistant_responding {
                Some(next) if next != session.assistant_responding => {
                    session.assistant_responding = next;
                    Some(next)
                }
                _ => None,
            };
            (outcome, responding_changed)
        };

        let conversation_id = id.clone();
        self.emit(match outcome.change.clone() {
            Change::Appended(message_id) => SyncEvent::MessageAppended {
                conversation_id,
                message_id,
            },
            Change::Updated(message_id) => SyncEvent::MessageUpdated {
                conversation_id,
                message_id,
            },
            Change::Completed(message_id) => SyncEvent::MessageCompleted {
                conversation_id,
                message_id,
            },
            Change::EchoSuppressed(message_id) => {
                debug!(conversation_id = %id, message_id = %message_id, "Echo suppressed");
                SyncEvent::EchoSuppressed {
                    conversation_id,
                    message_id,
                }
            }
        });
        if let Some(responding) = responding_changed {
            self.emit(SyncEvent::AssistantResponding {
                conversation_id: id.clone(),
                responding,
            });
        }
        outcome
    }

    /// Replace the message list wholesale with durable history.
    ///
    /// The responding flag follows whatever the history says is still
    /// streaming.
    pub(crate) fn replace_history(&self, id: &ConversationId, messages: Vec<Message>) {
        let message_count = messages.len();
        let responding_changed = {
            let mut sessions = self.lock();
            let session = sessions.entry(id.clone()).or_default();
            let responding = messages.iter().any(|m| m.streaming);
            session.messages = messages;
            let changed = responding != session.assistant_responding;
            session.assistant_responding = responding;
            changed.then_some(responding)
        };

        self.emit(SyncEvent::HistoryReplaced {
            conversation_id: id.clone(),
            message_count,
        });
        if let Some(responding) = responding_changed {
            self.emit(SyncEvent::AssistantResponding {
                conversation_id: id.clone(),
                responding,
            });
        }
    }

    pub(crate) fn append_local(&self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.clone();
        self.lock()
            .entry(conversation_id.clone())
            .or_default()
            .messages
            .push(message);
        self.emit(SyncEvent::MessageAppended {
            conversation_id,
            message_id,
        });
    }

    /// Flag a message as failed. Returns false when it no longer exists.
    pub(crate) fn mark_error(&self, id: &ConversationId, message_id: &MessageId) -> bool {
        let found = {
            let mut sessions = self.lock();
            sessions
                .get_mut(id)
                .and_then(|s| s.messages.iter_mut().rev().find(|m| &m.id == message_id))
                .map(|m| m.is_error = true)
                .is_some()
        };
        if found {
            self.emit(SyncEvent::MessageFailed {
                conversation_id: id.clone(),
                message_id: message_id.clone(),
            });
        }
        found
    }

    pub(crate) fn set_assistant_responding(&self, id: &ConversationId, responding: bool) {
        let changed = {
            let mut sessions = self.lock();
            let session = sessions.entry(id.clone()).or_default();
            let changed = session.assistant_responding != responding;
            session.assistant_responding = responding;
            changed
        };
        if changed {
            self.emit(SyncEvent::AssistantResponding {
                conversation_id: id.clone(),
                responding,
            });
        }
    }

    /// Claim the conversation's single send slot. False if already taken.
    pub(crate) fn try_begin_send(&self, id: &ConversationId) -> bool {
        let mut sessions = self.lock();
        let session = sessions.entry(id.clone()).or_default();
        if session.send_in_flight {
            return false;
        }
        session.send_in_flight = true;
        true
    }

    pub(crate) fn finish_send(&self, id: &ConversationId) {
        if let Some(session) = self.lock().get_mut(id) {
            session.send_in_flight = false;
        }
    }

    /// Drop a session entirely. Returns whether one existed.
    pub(crate) fn evict(&self, id: &ConversationId) -> bool {
        let existed = self.lock().remove(id).is_some();
        if existed {
            self.emit(SyncEvent::SessionEvicted {
                conversation_id: id.clone(),
            });
        }
        existed
    }
}
