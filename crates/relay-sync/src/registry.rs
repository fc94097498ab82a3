//! At most one live topic subscription per conversation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{FixedOffset, Offset, Utc};
use relay_core::error::{RelayError, Result};
use relay_core::types::{ConversationId, MessageFragment, JOIN_DESTINATION};
use relay_transport::{Connection, Unsubscriber};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives every decoded fragment of a subscribed conversation, in order.
pub type FragmentHandler = Arc<dyn Fn(&ConversationId, MessageFragment) + Send + Sync>;

/// A live subscription and the task feeding its fragments to the handler.
/// Dropping it ends both.
struct SubscriptionHandle {
    link_epoch: u64,
    _unsubscriber: Unsubscriber,
    pump: JoinHandle<()>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

pub struct SubscriptionRegistry {
    connection: Connection,
    server_offset: FixedOffset,
    handles: Mutex<HashMap<ConversationId, SubscriptionHandle>>,
}

impl SubscriptionRegistry {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            server_offset: Utc.fix(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Read zone-less fragment timestamps as local time at `offset`.
    pub fn with_server_offset(mut self, offset: FixedOffset) -> Self {
        self.server_offset = offset;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationId, SubscriptionHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to a conversation's topic and announce the join.
    ///
    /// Any previous subscription for the same conversation is torn down
    /// first. Requires a live connection.
    pub fn ensure_subscribed(
        &self,
        conversation_id: &ConversationId,
        on_fragment: FragmentHandler,
    ) -> Result<()> {
        let previous = self.lock().remove(conversation_id);
        if previous.is_some() {
            debug!(conversation_id = %conversation_id, "Replacing subscription");
        }
        drop(previous);

        let topic = conversation_id.topic();
        let subscription = self.connection.subscribe(&topic)?;
        self.connection
            .publish(JOIN_DESTINATION, conversation_id.as_str())?;

        let link_epoch = subscription.link_epoch();
        let (mut deliveries, unsubscriber) = subscription.into_parts();
        let owner = conversation_id.clone();
        let server_offset = self.server_offset;
        let pump = tokio::spawn(async move {
            while let Some(body) = deliveries.recv().await {
                match MessageFragment::from_json(&body, server_offset) {
                    Ok(fragment) => on_fragment(&owner, fragment),
                    Err(e) => {
                        let err = RelayError::MalformedFragment(e.to_string());
                        warn!(conversation_id = %owner, error = %err, "Dropping fragment");
                    }
                }
            }
            debug!(conversation_id = %owner, "Subscription pump finished");
        });

        let replaced = self.lock().insert(
            conversation_id.clone(),
            SubscriptionHandle {
                link_epoch,
                _unsubscriber: unsubscriber,
                pump,
            },
        );
        drop(replaced);
        info!(conversation_id = %conversation_id, destination = %topic, "Subscribed to conversation");
        Ok(())
    }

    /// Stop receiving a conversation. No-op when not subscribed.
    pub fn unsubscribe(&self, conversation_id: &ConversationId) {
        let removed = self.lock().remove(conversation_id);
        if removed.is_some() {
            debug!(conversation_id = %conversation_id, "Unsubscribed from conversation");
        }
    }

    /// Drop every subscription, e.g. when the link went away.
    pub fn unsubscribe_all(&self) {
        let removed: Vec<SubscriptionHandle> = self.lock().drain().map(|(_, h)| h).collect();
        if !removed.is_empty() {
            debug!(count = removed.len(), "Dropped all subscriptions");
        }
    }

    pub fn is_subscribed(&self, conversation_id: &ConversationId) -> bool {
        self.lock().contains_key(conversation_id)
    }

    /// Subscribed on the link that is up right now, as opposed to a handle
    /// left over from a link that has since died.
    pub fn is_current(&self, conversation_id: &ConversationId) -> bool {
        if !self.connection.is_connected() {
            return false;
        }
        let epoch = self.connection.link_epoch();
        self.lock()
            .get(conversation_id)
            .is_some_and(|handle| handle.link_epoch == epoch)
    }

    pub fn subscribed(&self) -> Vec<ConversationId> {
        self.lock().keys().cloned().collect()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscribed", &self.subscribed())
            .finish()
    }
}
