//! Sync engine: central coordinator wiring transport, subscriptions, the
//! session store, sends, and the history collaborator.
//!
//! Owns which conversations are wanted (subscribed whenever the link is up),
//! which one has focus, and the conversation directory. A watcher task
//! follows the connection: every time it comes up, wanted conversations are
//! re-subscribed and the focused history is reloaded to repair anything
//! missed while offline.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use relay_core::config::SyncConfig;
use relay_core::error::{RelayError, Result};
use relay_core::events::SyncEvent;
use relay_core::history::HistoryProvider;
use relay_core::types::{ConnectionState, ConversationId, ConversationSummary, MessageFragment};
use relay_transport::Connection;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::{FragmentHandler, SubscriptionRegistry};
use crate::send::{Publisher, SendCoordinator, SendOutcome};
use crate::store::SessionStore;

#[derive(Debug, Default)]
struct ViewState {
    /// Conversations that should be subscribed while connected.
    wanted: HashSet<ConversationId>,
    /// Lost focus with a reply still pending; released once idle.
    lingering: HashSet<ConversationId>,
    focused: Option<ConversationId>,
    directory: Vec<ConversationSummary>,
}

struct Shared {
    connection: Connection,
    registry: SubscriptionRegistry,
    store: Arc<SessionStore>,
    sender: SendCoordinator,
    history: Arc<dyn HistoryProvider>,
    view: Mutex<ViewState>,
}

impl Shared {
    fn view(&self) -> MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fragment_handler(self: &Arc<Self>) -> FragmentHandler {
        let shared = Arc::downgrade(self);
        Arc::new(move |conversation_id: &ConversationId, fragment: MessageFragment| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.store.apply_fragment(conversation_id, fragment);
            shared.release_if_lingering(conversation_id);
        })
    }

    fn subscribe(self: &Arc<Self>, conversation_id: &ConversationId) -> Result<()> {
        self.registry
            .ensure_subscribed(conversation_id, self.fragment_handler())
    }

    /// Unsubscribe a lingering conversation once nothing is pending.
    fn release_if_lingering(&self, conversation_id: &ConversationId) {
        let release = {
            let mut view = self.view();
            if view.lingering.contains(conversation_id) && self.store.is_idle(conversation_id) {
                view.lingering.remove(conversation_id);
                view.wanted.remove(conversation_id);
                true
            } else {
                false
            }
        };
        if release {
            debug!(conversation_id = %conversation_id, "Releasing idle conversation");
            self.registry.unsubscribe(conversation_id);
        }
    }

    async fn load_history(&self, conversation_id: &ConversationId) -> bool {
        match self.history.get_messages(conversation_id).await {
            Ok(messages) => {
                debug!(conversation_id = %conversation_id, count = messages.len(), "History loaded");
                self.store.replace_history(conversation_id, messages);
                true
            }
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "History load failed; continuing with live updates"
                );
                false
            }
        }
    }

    async fn on_connected(self: &Arc<Self>) {
        let (wanted, focused) = {
            let view = self.view();
            (
                view.wanted.iter().cloned().collect::<Vec<_>>(),
                view.focused.clone(),
            )
        };
        let mut repaired = Vec::new();
        for conversation_id in wanted {
            // Already subscribed on this link by an activation that ran first.
            if self.registry.is_current(&conversation_id) {
                continue;
            }
            match self.subscribe(&conversation_id) {
                Ok(()) => repaired.push(conversation_id),
                Err(e) => {
                    warn!(conversation_id = %conversation_id, error = %e, "Re-subscribe failed")
                }
            }
        }
        if !repaired.is_empty() {
            info!(count = repaired.len(), "Re-subscribed conversations");
        }
        // Anything sent while the focused conversation was unsubscribed is
        // only in durable history.
        if let Some(conversation_id) = focused.filter(|id| repaired.contains(id)) {
            self.load_history(&conversation_id).await;
        }
    }
}

async fn watch_connection(shared: Weak<Shared>, mut changes: watch::Receiver<ConnectionState>) {
    loop {
        let state = *changes.borrow_and_update();
        {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.store.emit(SyncEvent::ConnectionChanged { state });
            match state {
                ConnectionState::Connected => shared.on_connected().await,
                ConnectionState::Disconnected => shared.registry.unsubscribe_all(),
                ConnectionState::Connecting => {}
            }
        }
        if changes.changed().await.is_err() {
            return;
        }
    }
}

/// Lifetime-scoped synchronization context.
///
/// Create one per signed-in session, call [`SyncEngine::start`], and read the
/// state through [`SyncEngine::store`] or the event stream.
pub struct SyncEngine {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        connection: Connection,
        history: Arc<dyn HistoryProvider>,
        config: &SyncConfig,
    ) -> Self {
        let store = Arc::new(SessionStore::new(
            config.echo_window_ms,
            config.event_capacity,
        ));
        let publisher: Arc<dyn Publisher> = Arc::new(connection.clone());
        let sender = SendCoordinator::new(publisher, Arc::clone(&store), config.max_message_chars);
        Self {
            shared: Arc::new(Shared {
                registry: SubscriptionRegistry::new(connection.clone())
                    .with_server_offset(config.server_offset()),
                connection,
                store,
                sender,
                history,
                view: Mutex::new(ViewState::default()),
            }),
            watcher: Mutex::new(None),
        }
    }

    fn watcher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Read access
    // =========================================================================

    pub fn store(&self) -> &SessionStore {
        &self.shared.store
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.store.subscribe()
    }

    pub fn connection(&self) -> &Connection {
        &self.shared.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    pub fn focused(&self) -> Option<ConversationId> {
        self.shared.view().focused.clone()
    }

    pub fn directory(&self) -> Vec<ConversationSummary> {
        self.shared.view().directory.clone()
    }

    pub fn is_subscribed(&self, conversation_id: &ConversationId) -> bool {
        self.shared.registry.is_subscribed(conversation_id)
    }

    pub fn subscribed(&self) -> Vec<ConversationId> {
        self.shared.registry.subscribed()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start following the connection and connect.
    ///
    /// The watcher survives a failed connect, so a later successful
    /// [`Connection::connect`] still re-subscribes everything wanted.
    pub async fn start(&self) -> Result<()> {
        {
            let mut watcher = self.watcher();
            if watcher.is_none() {
                let changes = self.shared.connection.state_changes();
                *watcher = Some(tokio::spawn(watch_connection(
                    Arc::downgrade(&self.shared),
                    changes,
                )));
            }
        }
        self.shared.connection.connect().await?;
        info!("Sync engine started");
        Ok(())
    }

    /// Disconnect and drop every subscription.
    pub fn shutdown(&self) {
        if let Some(watcher) = self.watcher().take() {
            watcher.abort();
        }
        self.shared.registry.unsubscribe_all();
        self.shared.connection.disconnect();
        self.shared.store.emit(SyncEvent::ConnectionChanged {
            state: ConnectionState::Disconnected,
        });
        info!("Sync engine shut down");
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    /// Load a conversation's history and keep it live.
    ///
    /// A history failure is logged and live sync proceeds. While offline the
    /// conversation is subscribed as soon as the link comes up.
    pub async fn activate(&self, conversation_id: &ConversationId) -> Result<()> {
        self.shared.load_history(conversation_id).await;
        {
            let mut view = self.shared.view();
            view.wanted.insert(conversation_id.clone());
            view.lingering.remove(conversation_id);
        }
        if self.shared.connection.is_connected() {
            self.shared.subscribe(conversation_id)?;
        } else {
            debug!(conversation_id = %conversation_id, "Offline; subscribing on connect");
        }
        Ok(())
    }

    /// Make `conversation_id` the focused conversation.
    ///
    /// The previously focused one is deactivated right away when idle;
    /// otherwise it stays subscribed until its reply completes so the reply
    /// still lands in its session.
    pub async fn focus(&self, conversation_id: &ConversationId) -> Result<()> {
        let previous = self
            .shared
            .view()
            .focused
            .replace(conversation_id.clone());

        if let Some(previous) = previous.filter(|p| p != conversation_id) {
            if self.shared.store.is_idle(&previous) {
                self.deactivate(&previous);
            } else {
                debug!(conversation_id = %previous, "Reply pending; lingering");
                self.shared.view().lingering.insert(previous.clone());
                // The reply may have finished in between.
                self.shared.release_if_lingering(&previous);
            }
        }
        self.activate(conversation_id).await
    }

    /// Stop keeping a conversation live.
    pub fn deactivate(&self, conversation_id: &ConversationId) {
        {
            let mut view = self.shared.view();
            view.wanted.remove(conversation_id);
            view.lingering.remove(conversation_id);
            if view.focused.as_ref() == Some(conversation_id) {
                view.focused = None;
            }
        }
        self.shared.registry.unsubscribe(conversation_id);
    }

    /// Send a user message to a conversation.
    pub fn send(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        image_url: Option<String>,
    ) -> SendOutcome {
        self.shared.sender.send(conversation_id, content, image_url)
    }

    // =========================================================================
    // Directory
    // =========================================================================

    pub async fn refresh_directory(&self) -> Result<Vec<ConversationSummary>> {
        let listed = self.shared.history.list_conversations().await?;
        self.shared.view().directory = listed.clone();
        debug!(count = listed.len(), "Directory refreshed");
        Ok(listed)
    }

    /// Create a conversation and put it at the top of the directory.
    pub async fn create_conversation(&self) -> Result<ConversationId> {
        let created = self.shared.history.create_conversation().await?;
        let id = created.id.clone();
        self.shared.view().directory.insert(0, created);
        info!(conversation_id = %id, "Conversation created");
        Ok(id)
    }

    pub async fn rename_conversation(&self, conversation_id: &ConversationId, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(RelayError::History("title must not be empty".into()));
        }
        let updated = self.shared.history.update_title(conversation_id, title).await?;
        let mut view = self.shared.view();
        match view.directory.iter_mut().find(|c| &c.id == conversation_id) {
            Some(entry) => *entry = updated,
            None => view.directory.insert(0, updated),
        }
        Ok(())
    }

    /// Delete remotely, then forget everything about the conversation.
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        self.shared.history.delete_conversation(conversation_id).await?;
        self.deactivate(conversation_id);
        self.shared.store.evict(conversation_id);
        self.shared
            .view()
            .directory
            .retain(|c| &c.id != conversation_id);
        info!(conversation_id = %conversation_id, "Conversation deleted");
        Ok(())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher().take() {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.shared.view();
        f.debug_struct("SyncEngine")
            .field("connection", &self.shared.connection.state())
            .field("focused", &view.focused)
            .field("wanted", &view.wanted)
            .field("lingering", &view.lingering)
            .finish()
    }
}
