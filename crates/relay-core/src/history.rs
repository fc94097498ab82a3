//! Contract of the history/CRUD collaborator.
//!
//! The durable store of conversations and messages lives behind a
//! request/response API owned by another service. The engine only consumes
//! it: on activation it reloads a conversation's history, and the directory
//! operations are forwarded as-is.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{RelayError, Result};
use crate::types::{ConversationId, ConversationSummary, Message, Timestamp};

/// Request/response access to stored conversations.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// All conversations visible to the current user, most recent first.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;

    async fn create_conversation(&self) -> Result<ConversationSummary>;

    /// The durable message history of one conversation, oldest first.
    async fn get_messages(&self, id: &ConversationId) -> Result<Vec<Message>>;

    async fn update_title(&self, id: &ConversationId, title: &str)
        -> Result<ConversationSummary>;

    async fn delete_conversation(&self, id: &ConversationId) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: Vec<ConversationSummary>,
    messages: HashMap<ConversationId, Vec<Message>>,
    next_id: u64,
    unavailable: bool,
}

/// In-process history provider.
///
/// Backs tests and offline runs of the client. Conversations get sequential
/// numeric ids, mirroring the server.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    state: Mutex<MemoryState>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a conversation with existing messages.
    pub fn with_conversation(
        self,
        id: ConversationId,
        title: &str,
        messages: Vec<Message>,
    ) -> Self {
        {
            let mut state = self.lock();
            state.conversations.insert(
                0,
                ConversationSummary {
                    id: id.clone(),
                    title: title.to_string(),
                    updated_at: Some(Timestamp::now()),
                },
            );
            state.messages.insert(id, messages);
        }
        self
    }

    /// Replace the stored history of a conversation.
    pub fn set_messages(&self, id: &ConversationId, messages: Vec<Message>) {
        self.lock().messages.insert(id.clone(), messages);
    }

    /// Make every call fail, simulating an unreachable service.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self.lock();
        if state.unavailable {
            return Err(RelayError::History("history service unavailable".into()));
        }
        Ok(state)
    }
}

fn not_found(id: &ConversationId) -> RelayError {
    RelayError::History(format!("conversation not found: {id}"))
}

#[async_trait]
impl HistoryProvider for MemoryHistory {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.available()?.conversations.clone())
    }

    async fn create_conversation(&self) -> Result<ConversationSummary> {
        let mut state = self.available()?;
        state.next_id += 1;
        let mut candidate = state.next_id;
        while state
            .conversations
            .iter()
            .any(|c| c.id.as_str() == candidate.to_string())
        {
            candidate += 1;
        }
        state.next_id = candidate;

        let summary = ConversationSummary {
            id: ConversationId::new(candidate.to_string()),
            title: "New Chat".to_string(),
            updated_at: Some(Timestamp::now()),
        };
        state.conversations.insert(0, summary.clone());
        state.messages.insert(summary.id.clone(), Vec::new());
        Ok(summary)
    }

    async fn get_messages(&self, id: &ConversationId) -> Result<Vec<Message>> {
        self.available()?
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn update_title(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<ConversationSummary> {
        let mut state = self.available()?;
        let summary = state
            .conversations
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| not_found(id))?;
        summary.title = title.to_string();
        summary.updated_at = Some(Timestamp::now());
        Ok(summary.clone())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        let mut state = self.available()?;
        let before = state.conversations.len();
        state.conversations.retain(|c| &c.id != id);
        if state.conversations.len() == before {
            return Err(not_found(id));
        }
        state.messages.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_list_and_delete() {
        let history = MemoryHistory::new();
        let first = history.create_conversation().await.unwrap();
        let second = history.create_conversation().await.unwrap();
        assert_ne!(first.id, second.id);

        let listed = history.list_conversations().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);

        history.delete_conversation(&first.id).await.unwrap();
        assert_eq!(history.list_conversations().await.unwrap().len(), 1);
        assert!(history.get_messages(&first.id).await.is_err());
    }

    #[tokio::test]
    async fn test_seeded_conversation_and_title() {
        let id = ConversationId::new("1");
        let history = MemoryHistory::new().with_conversation(
            id.clone(),
            "Seeded",
            vec![Message::local_user(id.clone(), "hello", None)],
        );
        assert_eq!(history.get_messages(&id).await.unwrap().len(), 1);

        let renamed = history.update_title(&id, "Renamed").await.unwrap();
        assert_eq!(renamed.title, "Renamed");

        // Sequential ids skip the seeded one.
        let created = history.create_conversation().await.unwrap();
        assert_eq!(created.id, ConversationId::new("2"));
    }

    #[tokio::test]
    async fn test_unknown_conversation_errors() {
        let history = MemoryHistory::new();
        let id = ConversationId::new("404");
        assert!(matches!(
            history.update_title(&id, "x").await,
            Err(RelayError::History(_))
        ));
        assert!(history.delete_conversation(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_service() {
        let history = MemoryHistory::new();
        history.set_unavailable(true);
        assert!(history.list_conversations().await.is_err());
        history.set_unavailable(false);
        assert!(history.list_conversations().await.is_ok());
    }
}
