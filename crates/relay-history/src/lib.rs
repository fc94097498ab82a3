//! HTTP client for the chat server's conversation API.
//!
//! Implements [`HistoryProvider`] over the REST endpoints under `/api/chats`,
//! authenticating with the same session cookie as the WebSocket link.

use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use relay_core::config::HistoryConfig;
use relay_core::error::{RelayError, Result};
use relay_core::history::HistoryProvider;
use relay_core::types::{ConversationId, ConversationSummary, Message, MessageId, Role, Timestamp};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_TITLE: &str = "New Chat";

/// A conversation as the server describes it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatData {
    id: ConversationId,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    created_at: Option<serde_json::Value>,
    #[serde(default)]
    updated_at: Option<serde_json::Value>,
}

/// Server times are zone-less and in the server's own zone.
fn server_time(value: Option<&serde_json::Value>, offset: FixedOffset) -> Option<Timestamp> {
    value.and_then(|v| Timestamp::from_json_at(v, offset))
}

impl ChatData {
    fn into_summary(self, offset: FixedOffset) -> ConversationSummary {
        ConversationSummary {
            id: self.id,
            title: self
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            updated_at: server_time(self.updated_at.as_ref(), offset)
                .or_else(|| server_time(self.created_at.as_ref(), offset)),
        }
    }
}

/// A stored message. Durable history is never streaming.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageData {
    id: MessageId,
    #[serde(default)]
    chat_id: Option<ConversationId>,
    role: Role,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    created_at: Option<serde_json::Value>,
}

impl MessageData {
    fn into_message(self, conversation_id: &ConversationId, offset: FixedOffset) -> Message {
        Message {
            id: self.id,
            conversation_id: self.chat_id.unwrap_or_else(|| conversation_id.clone()),
            content: self.content.unwrap_or_default(),
            role: self.role,
            timestamp: server_time(self.created_at.as_ref(), offset).unwrap_or_default(),
            image_url: self.image_url,
            streaming: false,
            is_error: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct TitleUpdate<'a> {
    title: &'a str,
}

fn history_error(err: reqwest::Error) -> RelayError {
    RelayError::History(err.to_string())
}

/// [`HistoryProvider`] backed by the server's REST API.
#[derive(Debug, Clone)]
pub struct HttpHistory {
    client: Client,
    base_url: String,
    server_offset: FixedOffset,
}

impl HttpHistory {
    pub fn new(config: &HistoryConfig, session_cookie: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = session_cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| RelayError::Config(format!("invalid session cookie: {e}")))?;
            headers.insert(COOKIE, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()
            .map_err(history_error)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            server_offset: Utc.fix(),
        })
    }

    /// Read the server's zone-less times as local time at `offset`.
    pub fn with_server_offset(mut self, offset: FixedOffset) -> Self {
        self.server_offset = offset;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/chats{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(history_error)?;
        let status = response.status();
        if !status.is_success() {
            let url = response.url().to_string();
            return Err(RelayError::History(format!("{url} returned {status}")));
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .map_err(history_error)
    }
}

#[async_trait]
impl HistoryProvider for HttpHistory {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let chats: Vec<ChatData> = self.fetch(self.client.get(self.url(""))).await?;
        debug!(count = chats.len(), "Listed conversations");
        Ok(chats
            .into_iter()
            .map(|c| c.into_summary(self.server_offset))
            .collect())
    }

    async fn create_conversation(&self) -> Result<ConversationSummary> {
        let chat: ChatData = self.fetch(self.client.post(self.url(""))).await?;
        Ok(chat.into_summary(self.server_offset))
    }

    async fn get_messages(&self, id: &ConversationId) -> Result<Vec<Message>> {
        let url = self.url(&format!("/{id}/messages"));
        let messages: Vec<MessageData> = self.fetch(self.client.get(url)).await?;
        debug!(conversation_id = %id, count = messages.len(), "Fetched history");
        Ok(messages
            .into_iter()
            .map(|m| m.into_message(id, self.server_offset))
            .collect())
    }

    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<ConversationSummary> {
        let url = self.url(&format!("/{id}/title"));
        let chat: ChatData = self
            .fetch(self.client.put(url).json(&TitleUpdate { title }))
            .await?;
        Ok(chat.into_summary(self.server_offset))
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        let url = self.url(&format!("/{id}"));
        self.execute(self.client.delete(url)).await?;
        Ok(())
    }
}
