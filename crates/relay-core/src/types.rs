use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Topic prefix for per-conversation broadcasts.
pub const TOPIC_PREFIX: &str = "/topic/chat/";

/// Application destination for outgoing user messages.
pub const SEND_DESTINATION: &str = "/app/chat.sendMessage";

/// Application destination for join notifications.
pub const JOIN_DESTINATION: &str = "/app/chat.join";

/// Prefix of locally generated optimistic message ids.
pub const LOCAL_ID_PREFIX: &str = "local-";

// =============================================================================
// Identifiers
// =============================================================================

/// Server-side ids arrive as JSON strings or integers depending on the
/// endpoint; both normalize to a string.
fn id_from_wire<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireId {
        Text(String),
        Number(i64),
    }

    Ok(match WireId::deserialize(deserializer)? {
        WireId::Text(text) => text,
        WireId::Number(number) => number.to_string(),
    })
}

/// Identifier of a conversation. Maps 1:1 to a broadcast topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Broadcast topic carrying this conversation's fragments.
    pub fn topic(&self) -> String {
        format!("{TOPIC_PREFIX}{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for ConversationId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for ConversationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        id_from_wire(deserializer).map(Self)
    }
}

/// Identifier of a logical message, stable across all of its fragments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh id for an optimistic local message.
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        id_from_wire(deserializer).map(Self)
    }
}

// =============================================================================
// Timestamp
// =============================================================================

/// A UTC instant with millisecond precision.
///
/// Deserializes from RFC 3339, from a zone-less local date-time (read as
/// UTC), or from integer epoch milliseconds. A server that stamps zone-less
/// times in its own zone needs [`Timestamp::parse_at`] with that zone's
/// offset, or its times land off by the offset and echo matching against
/// locally stamped messages fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Absolute distance between two instants in milliseconds.
    pub fn millis_between(&self, other: &Timestamp) -> i64 {
        (self.0 - other.0).num_milliseconds().abs()
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::parse_at(text, Utc.fix())
    }

    /// Parse RFC 3339, or a zone-less date-time taken as local time at
    /// `offset`.
    pub fn parse_at(text: &str, offset: FixedOffset) -> Option<Self> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(Self(dt.with_timezone(&Utc)));
        }
        let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        naive
            .and_local_timezone(offset)
            .single()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Decode a JSON timestamp, reading zone-less text at `offset`.
    pub fn from_json_at(value: &serde_json::Value, offset: FixedOffset) -> Option<Self> {
        match value {
            serde_json::Value::String(text) => Self::parse_at(text, offset),
            serde_json::Value::Number(n) => n.as_i64().map(Self::from_millis),
            _ => None,
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireTime {
            Text(String),
            Millis(i64),
        }

        match WireTime::deserialize(deserializer)? {
            WireTime::Millis(millis) => Ok(Self::from_millis(millis)),
            WireTime::Text(text) => Self::parse(&text).ok_or_else(|| {
                serde::de::Error::custom(format!("unrecognized timestamp: {text}"))
            }),
        }
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    #[serde(alias = "user")]
    User,
    #[serde(alias = "assistant")]
    Assistant,
    #[serde(alias = "system")]
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "USER"),
            Role::Assistant => write!(f, "ASSISTANT"),
            Role::System => write!(f, "SYSTEM"),
        }
    }
}

/// Lifecycle of the transport connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

// =============================================================================
// Wire and read-model structs
// =============================================================================

/// One wire-level chunk of a message, as broadcast on a conversation topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFragment {
    pub id: MessageId,
    #[serde(alias = "chatId")]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub content: String,
    pub role: Role,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// More fragments with this id will follow.
    #[serde(default, alias = "isStreaming")]
    pub streaming: bool,
    #[serde(default, alias = "error")]
    pub is_error: bool,
}

impl MessageFragment {
    /// Decode a fragment from the wire, reading a zone-less `timestamp` as
    /// the server's local time at `server_offset`.
    pub fn from_json(text: &str, server_offset: FixedOffset) -> serde_json::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let stamped = value
            .get("timestamp")
            .and_then(|t| Timestamp::from_json_at(t, server_offset));
        let mut fragment: MessageFragment = serde_json::from_value(value)?;
        if let Some(timestamp) = stamped {
            fragment.timestamp = timestamp;
        }
        Ok(fragment)
    }

    /// True for the dedicated end-of-stream marker: no content, not streaming.
    pub fn is_completion_signal(&self) -> bool {
        self.content.is_empty() && !self.streaming
    }
}

/// A reconciled, user-visible message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(alias = "chatId")]
    pub conversation_id: ConversationId,
    pub content: String,
    pub role: Role,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// An assistant reply that is still receiving fragments.
    #[serde(default, alias = "isStreaming")]
    pub streaming: bool,
    #[serde(default, alias = "error")]
    pub is_error: bool,
}

impl Message {
    /// An optimistic USER message shown before the server has seen it.
    pub fn local_user(
        conversation_id: ConversationId,
        content: impl Into<String>,
        image_url: Option<String>,
    ) -> Self {
        Self {
            id: MessageId::local(),
            conversation_id,
            content: content.into(),
            role: Role::User,
            timestamp: Timestamp::now(),
            image_url,
            streaming: false,
            is_error: false,
        }
    }
}

impl From<MessageFragment> for Message {
    fn from(fragment: MessageFragment) -> Self {
        Self {
            id: fragment.id,
            conversation_id: fragment.conversation_id,
            content: fragment.content,
            role: fragment.role,
            timestamp: fragment.timestamp,
            image_url: fragment.image_url,
            streaming: fragment.streaming,
            is_error: fragment.is_error,
        }
    }
}

/// Payload published to [`SEND_DESTINATION`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Directory entry for a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_topic() {
        let id = ConversationId::new("42");
        assert_eq!(id.topic(), "/topic/chat/42");
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_ids_accept_numbers_and_strings() {
        let id: ConversationId = serde_json::from_str("17").unwrap();
        assert_eq!(id, ConversationId::new("17"));
        let id: ConversationId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(id.as_str(), "abc");
        let mid: MessageId = serde_json::from_str("9").unwrap();
        assert_eq!(mid.as_str(), "9");
    }

    #[test]
    fn test_local_message_id() {
        let id = MessageId::local();
        assert!(id.is_local());
        assert!(!MessageId::new("1700000000_ai").is_local());
        assert_ne!(MessageId::local(), MessageId::local());
    }

    #[test]
    fn test_timestamp_parses_rfc3339_and_naive() {
        let a = Timestamp::parse("2024-05-01T10:00:00.250Z").unwrap();
        let b = Timestamp::parse("2024-05-01T10:00:00.250").unwrap();
        assert_eq!(a, b);
        let c = Timestamp::parse("2024-05-01T12:00:05.250+02:00").unwrap();
        assert_eq!(a.millis_between(&c), 5000);
        assert!(Timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn test_zone_less_time_read_at_server_offset() {
        let kst = FixedOffset::east_opt(9 * 3600).unwrap();
        let local = Timestamp::parse_at("2024-05-01T19:00:00", kst).unwrap();
        assert_eq!(local, Timestamp::parse("2024-05-01T10:00:00Z").unwrap());
        // Explicit zones ignore the offset.
        let zoned = Timestamp::parse_at("2024-05-01T10:00:00Z", kst).unwrap();
        assert_eq!(zoned, local);
    }

    #[test]
    fn test_fragment_from_json_applies_server_offset() {
        let kst = FixedOffset::east_opt(9 * 3600).unwrap();
        let json = r#"{"id": 7, "chatId": 3, "content": "hi", "role": "USER",
                       "timestamp": "2024-05-01T19:00:00.500"}"#;
        let fragment = MessageFragment::from_json(json, kst).unwrap();
        assert_eq!(
            fragment.timestamp,
            Timestamp::parse("2024-05-01T10:00:00.500Z").unwrap()
        );
        assert_eq!(fragment.conversation_id, ConversationId::new("3"));

        let utc = MessageFragment::from_json(json, Utc.fix()).unwrap();
        assert_eq!(utc.timestamp.millis_between(&fragment.timestamp), 9 * 3_600_000);
        assert!(MessageFragment::from_json("{}", kst).is_err());
    }

    #[test]
    fn test_timestamp_millis_roundtrip() {
        let ts = Timestamp::from_millis(1_714_557_600_123);
        assert_eq!(ts.as_millis(), 1_714_557_600_123);
        let parsed: Timestamp = serde_json::from_str("1714557600123").unwrap();
        assert_eq!(parsed, ts);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2024-05-01T10:00:00.123Z\"");
    }

    #[test]
    fn test_fragment_accepts_server_field_names() {
        let json = r#"{
            "id": "1714557600000_ai",
            "chatId": "7",
            "content": "Hel",
            "role": "ASSISTANT",
            "timestamp": "2024-05-01T10:00:00.5",
            "isStreaming": true,
            "error": false
        }"#;
        let fragment: MessageFragment = serde_json::from_str(json).unwrap();
        assert_eq!(fragment.conversation_id, ConversationId::new("7"));
        assert_eq!(fragment.role, Role::Assistant);
        assert!(fragment.streaming);
        assert!(!fragment.is_error);
        assert!(fragment.image_url.is_none());
    }

    #[test]
    fn test_fragment_defaults_missing_flags() {
        let json = r#"{"id":"s1","conversationId":"7","content":"x","role":"SYSTEM","timestamp":"2024-05-01T10:00:00Z"}"#;
        let fragment: MessageFragment = serde_json::from_str(json).unwrap();
        assert!(!fragment.streaming);
        assert!(!fragment.is_error);
    }

    #[test]
    fn test_fragment_rejects_unknown_role() {
        let json = r#"{"id":"1","conversationId":"7","content":"x","role":"BOT"}"#;
        assert!(serde_json::from_str::<MessageFragment>(json).is_err());
    }

    #[test]
    fn test_completion_signal_detection() {
        let mut fragment = MessageFragment {
            id: MessageId::new("m1"),
            conversation_id: ConversationId::new("1"),
            content: String::new(),
            role: Role::Assistant,
            timestamp: Timestamp::now(),
            image_url: None,
            streaming: false,
            is_error: false,
        };
        assert!(fragment.is_completion_signal());
        fragment.streaming = true;
        assert!(!fragment.is_completion_signal());
        fragment.streaming = false;
        fragment.content = "last words".to_string();
        assert!(!fragment.is_completion_signal());
    }

    #[test]
    fn test_send_request_wire_shape() {
        let request = SendRequest {
            conversation_id: ConversationId::new("3"),
            content: "hello".to_string(),
            image_url: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, serde_json::json!({"conversationId": "3", "content": "hello"}));
    }

    #[test]
    fn test_local_user_message() {
        let msg = Message::local_user(ConversationId::new("3"), "hi", None);
        assert_eq!(msg.role, Role::User);
        assert!(msg.id.is_local());
        assert!(!msg.streaming);
        assert!(!msg.is_error);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting");
        assert_eq!(Role::Assistant.to_string(), "ASSISTANT");
    }
}
