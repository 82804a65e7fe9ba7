use crate::connection::ConnectionId;
use crate::error::{Error, Result, ValidationErrorKind};
use events::MessageMetadata;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// SSE event name used for replay markers.
pub const CONTROL_KIND: &str = "control";
/// SSE event name used for keepalive heartbeats.
pub const PING_KIND: &str = "ping";

/// Trait for getting the SSE event type name
pub trait EventType {
    fn event_type(&self) -> &'static str;
}

/// Logical channel scoping fan-out membership and history (one per chat).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(topic: &str) -> Self {
        Self::new(topic)
    }
}

impl From<String> for Topic {
    fn from(topic: String) -> Self {
        Self(topic)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable event as handed over by a producer.
///
/// Routing is decided by `target` first, then `topic`; an event with neither is
/// broadcast to every connection. Only events carrying both a `topic` and an `id`
/// are kept for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: Option<String>,
    pub topic: Option<Topic>,
    pub kind: String,
    pub payload: Arc<str>,
    pub target: Option<ConnectionId>,
}

impl Event {
    /// Serializes `payload` as JSON. Serialization failures are reported here,
    /// before the event reaches the broker.
    pub fn new<T>(kind: impl Into<String>, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(payload)?;
        Ok(Self::from_raw(kind, payload))
    }

    /// Builds an event from an already serialized payload.
    pub fn from_raw(kind: impl Into<String>, payload: impl Into<Arc<str>>) -> Self {
        Self {
            id: None,
            topic: None,
            kind: kind.into(),
            payload: payload.into(),
            target: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn to_topic(mut self, topic: impl Into<Topic>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn to_connection(mut self, connection_id: ConnectionId) -> Self {
        self.target = Some(connection_id);
        self
    }

    /// Checks that the kind and id can be written as SSE fields.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_empty() || self.kind.contains(['\n', '\r']) {
            return Err(Error::validation(ValidationErrorKind::InvalidKind));
        }
        if let Some(id) = &self.id {
            if id.contains(['\n', '\r', '\0']) {
                return Err(Error::validation(ValidationErrorKind::InvalidId));
            }
        }
        Ok(())
    }
}

/// A serialized event as it sits in a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: Option<String>,
    pub kind: String,
    pub data: Arc<str>,
}

impl Frame {
    pub fn heartbeat() -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            id: None,
            kind: PING_KIND.to_string(),
            data: json!({ "time": time }).to_string().into(),
        }
    }

    pub(crate) fn control(message: ControlMessage) -> Self {
        Self {
            id: None,
            kind: CONTROL_KIND.to_string(),
            data: message.payload().to_string().into(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == PING_KIND
    }

    pub fn is_control(&self) -> bool {
        self.kind == CONTROL_KIND
    }
}

impl From<&Event> for Frame {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            kind: event.kind.clone(),
            data: Arc::clone(&event.payload),
        }
    }
}

/// Markers bracketing a replay sequence so clients can tell it apart from live traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    ReplayStart { count: usize },
    ReplayEnd,
}

impl ControlMessage {
    pub fn payload(&self) -> Value {
        match self {
            ControlMessage::ReplayStart { count } => json!({ "type": "replay_start", "count": count }),
            ControlMessage::ReplayEnd => json!({ "type": "replay_end" }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ChatEvent {
    #[serde(rename = "message_created")]
    MessageCreated {
        chat_id: String,
        message: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<MessageMetadata>,
    },
    #[serde(rename = "message_status_changed")]
    MessageStatusChanged {
        chat_id: String,
        message_id: String,
        status: String,
    },
    #[serde(rename = "assistant_delta")]
    AssistantDelta {
        chat_id: String,
        message_id: String,
        delta: String,
    },
    #[serde(rename = "chat_deleted")]
    ChatDeleted { chat_id: String },
}

impl EventType for ChatEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ChatEvent::MessageCreated { .. } => "message_created",
            ChatEvent::MessageStatusChanged { .. } => "message_status_changed",
            ChatEvent::AssistantDelta { .. } => "assistant_delta",
            ChatEvent::ChatDeleted { .. } => "chat_deleted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: Option<String>,
    pub event: ChatEvent,
    pub scope: MessageScope,
}

#[derive(Debug, Clone)]
pub enum MessageScope {
    /// Send to every connection following a chat
    Topic { topic: Topic },
    /// Send to a single connection
    Connection { connection_id: ConnectionId },
    /// Send to all connections
    Broadcast,
}

impl Message {
    pub fn into_event(self) -> Result<Event> {
        let mut event = Event::new(self.event.event_type(), &self.event)?;
        event.id = self.id;

        Ok(match self.scope {
            MessageScope::Topic { topic } => event.to_topic(topic),
            MessageScope::Connection { connection_id } => event.to_connection(connection_id),
            MessageScope::Broadcast => event,
        })
    }
}
