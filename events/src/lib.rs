//! Event system infrastructure for the chat stream service.
//!
//! This crate provides the event system that enables loose coupling between
//! chat logic and infrastructure concerns (like SSE fan-out).
//!
//! # Architecture
//!
//! - **DomainEvent**: Enum representing all chat events in the system
//! - **EventHandler**: Trait for implementing event handlers
//! - **EventPublisher**: Publishes events to registered handlers
//!
//! This crate has no dependencies on internal crates, avoiding circular
//! dependencies. Message bodies are carried as serialized JSON values.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// A type alias that represents any chat entity's id.
pub type Id = Uuid;

/// Optional details attached to a message, e.g. by the assistant that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.model_name.is_none() && self.token_count.is_none() && self.processing_time_ms.is_none()
    }
}

/// Chat events emitted once a chat operation has completed.
///
/// Every variant is scoped to a single chat; subscribers follow chats, not users.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// A user or assistant message was added to a chat.
    MessageCreated {
        chat_id: Id,
        message_id: Id,
        /// Complete serialized message.
        message: Value,
        metadata: Option<MessageMetadata>,
    },
    /// A message moved to a new status (e.g. `pending` -> `completed`).
    MessageStatusChanged {
        chat_id: Id,
        message_id: Id,
        status: String,
    },
    /// A chunk of an assistant response that is still being generated.
    AssistantDelta {
        chat_id: Id,
        message_id: Id,
        delta: String,
    },
    /// The chat is gone; subscribers should stop following it.
    ChatDeleted { chat_id: Id },
}

impl DomainEvent {
    pub fn chat_id(&self) -> Id {
        match self {
            DomainEvent::MessageCreated { chat_id, .. }
            | DomainEvent::MessageStatusChanged { chat_id, .. }
            | DomainEvent::AssistantDelta { chat_id, .. }
            | DomainEvent::ChatDeleted { chat_id } => *chat_id,
        }
    }
}

/// Trait for handling domain events.
/// Implementations can perform side effects like sending notifications,
/// updating caches, logging, etc.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent);
}

/// Publishes domain events to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    /// Note: This creates a new publisher instance with the additional handler.
    /// Store the returned publisher in your application state.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Publish an event to all registered handlers, in registration order.
    pub async fn publish(&self, event: DomainEvent) {
        for handler in self.handlers.iter() {
            handler.handle(&event).await;
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, Id)>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &DomainEvent) {
            self.seen.lock().unwrap().push((self.name, event.chat_id()));
        }
    }

    #[tokio::test]
    async fn test_publish_calls_handlers_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let publisher = EventPublisher::new()
            .with_handler(Arc::new(Recorder {
                name: "first",
                seen: Arc::clone(&seen),
            }))
            .with_handler(Arc::new(Recorder {
                name: "second",
                seen: Arc::clone(&seen),
            }));
        assert_eq!(publisher.handler_count(), 2);

        let chat_id = Uuid::new_v4();
        publisher.publish(DomainEvent::ChatDeleted { chat_id }).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", chat_id), ("second", chat_id)]
        );
    }

    #[tokio::test]
    async fn test_publish_without_handlers_is_a_noop() {
        EventPublisher::default()
            .publish(DomainEvent::ChatDeleted {
                chat_id: Uuid::new_v4(),
            })
            .await;
    }

    #[test]
    fn test_with_handler_leaves_original_untouched() {
        let original = EventPublisher::new();
        let extended = original.clone().with_handler(Arc::new(Recorder {
            name: "only",
            seen: Arc::new(Mutex::new(Vec::new())),
        }));

        assert_eq!(original.handler_count(), 0);
        assert_eq!(extended.handler_count(), 1);
    }

    #[test]
    fn test_metadata_skips_missing_fields() {
        let metadata = MessageMetadata {
            model_name: Some("gpt-4o".to_string()),
            token_count: Some(42),
            processing_time_ms: None,
        };

        assert_eq!(
            serde_json::to_value(&metadata).unwrap(),
            serde_json::json!({"model_name": "gpt-4o", "token_count": 42})
        );
        assert!(!metadata.is_empty());
        assert!(MessageMetadata::default().is_empty());
    }
}
