use crate::broker::BrokerHandle;
use crate::message::{ChatEvent, Message, MessageScope, Topic};
use async_trait::async_trait;
use events::{DomainEvent, EventHandler};
use log::*;

/// Handles domain events by converting them to chat events and publishing them
/// to the topic of the chat they belong to.
///
/// Each publish gets a fresh event id so it is kept for replay and clients can
/// resume after it.
pub struct SseDomainEventHandler {
    broker: BrokerHandle,
}

impl SseDomainEventHandler {
    pub fn new(broker: BrokerHandle) -> Self {
        Self { broker }
    }

    fn to_chat_event(event: &DomainEvent) -> ChatEvent {
        match event {
            DomainEvent::MessageCreated {
                chat_id,
                message,
                metadata,
                ..
            } => ChatEvent::MessageCreated {
                chat_id: chat_id.to_string(),
                message: message.clone(),
                metadata: metadata.clone().filter(|metadata| !metadata.is_empty()),
            },
            DomainEvent::MessageStatusChanged {
                chat_id,
                message_id,
                status,
            } => ChatEvent::MessageStatusChanged {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
                status: status.clone(),
            },
            DomainEvent::AssistantDelta {
                chat_id,
                message_id,
                delta,
            } => ChatEvent::AssistantDelta {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
                delta: delta.clone(),
            },
            DomainEvent::ChatDeleted { chat_id } => ChatEvent::ChatDeleted {
                chat_id: chat_id.to_string(),
            },
        }
    }
}

#[async_trait]
impl EventHandler for SseDomainEventHandler {
    async fn handle(&self, event: &DomainEvent) {
        let chat_id = event.chat_id();
        let message = Message {
            id: Some(uuid::Uuid::new_v4().to_string()),
            event: Self::to_chat_event(event),
            scope: MessageScope::Topic {
                topic: Topic::from(chat_id.to_string()),
            },
        };

        debug!("Publishing {:?} for chat {chat_id}", message.event);

        if let Err(e) = self.broker.send_message(message).await {
            warn!("Failed to publish chat event for chat {chat_id}: {e}");
        }
    }
}
