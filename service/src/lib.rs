use config::Config;
use events::EventPublisher;
use sse::{BrokerHandle, SseDomainEventHandler};
use std::sync::Arc;

pub mod config;
pub mod logging;

// Service-level state containing only infrastructure concerns
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub broker: BrokerHandle,
    /// Entry point for chat domain code; published events reach the chat's streams.
    pub event_publisher: Arc<EventPublisher>,
}

impl AppState {
    /// Wires the domain event publisher to the broker so chat events reach
    /// subscribed streams.
    pub fn new(app_config: Config, broker: BrokerHandle) -> Self {
        let event_publisher = EventPublisher::new()
            .with_handler(Arc::new(SseDomainEventHandler::new(broker.clone())));

        Self {
            config: app_config,
            broker,
            event_publisher: Arc::new(event_publisher),
        }
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }
}
