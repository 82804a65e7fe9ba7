//! Server-Sent Events (SSE) fan-out for chat topics.
//!
//! Producers publish events; every connection following the event's topic
//! receives them in publish order. Recently published topic events are kept in a
//! bounded, time-limited history and replayed to (re)connecting clients.
//!
//! # Architecture
//!
//! - **Broker**: a single control loop owns the connection registry. Register,
//!   unregister and publish requests arrive as messages, so replay and live
//!   delivery can never interleave for a joining connection.
//! - **Connection**: one subscriber, with a bounded outbound queue drained onto a
//!   [`transport::Transport`] by its own write loop. A full queue only ever stalls
//!   a hand-off for the send timeout.
//! - **History Buffer**: per-topic FIFO with a capacity bound and a retention
//!   window, swept periodically.
//!
//! # Message Flow
//!
//! 1. The HTTP layer creates a [`Connection`] and spawns [`Connection::run`]
//! 2. The write loop asks the broker to register it and writes an initial ping
//! 3. The broker admits it, replays retained history between `replay_start` and
//!    `replay_end` control events, and marks it active
//! 4. A producer calls [`BrokerHandle::publish`] (or a typed helper)
//! 5. The broker stores the event when it has a topic and an id, then hands it to
//!    every target concurrently
//!
//! # Example: publishing an event
//!
//! ```rust,ignore
//! use sse::message::{ChatEvent, Message, MessageScope, Topic};
//!
//! app_state.broker.send_message(Message {
//!     id: Some(event_id),
//!     event: ChatEvent::AssistantDelta {
//!         chat_id: chat_id.to_string(),
//!         message_id: message_id.to_string(),
//!         delta: chunk,
//!     },
//!     scope: MessageScope::Topic { topic: Topic::from(chat_id.to_string()) },
//! })
//! .await?;
//! ```
//!
//! # Modules
//!
//! - `broker`: control loop, dispatch and the cloneable `BrokerHandle`
//! - `connection`: per-subscriber queue, write loop and lifecycle
//! - `history`: bounded per-topic replay buffer
//! - `message`: events, frames, control markers and typed chat events
//! - `transport`: where a connection's frames end up

pub mod broker;
pub mod config;
pub mod connection;
pub mod domain_event_handler;
pub mod error;
pub mod history;
pub mod message;
mod registry;
pub mod transport;

pub use broker::{Broker, BrokerHandle};
pub use config::BrokerConfig;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use domain_event_handler::SseDomainEventHandler;
pub use error::{Error, Result};
pub use message::{Event, Frame, Topic};
pub use registry::BrokerStats;
