//! SSE HTTP handler for the web layer.
//!
//! This module contains only the Axum handler for the chat stream endpoint.
//! The fan-out engine (Broker, Connection, History Buffer) lives in the `sse`
//! crate.

pub(crate) mod handler;
