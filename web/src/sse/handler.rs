use crate::params::sse::StreamParams;
use crate::LAST_EVENT_ID;
use ::sse::{transport::SseTransport, Connection, Topic};
use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use log::*;
use service::AppState;
use std::sync::Arc;

/// Stops reverse proxies such as nginx from buffering the stream.
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// GET a live event stream for a chat
#[utoipa::path(
    get,
    path = "/chats/{chat_id}/stream",
    params(
        ("chat_id" = String, Path, description = "Chat to follow"),
        ("Last-Event-ID" = Option<String>, Header, description = "Id of the last event the client received"),
        StreamParams,
    ),
    responses(
        (status = 200, description = "Server-sent event stream of chat events", body = String, content_type = "text/event-stream"),
    )
)]
pub(crate) async fn chat_stream_handler(
    State(app_state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let connection_id = params.connection_id();
    let last_event_id = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    match &last_event_id {
        Some(last_event_id) => info!(
            "SSE reconnection requested for chat {chat_id}, client {connection_id}, last event {last_event_id}"
        ),
        None => info!("New SSE connection requested for chat {chat_id}, client {connection_id}"),
    }

    let connection = Connection::new(
        connection_id,
        Topic::from(chat_id),
        last_event_id,
        app_state.broker(),
    );
    let (transport, mut frames) = SseTransport::channel();
    tokio::spawn(Arc::clone(&connection).run(transport));

    // Dropping the response body (client went away) closes the connection
    let guard = connection.close_on_drop();
    let stream = stream! {
        let _guard = guard;
        while let Some(event) = frames.recv().await {
            yield event;
        }
        debug!("SSE stream for connection {} ended", connection.id());
    };

    (
        [(X_ACCEL_BUFFERING, HeaderValue::from_static("no"))],
        Sse::new(stream),
    )
}
