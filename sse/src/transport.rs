use crate::error::{Error, Result, ValidationErrorKind};
use crate::message::Frame;
use async_trait::async_trait;
use axum::response::sse::Event as SseEvent;
use std::borrow::Cow;
use std::convert::Infallible;
use tokio::sync::mpsc;

/// The wire side of a connection. A write either reaches the client or fails,
/// in which case the connection closes without retrying.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
}

/// Feeds frames into an axum `Sse` response body.
pub struct SseTransport {
    sender: mpsc::Sender<core::result::Result<SseEvent, Infallible>>,
}

pub type SseReceiver = mpsc::Receiver<core::result::Result<SseEvent, Infallible>>;

impl SseTransport {
    /// Creates a transport and the receiver the HTTP handler turns into a body stream.
    /// The buffer stays small so each write is handed straight to the response.
    pub fn channel() -> (Self, SseReceiver) {
        let (sender, receiver) = mpsc::channel(1);
        (Self { sender }, receiver)
    }

    /// Payloads are opaque, so any line break style is accepted and written as
    /// separate `data:` lines. Names and ids that cannot be framed fail the write.
    fn to_sse_event(frame: Frame) -> Result<SseEvent> {
        if frame.kind.contains(['\n', '\r']) {
            return Err(Error::validation(ValidationErrorKind::InvalidKind));
        }
        if let Some(id) = &frame.id {
            if id.contains(['\n', '\r', '\0']) {
                return Err(Error::validation(ValidationErrorKind::InvalidId));
            }
        }

        let event = SseEvent::default()
            .event(frame.kind)
            .data(normalize_line_breaks(&frame.data));
        Ok(match frame.id {
            Some(id) => event.id(id),
            None => event,
        })
    }
}

/// Rewrites `\r\n` and lone `\r` as `\n`, the only separator axum splits `data` on.
fn normalize_line_breaks(data: &str) -> Cow<'_, str> {
    if data.contains('\r') {
        Cow::Owned(data.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(data)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let event = Self::to_sse_event(frame)?;
        self.sender
            .send(Ok(event))
            .await
            .map_err(Error::transport)
    }
}

/// In-process transport forwarding frames to a channel, for embedding and tests.
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Frame>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.sender.send(frame).map_err(Error::transport)
    }
}
