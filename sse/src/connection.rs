use crate::broker::BrokerHandle;
use crate::config::MAX_TIMER_PERIOD;
use crate::error::{Error, Result};
use crate::message::{Frame, Topic};
use crate::transport::Transport;
use log::*;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Distinguishes two connection instances that happen to share an id.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, waiting for the broker to admit it.
    Pending = 0,
    /// Admitted and receiving live events.
    Active = 1,
    Closing = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// One subscriber's live stream.
///
/// The broker hands frames over with [`Connection::send`]; [`Connection::run`]
/// drains them onto the transport. A stalled client can only ever hold up a
/// hand-off for the send timeout.
pub struct Connection {
    id: ConnectionId,
    topic: Topic,
    serial: u64,
    last_event_id: Option<String>,
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
    receiver: Mutex<Option<mpsc::Receiver<Frame>>>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    state: AtomicU8,
    closed: AtomicBool,
    cancel: CancellationToken,
    broker: BrokerHandle,
    send_timeout: Duration,
    keepalive_interval: Duration,
}

impl Connection {
    /// Creates a connection for `topic`. `last_event_id` is the client's advisory
    /// resume marker, used only to trim the replay.
    pub fn new(
        id: ConnectionId,
        topic: Topic,
        last_event_id: Option<String>,
        broker: &BrokerHandle,
    ) -> Arc<Self> {
        let config = broker.config();
        let (sender, receiver) = mpsc::channel(config.outbound_capacity.max(1));
        let now = Instant::now();

        Arc::new(Self {
            id,
            topic,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            last_event_id,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            connected_at: now,
            last_activity: Mutex::new(now),
            state: AtomicU8::new(ConnectionState::Pending as u8),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            broker: broker.clone(),
            send_timeout: config.send_timeout,
            keepalive_interval: config.keepalive_interval,
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Resolves once the connection has started closing.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Puts a frame on the outbound queue, waiting up to the send timeout for room.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::send_closed());
        }

        let Some(sender) = lock(&self.sender).clone() else {
            return Err(Error::send_closed());
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::send_closed()),
            result = sender.send_timeout(frame, self.send_timeout) => match result {
                Ok(()) => Ok(()),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(Error::send_timeout()),
                Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(Error::send_closed()),
            },
        }
    }

    /// Pending -> Active, on admission. Returns false when the connection closed first.
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Pending as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// The write loop. Registers with the broker, then writes every queued frame
    /// to `transport` until the connection is cancelled, its queue closes or a
    /// write fails. A heartbeat goes out whenever the connection has been idle
    /// for the keepalive interval. Always ends in [`Connection::close`].
    pub async fn run<T>(self: Arc<Self>, mut transport: T)
    where
        T: Transport,
    {
        let Some(mut receiver) = lock(&self.receiver).take() else {
            warn!("SSE connection {} is already running", self.id);
            return;
        };

        if let Err(e) = self.broker.register(Arc::clone(&self)) {
            warn!("Could not register SSE connection {}: {e}", self.id);
            self.close();
            return;
        }

        if let Err(e) = self.write(&mut transport, Frame::heartbeat()).await {
            warn!("Failed to send initial ping to SSE connection {}: {e}", self.id);
            self.close();
            return;
        }
        self.touch();

        let mut keepalive = keepalive_timer(self.keepalive_interval);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("SSE connection {} cancelled", self.id);
                    break;
                }
                frame = receiver.recv() => {
                    let Some(frame) = frame else {
                        debug!("Outbound queue closed for SSE connection {}", self.id);
                        break;
                    };

                    if let Err(e) = self.write(&mut transport, frame).await {
                        if !e.is_closed() {
                            warn!("Failed to write to SSE connection {}: {e}", self.id);
                        }
                        break;
                    }
                    self.touch();
                }
                _ = keepalive.tick() => {
                    if self.last_activity().elapsed() < self.keepalive_interval {
                        continue;
                    }

                    if let Err(e) = self.write(&mut transport, Frame::heartbeat()).await {
                        if !e.is_closed() {
                            warn!("Failed to send keepalive to SSE connection {}: {e}", self.id);
                        }
                        break;
                    }
                    self.touch();
                }
            }
        }

        self.close();
    }

    /// Terminal transition. Cancels in-flight waits, asks the broker to drop the
    /// connection and closes the outbound queue. Calling it again does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.state
            .store(ConnectionState::Closing as u8, Ordering::Release);
        self.cancel.cancel();
        self.broker.unregister(self.id.clone(), self.serial);
        lock(&self.sender).take();
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);

        info!(
            "SSE connection {} on topic {} closed (connected for {:?})",
            self.id,
            self.topic,
            self.connected_at.elapsed()
        );
    }

    /// Closes the connection when the returned guard is dropped, e.g. together
    /// with the HTTP response body.
    pub fn close_on_drop(self: &Arc<Self>) -> CloseGuard {
        CloseGuard(Arc::clone(self))
    }

    /// Writes one frame, giving up as soon as the connection is cancelled so a
    /// stalled client cannot keep the write loop alive.
    async fn write<T>(&self, transport: &mut T, frame: Frame) -> Result<()>
    where
        T: Transport,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::send_closed()),
            result = transport.send(frame) => result,
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}

pub struct CloseGuard(Arc<Connection>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn keepalive_timer(interval: Duration) -> tokio::time::Interval {
    // A zero interval would make `interval_at` panic
    let interval = interval.clamp(Duration::from_millis(1), MAX_TIMER_PERIOD);
    let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
