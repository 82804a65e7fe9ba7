use crate::config::BrokerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{BrokerErrorKind, Error, Result};
use crate::history::{Clock, HistoryBuffer, HistoryEntry, SystemClock};
use crate::message::{ControlMessage, Event, Frame, Message, Topic};
use crate::registry::{Admission, BrokerStats, ConnectionRegistry};
use futures::future::join_all;
use log::*;
use serde::Serialize;
use std::iter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

/// Membership changes funnelled into the control loop.
pub(crate) enum Command {
    Register(Arc<Connection>),
    Unregister { id: ConnectionId, serial: u64 },
}

/// The fan-out engine's control loop.
///
/// Owns the registry: every admission, removal and dispatch decision happens on
/// the single task running [`Broker::start`]. Producers, connections and the
/// HTTP layer talk to it through a [`BrokerHandle`].
pub struct Broker {
    config: Arc<BrokerConfig>,
    registry: Arc<ConnectionRegistry>,
    history: Arc<HistoryBuffer>,
    commands: mpsc::UnboundedReceiver<Command>,
    publications: mpsc::Receiver<Event>,
    handle: BrokerHandle,
}

/// Cloneable front door to a [`Broker`].
#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::UnboundedSender<Command>,
    publications: mpsc::Sender<Event>,
    registry: Arc<ConnectionRegistry>,
    history: Arc<HistoryBuffer>,
    config: Arc<BrokerConfig>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Uses `clock` for history retention decisions.
    pub fn with_clock(config: BrokerConfig, clock: Arc<dyn Clock>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new());
        let history = Arc::new(HistoryBuffer::with_clock(
            config.history_max_per_topic,
            config.history_retention,
            clock,
        ));
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (publication_tx, publications) = mpsc::channel(config.intake_capacity.max(1));

        let handle = BrokerHandle {
            commands: command_tx,
            publications: publication_tx,
            registry: Arc::clone(&registry),
            history: Arc::clone(&history),
            config: Arc::clone(&config),
        };

        Self {
            config,
            registry,
            history,
            commands,
            publications,
            handle,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Runs the control loop until `shutdown` is cancelled, then closes every
    /// registered connection and clears the registry.
    pub async fn start(mut self, shutdown: CancellationToken) {
        info!(
            "Starting SSE broker (max connections: {}, history: {} per topic for {:?})",
            self.config.max_connections,
            self.config.history_max_per_topic,
            self.config.history_retention
        );

        let sweeper = tokio::spawn(
            Arc::clone(&self.history)
                .run_sweeper(self.config.history_sweep_interval, shutdown.child_token()),
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                Some(event) = self.publications.recv() => self.process(event).await,
                else => break,
            }
        }

        info!("Shutting down SSE broker");
        self.close_all();
        self.reject_pending();

        if let Err(e) = sweeper.await {
            warn!("History sweeper ended abnormally: {e}");
        }
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::Register(connection) => self.register(connection).await,
            Command::Unregister { id, serial } => self.unregister(&id, serial),
        }
    }

    async fn register(&self, connection: Arc<Connection>) {
        if connection.is_closed() {
            debug!(
                "SSE connection {} closed before admission, skipping",
                connection.id()
            );
            return;
        }

        let admission = self
            .registry
            .admit(&connection, self.config.max_connections, || {
                self.history
                    .replay_from(connection.topic(), connection.last_event_id())
            });

        match admission {
            Admission::AtCapacity => {
                warn!(
                    "Max SSE connections reached ({}), rejecting connection {}",
                    self.config.max_connections,
                    connection.id()
                );
                connection.close();
            }
            Admission::Admitted { replay, replaced } => {
                if let Some(replaced) = replaced {
                    info!(
                        "SSE connection id {} reused, closing the previous stream",
                        connection.id()
                    );
                    replaced.close();
                }

                info!(
                    "SSE connection {} joined topic {} (total connections: {})",
                    connection.id(),
                    connection.topic(),
                    self.registry.len()
                );

                if !replay.is_empty() {
                    self.replay(&connection, &replay).await;
                }
                connection.activate();
            }
        }
    }

    fn unregister(&self, id: &ConnectionId, serial: u64) {
        if self.registry.remove(id, serial).is_some() {
            debug!(
                "Unregistered SSE connection {id} (remaining connections: {})",
                self.registry.len()
            );
        }
    }

    /// Sends the replay sequence: start marker, retained entries oldest first, end marker.
    async fn replay(&self, connection: &Connection, entries: &[HistoryEntry]) {
        info!(
            "Replaying {} events for SSE connection {}",
            entries.len(),
            connection.id()
        );

        let frames = iter::once(Frame::control(ControlMessage::ReplayStart {
            count: entries.len(),
        }))
        .chain(entries.iter().map(Frame::from))
        .chain(iter::once(Frame::control(ControlMessage::ReplayEnd)));

        for frame in frames {
            if let Err(e) = connection.send(frame).await {
                warn!(
                    "Replay to SSE connection {} interrupted: {e}",
                    connection.id()
                );
                break;
            }
        }
    }

    async fn process(&self, event: Event) {
        if let (Some(topic), Some(id)) = (&event.topic, &event.id) {
            self.history.store(
                topic,
                id.as_str(),
                event.kind.as_str(),
                Arc::clone(&event.payload),
            );
        }

        self.dispatch(&event).await;
    }

    /// Hands `event` to every target concurrently and waits until each hand-off
    /// succeeded or timed out, so the next event cannot overtake this one.
    async fn dispatch(&self, event: &Event) {
        let targets = match (&event.target, &event.topic) {
            (Some(target), _) => self.registry.get(target).into_iter().collect(),
            (None, Some(topic)) => self.registry.topic_members(topic),
            (None, None) => self.registry.all(),
        };

        if targets.is_empty() {
            debug!("No SSE connections to receive {} event", event.kind);
            return;
        }

        let frame = Frame::from(event);
        let deliveries = targets.into_iter().map(|connection| {
            let frame = frame.clone();
            async move {
                let result = connection.send(frame).await;
                (connection, result)
            }
        });

        for (connection, result) in join_all(deliveries).await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_timeout() => {
                    warn!(
                        "Failed to send {} event to SSE connection {}: {e}",
                        event.kind,
                        connection.id()
                    );
                    self.schedule_retry(connection, frame.clone());
                }
                Err(e) => debug!("Skipping SSE connection {}: {e}", connection.id()),
            }
        }
    }

    /// Retries a timed out hand-off a fixed number of times off the control loop,
    /// then drops the frame for that connection only.
    fn schedule_retry(&self, connection: Arc<Connection>, frame: Frame) {
        let attempts = self.config.max_retry_attempts;
        let delay = self.config.retry_delay;

        if attempts == 0 {
            warn!(
                "Dropping {} event for SSE connection {}",
                frame.kind,
                connection.id()
            );
            return;
        }

        tokio::spawn(async move {
            for attempt in 1..=attempts {
                tokio::time::sleep(delay).await;
                if connection.is_closed() {
                    return;
                }

                debug!(
                    "Retrying delivery to SSE connection {} (attempt {attempt}/{attempts})",
                    connection.id()
                );
                match connection.send(frame.clone()).await {
                    Ok(()) => return,
                    Err(e) if e.is_closed() => return,
                    Err(e) => warn!(
                        "Retry {attempt}/{attempts} to SSE connection {} failed: {e}",
                        connection.id()
                    ),
                }
            }

            warn!(
                "Dropping {} event for SSE connection {} after {attempts} retries",
                frame.kind,
                connection.id()
            );
        });
    }

    fn close_all(&self) {
        let connections = self.registry.drain();
        info!("Closing all SSE connections ({} connections)", connections.len());

        for connection in connections {
            connection.close();
        }
    }

    /// Closes connections whose registration was still queued at shutdown.
    fn reject_pending(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Register(connection) = command {
                connection.close();
            }
        }
    }
}

impl BrokerHandle {
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn register(&self, connection: Arc<Connection>) -> Result<()> {
        self.commands
            .send(Command::Register(connection))
            .map_err(|_| Error::broker(BrokerErrorKind::ShutDown))
    }

    pub(crate) fn unregister(&self, id: ConnectionId, serial: u64) {
        // Nothing left to unregister from once the broker has stopped
        let _ = self.commands.send(Command::Unregister { id, serial });
    }

    /// Queues `event` for dispatch. Only local problems are reported: an invalid
    /// event, a full intake queue or a stopped broker. Delivery itself is never
    /// confirmed.
    pub async fn publish(&self, event: Event) -> Result<()> {
        event.validate()?;

        match self
            .publications
            .send_timeout(event, self.config.publish_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(event)) => {
                warn!("SSE publish queue is full, dropping {} event", event.kind);
                Err(Error::broker(BrokerErrorKind::Overloaded))
            }
            Err(SendTimeoutError::Closed(_)) => Err(Error::broker(BrokerErrorKind::ShutDown)),
        }
    }

    /// Publishes `payload` to every connection following `topic` and keeps it for replay.
    pub async fn send_to_topic<T>(
        &self,
        topic: impl Into<Topic>,
        id: impl Into<String>,
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish(Event::new(kind, payload)?.with_id(id).to_topic(topic))
            .await
    }

    pub async fn send_to_connection<T>(
        &self,
        connection_id: ConnectionId,
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish(Event::new(kind, payload)?.to_connection(connection_id))
            .await
    }

    pub async fn broadcast<T>(&self, kind: impl Into<String>, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish(Event::new(kind, payload)?).await
    }

    /// Publishes a typed chat event according to its scope.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.publish(message.into_event()?).await
    }

    pub fn stats(&self) -> BrokerStats {
        self.registry.stats()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn topic_connection_count(&self, topic: &Topic) -> usize {
        self.registry.topic_len(topic)
    }

    /// Entries currently retained for `topic`, oldest first.
    pub fn recent_history(&self, topic: &Topic) -> Vec<HistoryEntry> {
        self.history.retained(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::error::{ErrorKind, ValidationErrorKind};
    use crate::history::ManualClock;
    use crate::transport::{ChannelTransport, SseTransport, Transport};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::Semaphore;
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Instant};

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        handle: BrokerHandle,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(config: BrokerConfig) -> Self {
            Self::start_with(Broker::new(config))
        }

        fn start_with(broker: Broker) -> Self {
            let handle = broker.handle();
            let shutdown = CancellationToken::new();
            let task = tokio::spawn(broker.start(shutdown.clone()));
            Self {
                handle,
                shutdown,
                task,
            }
        }

        async fn stop(self) {
            self.shutdown.cancel();
            timeout(WAIT, self.task).await.unwrap().unwrap();
        }
    }

    struct Client {
        connection: Arc<Connection>,
        frames: UnboundedReceiver<Frame>,
        task: JoinHandle<()>,
    }

    impl Client {
        /// Starts the write loop and waits for the initial ping, which is written
        /// right after the registration request was queued.
        async fn connect(handle: &BrokerHandle, id: &str, topic: &str) -> Self {
            Self::resume(handle, id, topic, None).await
        }

        async fn resume(
            handle: &BrokerHandle,
            id: &str,
            topic: &str,
            last_event_id: Option<&str>,
        ) -> Self {
            let connection = Connection::new(
                ConnectionId::from(id),
                Topic::from(topic),
                last_event_id.map(str::to_string),
                handle,
            );
            let (transport, mut frames) = ChannelTransport::new();
            let task = tokio::spawn(Arc::clone(&connection).run(transport));

            let ping = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
            assert!(ping.is_heartbeat());

            Self {
                connection,
                frames,
                task,
            }
        }

        async fn next(&mut self) -> Frame {
            loop {
                let frame = timeout(WAIT, self.frames.recv())
                    .await
                    .expect("timed out waiting for a frame")
                    .expect("transport closed");
                if !frame.is_heartbeat() {
                    return frame;
                }
            }
        }

        async fn wait_active(&self) {
            wait_until(|| self.connection.state() == ConnectionState::Active).await;
        }
    }

    /// Accepts the initial ping, then never completes another write.
    struct StalledTransport {
        pinged: bool,
    }

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send(&mut self, _frame: Frame) -> Result<()> {
            if self.pinged {
                std::future::pending::<()>().await;
            }
            self.pinged = true;
            Ok(())
        }
    }

    /// Completes one write per permit on `gate`, forwarding the frame to `frames`.
    /// Starts with a single permit for the initial ping.
    struct GatedTransport {
        gate: Arc<Semaphore>,
        frames: mpsc::UnboundedSender<Frame>,
    }

    impl GatedTransport {
        fn new() -> (Self, Arc<Semaphore>, UnboundedReceiver<Frame>) {
            let gate = Arc::new(Semaphore::new(1));
            let (frames, receiver) = mpsc::unbounded_channel();
            let transport = Self {
                gate: Arc::clone(&gate),
                frames,
            };
            (transport, gate, receiver)
        }
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&mut self, frame: Frame) -> Result<()> {
            self.gate.acquire().await.map_err(Error::transport)?.forget();
            self.frames.send(frame).map_err(Error::transport)
        }
    }

    /// A connection blocked on its transport after the initial ping, with a
    /// single-slot outbound queue.
    async fn gated_connection(
        handle: &BrokerHandle,
        id: &str,
    ) -> (Arc<Connection>, Arc<Semaphore>, UnboundedReceiver<Frame>, JoinHandle<()>) {
        let connection = Connection::new(ConnectionId::from(id), Topic::from("room1"), None, handle);
        let (transport, gate, mut frames) = GatedTransport::new();
        let task = tokio::spawn(Arc::clone(&connection).run(transport));

        assert!(timeout(WAIT, frames.recv()).await.unwrap().unwrap().is_heartbeat());
        wait_until(|| connection.state() == ConnectionState::Active).await;
        (connection, gate, frames, task)
    }

    async fn publish_ids(handle: &BrokerHandle, ids: &[&str]) {
        for id in ids {
            handle
                .send_to_topic("room1", *id, "message_created", &json!({}))
                .await
                .unwrap();
        }
    }

    async fn wait_until<F>(condition: F)
    where
        F: Fn() -> bool,
    {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn control(frame: &Frame) -> Value {
        assert!(frame.is_control(), "expected a control frame, got {frame:?}");
        serde_json::from_str(&frame.data).unwrap()
    }

    fn quiet_config() -> BrokerConfig {
        BrokerConfig {
            keepalive_interval: Duration::from_secs(3600),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_live_events_arrive_in_publish_order() {
        let harness = Harness::start(quiet_config());
        let mut client = Client::connect(&harness.handle, "c1", "room1").await;

        for i in 0..20 {
            harness
                .handle
                .send_to_topic("room1", format!("m{i}"), "message_created", &json!({ "n": i }))
                .await
                .unwrap();
        }

        for i in 0..20 {
            let frame = client.next().await;
            assert_eq!(frame.id, Some(format!("m{i}")));
            assert_eq!(frame.kind, "message_created");
        }

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_no_history_means_no_replay_markers() {
        let harness = Harness::start(quiet_config());
        let mut client = Client::connect(&harness.handle, "c1", "room1").await;

        harness
            .handle
            .send_to_topic("room1", "live", "message_created", &json!({}))
            .await
            .unwrap();

        let frame = client.next().await;
        assert!(!frame.is_control());
        assert_eq!(frame.id.as_deref(), Some("live"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_replay_keeps_most_recent_entries_and_precedes_live_events() {
        let harness = Harness::start(BrokerConfig {
            history_max_per_topic: 2,
            ..quiet_config()
        });
        let topic = Topic::from("room1");

        for id in ["a", "b", "c"] {
            harness
                .handle
                .send_to_topic(topic.clone(), id, "message_created", &json!({ "id": id }))
                .await
                .unwrap();
        }
        wait_until(|| {
            let history = harness.handle.recent_history(&topic);
            history.last().is_some_and(|entry| entry.id == "c")
        })
        .await;

        let mut client = Client::connect(&harness.handle, "c1", "room1").await;
        harness
            .handle
            .send_to_topic(topic.clone(), "d", "message_created", &json!({ "id": "d" }))
            .await
            .unwrap();

        assert_eq!(
            control(&client.next().await),
            json!({"type": "replay_start", "count": 2})
        );
        assert_eq!(client.next().await.id.as_deref(), Some("b"));
        assert_eq!(client.next().await.id.as_deref(), Some("c"));
        assert_eq!(control(&client.next().await), json!({"type": "replay_end"}));
        assert_eq!(client.next().await.id.as_deref(), Some("d"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_replay_keeps_original_kind_and_payload() {
        let harness = Harness::start(quiet_config());
        let topic = Topic::from("room1");

        for (id, kind) in [("a", "message_created"), ("b", "assistant_delta")] {
            harness
                .handle
                .send_to_topic(topic.clone(), id, kind, &json!({ "id": id }))
                .await
                .unwrap();
        }
        wait_until(|| harness.handle.recent_history(&topic).len() == 2).await;

        let mut client = Client::connect(&harness.handle, "c1", "room1").await;

        assert_eq!(control(&client.next().await)["count"], 2);
        let first = client.next().await;
        assert_eq!(first.kind, "message_created");
        assert_eq!(&*first.data, r#"{"id":"a"}"#);
        let second = client.next().await;
        assert_eq!(second.kind, "assistant_delta");
        assert_eq!(control(&client.next().await)["type"], "replay_end");

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_resume_replays_only_after_last_seen_event() {
        let harness = Harness::start(quiet_config());
        let topic = Topic::from("room1");

        for id in ["a", "b", "c"] {
            harness
                .handle
                .send_to_topic(topic.clone(), id, "message_created", &json!({}))
                .await
                .unwrap();
        }
        wait_until(|| harness.handle.recent_history(&topic).len() == 3).await;

        let mut client = Client::resume(&harness.handle, "c1", "room1", Some("b")).await;

        assert_eq!(control(&client.next().await)["count"], 1);
        assert_eq!(client.next().await.id.as_deref(), Some("c"));
        assert_eq!(control(&client.next().await)["type"], "replay_end");

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_expired_history_is_not_replayed() {
        let clock = ManualClock::new();
        let harness = Harness::start_with(Broker::with_clock(quiet_config(), clock.clone()));
        let topic = Topic::from("room1");

        harness
            .handle
            .send_to_topic(topic.clone(), "old", "message_created", &json!({}))
            .await
            .unwrap();
        wait_until(|| harness.handle.recent_history(&topic).len() == 1).await;

        clock.advance(Duration::from_secs(6 * 60));
        assert!(harness.handle.recent_history(&topic).is_empty());

        let mut client = Client::connect(&harness.handle, "c1", "room1").await;
        harness
            .handle
            .send_to_topic(topic.clone(), "new", "message_created", &json!({}))
            .await
            .unwrap();

        assert_eq!(client.next().await.id.as_deref(), Some("new"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_slow_connection_does_not_block_others() {
        let harness = Harness::start(BrokerConfig {
            outbound_capacity: 1,
            send_timeout: Duration::from_millis(50),
            max_retry_attempts: 1,
            retry_delay: Duration::from_millis(10),
            ..quiet_config()
        });

        let slow = Connection::new(ConnectionId::from("slow"), Topic::from("room1"), None, &harness.handle);
        let slow_task = tokio::spawn(Arc::clone(&slow).run(StalledTransport { pinged: false }));
        wait_until(|| slow.state() == ConnectionState::Active).await;

        let mut fast = Client::connect(&harness.handle, "fast", "room1").await;
        fast.wait_active().await;

        for i in 0..5 {
            harness
                .handle
                .send_to_topic("room1", format!("m{i}"), "message_created", &json!({}))
                .await
                .unwrap();
        }

        for i in 0..5 {
            assert_eq!(fast.next().await.id, Some(format!("m{i}")));
        }
        assert_eq!(harness.handle.topic_connection_count(&Topic::from("room1")), 2);

        slow.close();
        timeout(WAIT, slow_task).await.unwrap().unwrap();
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_hand_off_is_retried_once_queue_frees_up() {
        let harness = Harness::start(BrokerConfig {
            outbound_capacity: 1,
            send_timeout: Duration::from_millis(50),
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(50),
            ..quiet_config()
        });
        let (connection, gate, mut frames, task) = gated_connection(&harness.handle, "c1").await;

        // m0 is stuck in the transport, m1 fills the queue, m2 times out
        publish_ids(&harness.handle, &["m0", "m1", "m2"]).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        gate.add_permits(10);

        for id in ["m0", "m1", "m2"] {
            let frame = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
            assert_eq!(frame.id.as_deref(), Some(id));
        }

        connection.close();
        timeout(WAIT, task).await.unwrap().unwrap();
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hand_off_is_dropped_after_retries_run_out() {
        let harness = Harness::start(BrokerConfig {
            outbound_capacity: 1,
            send_timeout: Duration::from_millis(50),
            max_retry_attempts: 2,
            retry_delay: Duration::from_millis(10),
            ..quiet_config()
        });
        let (connection, gate, mut frames, task) = gated_connection(&harness.handle, "c1").await;

        publish_ids(&harness.handle, &["m0", "m1", "m2"]).await;
        // Initial timeout plus two retries of delay and timeout each
        tokio::time::sleep(Duration::from_secs(1)).await;
        gate.add_permits(10);
        publish_ids(&harness.handle, &["m3"]).await;

        for id in ["m0", "m1", "m3"] {
            let frame = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
            assert_eq!(frame.id.as_deref(), Some(id));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(frames.try_recv().is_err());
        assert_eq!(connection.state(), ConnectionState::Active);

        connection.close();
        timeout(WAIT, task).await.unwrap().unwrap();
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_reports_overload_when_intake_stays_full() {
        let harness = Harness::start(BrokerConfig {
            outbound_capacity: 1,
            send_timeout: Duration::from_secs(30),
            intake_capacity: 1,
            publish_timeout: Duration::from_millis(50),
            ..quiet_config()
        });
        let (connection, _gate, _frames, task) = gated_connection(&harness.handle, "c1").await;

        // m2 stalls the control loop on its hand-off and m3 fills the intake
        publish_ids(&harness.handle, &["m0", "m1", "m2", "m3"]).await;

        let started = Instant::now();
        let err = harness
            .handle
            .send_to_topic("room1", "m4", "message_created", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Broker(BrokerErrorKind::Overloaded));
        assert!(started.elapsed() >= Duration::from_millis(50));

        connection.close();
        timeout(WAIT, task).await.unwrap().unwrap();
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_payload_with_carriage_returns_is_streamed_and_replayed() {
        let harness = Harness::start(quiet_config());
        let topic = Topic::from("room1");

        let live = Connection::new(ConnectionId::from("live"), topic.clone(), None, &harness.handle);
        let (transport, mut live_events) = SseTransport::channel();
        let live_task = tokio::spawn(Arc::clone(&live).run(transport));
        assert!(timeout(WAIT, live_events.recv()).await.unwrap().is_some());
        wait_until(|| live.state() == ConnectionState::Active).await;

        for (id, payload) in [("x", "line1\r\nline2\rline3"), ("y", "after")] {
            harness
                .handle
                .publish(Event::from_raw("message_created", payload).to_topic(topic.clone()).with_id(id))
                .await
                .unwrap();
        }
        for _ in 0..2 {
            assert!(timeout(WAIT, live_events.recv()).await.unwrap().is_some());
        }
        assert_eq!(live.state(), ConnectionState::Active);
        assert_eq!(harness.handle.recent_history(&topic).len(), 2);

        // A joining stream replays the same entries: start, x, y, end
        let joined = Connection::new(ConnectionId::from("joined"), topic.clone(), None, &harness.handle);
        let (transport, mut joined_events) = SseTransport::channel();
        let joined_task = tokio::spawn(Arc::clone(&joined).run(transport));
        for _ in 0..5 {
            assert!(timeout(WAIT, joined_events.recv()).await.unwrap().is_some());
        }
        wait_until(|| joined.state() == ConnectionState::Active).await;
        assert_eq!(harness.handle.connection_count(), 2);

        live.close();
        joined.close();
        timeout(WAIT, live_task).await.unwrap().unwrap();
        timeout(WAIT, joined_task).await.unwrap().unwrap();
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_connection_beyond_limit_is_closed_and_not_counted() {
        let harness = Harness::start(BrokerConfig {
            max_connections: 1,
            ..quiet_config()
        });

        let first = Client::connect(&harness.handle, "first", "room1").await;
        first.wait_active().await;

        let rejected = Connection::new(
            ConnectionId::from("second"),
            Topic::from("room2"),
            None,
            &harness.handle,
        );
        let (transport, _frames) = ChannelTransport::new();
        let rejected_task = tokio::spawn(Arc::clone(&rejected).run(transport));

        timeout(WAIT, rejected.closed()).await.unwrap();
        timeout(WAIT, rejected_task).await.unwrap().unwrap();
        assert_eq!(rejected.state(), ConnectionState::Closed);

        let stats = harness.handle.stats();
        assert_eq!(stats.total_connections, 1);
        assert!(!stats.topics.contains_key(&Topic::from("room2")));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_reused_connection_id_replaces_the_older_stream() {
        let harness = Harness::start(BrokerConfig {
            max_connections: 1,
            ..quiet_config()
        });

        let original = Client::connect(&harness.handle, "same", "room1").await;
        original.wait_active().await;

        let mut replacement = Client::connect(&harness.handle, "same", "room1").await;
        replacement.wait_active().await;
        timeout(WAIT, original.connection.closed()).await.unwrap();
        timeout(WAIT, original.task).await.unwrap().unwrap();

        // The evicted instance's unregister must not remove its replacement
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.handle.connection_count(), 1);
        assert!(!replacement.connection.is_closed());

        harness
            .handle
            .send_to_topic("room1", "m1", "message_created", &json!({}))
            .await
            .unwrap();
        assert_eq!(replacement.next().await.id.as_deref(), Some("m1"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_targeted_event_to_unknown_connection_is_a_noop() {
        let harness = Harness::start(quiet_config());
        let mut bystander = Client::connect(&harness.handle, "c1", "room1").await;

        harness
            .handle
            .publish(
                Event::new("message_created", &json!({}))
                    .unwrap()
                    .with_id("x")
                    .to_connection(ConnectionId::from("conn42")),
            )
            .await
            .unwrap();
        harness
            .handle
            .send_to_topic("room1", "after", "message_created", &json!({}))
            .await
            .unwrap();

        assert_eq!(bystander.next().await.id.as_deref(), Some("after"));
        assert_eq!(harness.handle.history.topic_count(), 1);
        assert_eq!(harness.handle.recent_history(&Topic::from("room1")).len(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_targeted_event_reaches_only_its_target() {
        let harness = Harness::start(quiet_config());
        let mut target = Client::connect(&harness.handle, "target", "room1").await;
        let mut other = Client::connect(&harness.handle, "other", "room1").await;

        harness
            .handle
            .send_to_connection(ConnectionId::from("target"), "private", &json!({}))
            .await
            .unwrap();
        harness
            .handle
            .send_to_topic("room1", "shared", "message_created", &json!({}))
            .await
            .unwrap();

        assert_eq!(target.next().await.kind, "private");
        assert_eq!(target.next().await.id.as_deref(), Some("shared"));
        assert_eq!(other.next().await.id.as_deref(), Some("shared"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_topic_and_broadcast_routing() {
        let harness = Harness::start(quiet_config());
        let mut room1 = Client::connect(&harness.handle, "c1", "room1").await;
        let mut room2 = Client::connect(&harness.handle, "c2", "room2").await;

        harness
            .handle
            .send_to_topic("room2", "only-room2", "message_created", &json!({}))
            .await
            .unwrap();
        harness
            .handle
            .broadcast("announcement", &json!({ "text": "maintenance" }))
            .await
            .unwrap();

        assert_eq!(room2.next().await.id.as_deref(), Some("only-room2"));
        assert_eq!(room2.next().await.kind, "announcement");
        assert_eq!(room1.next().await.kind, "announcement");

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_stats_count_per_topic_and_follow_unregistration() {
        let harness = Harness::start(quiet_config());
        let a = Client::connect(&harness.handle, "a", "room1").await;
        let b = Client::connect(&harness.handle, "b", "room1").await;
        let c = Client::connect(&harness.handle, "c", "room2").await;
        wait_until(|| harness.handle.connection_count() == 3).await;

        let stats = harness.handle.stats();
        assert_eq!(stats.topics.get(&Topic::from("room1")), Some(&2));
        assert_eq!(stats.topics.get(&Topic::from("room2")), Some(&1));

        a.connection.close();
        a.connection.close();
        timeout(WAIT, a.task).await.unwrap().unwrap();
        wait_until(|| harness.handle.connection_count() == 2).await;
        assert_eq!(harness.handle.topic_connection_count(&Topic::from("room1")), 1);

        drop((b, c));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_dropping_the_reader_unregisters_the_connection() {
        let harness = Harness::start(quiet_config());
        let client = Client::connect(&harness.handle, "c1", "room1").await;
        client.wait_active().await;

        drop(client.frames);
        harness
            .handle
            .send_to_topic("room1", "m1", "message_created", &json!({}))
            .await
            .unwrap();

        timeout(WAIT, client.task).await.unwrap().unwrap();
        assert!(client.connection.is_closed());
        wait_until(|| harness.handle.connection_count() == 0).await;

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_connection() {
        let harness = Harness::start(quiet_config());
        let clients = vec![
            Client::connect(&harness.handle, "a", "room1").await,
            Client::connect(&harness.handle, "b", "room1").await,
            Client::connect(&harness.handle, "c", "room2").await,
        ];
        wait_until(|| harness.handle.connection_count() == 3).await;

        let handle = harness.handle.clone();
        harness.stop().await;

        for client in clients {
            timeout(WAIT, client.task).await.unwrap().unwrap();
            assert_eq!(client.connection.state(), ConnectionState::Closed);
        }
        assert_eq!(handle.stats(), BrokerStats::default());
    }

    #[tokio::test]
    async fn test_publish_validation_and_shutdown_errors() {
        let harness = Harness::start(quiet_config());
        let handle = harness.handle.clone();

        let err = handle
            .publish(Event::from_raw("two\nlines", "{}").to_topic("room1").with_id("x"))
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Validation(ValidationErrorKind::InvalidKind)
        );

        harness.stop().await;
        assert!(handle.recent_history(&Topic::from("room1")).is_empty());

        let err = handle.broadcast("late", &json!({})).await.unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Broker(BrokerErrorKind::ShutDown));
    }

    #[tokio::test]
    async fn test_connection_started_after_shutdown_is_closed() {
        let harness = Harness::start(quiet_config());
        let handle = harness.handle.clone();
        harness.stop().await;

        let connection = Connection::new(ConnectionId::new(), Topic::from("room1"), None, &handle);
        let (transport, _frames) = ChannelTransport::new();
        timeout(WAIT, Arc::clone(&connection).run(transport))
            .await
            .unwrap();

        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
