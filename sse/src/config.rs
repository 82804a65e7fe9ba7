use std::time::Duration;

/// Longest period handed to a periodic timer. Deadlines are computed as
/// `now + period`, which must not overflow.
pub(crate) const MAX_TIMER_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Tunables for the broker, its connections and the replay history.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Ceiling on concurrently registered connections; admissions beyond it are rejected.
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// How long a single hand-off may wait for room in a full outbound queue.
    pub send_timeout: Duration,
    /// Idle time after which a connection writes a heartbeat.
    pub keepalive_interval: Duration,
    /// Retries after a timed out hand-off before the event is dropped for that connection.
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    /// Entries kept per topic for replay. Zero disables history.
    pub history_max_per_topic: usize,
    pub history_retention: Duration,
    pub history_sweep_interval: Duration,
    /// Capacity of the publish intake queue.
    pub intake_capacity: usize,
    /// How long a producer may wait for room in the publish intake queue.
    pub publish_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            outbound_capacity: 256,
            send_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(15),
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(500),
            history_max_per_topic: 50,
            history_retention: Duration::from_secs(5 * 60),
            history_sweep_interval: Duration::from_secs(60),
            intake_capacity: 256,
            publish_timeout: Duration::from_secs(1),
        }
    }
}
