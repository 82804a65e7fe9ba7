use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use sse::BrokerConfig;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap_or(RustEnv::Development)),
    )]
    pub runtime_env: RustEnv,

    /// Seconds to wait for the broker to close all connections on shutdown
    #[arg(long, env, default_value_t = 15)]
    pub shutdown_timeout_secs: u64,

    /// Maximum number of concurrently open SSE connections
    #[arg(long, env, default_value_t = 1000)]
    pub sse_max_connections: usize,

    /// Capacity of each SSE connection's outbound queue
    #[arg(long, env, default_value_t = 256)]
    pub sse_buffer_size: usize,

    /// Idle seconds after which an SSE connection is sent a ping
    #[arg(long, env, default_value_t = 15)]
    pub sse_keepalive_interval_secs: u64,

    /// Milliseconds a hand-off to a full SSE connection queue may wait
    #[arg(long, env, default_value_t = 5000)]
    pub sse_send_timeout_ms: u64,

    /// Retries after a timed out hand-off before the event is dropped for that connection
    #[arg(long, env, default_value_t = 3)]
    pub sse_max_retry_attempts: u32,

    /// Milliseconds between hand-off retries
    #[arg(long, env, default_value_t = 500)]
    pub sse_retry_delay_ms: u64,

    /// Events kept per chat for replay to reconnecting clients (0 disables replay)
    #[arg(long, env, default_value_t = 50)]
    pub sse_history_max_per_topic: usize,

    /// Seconds a published event stays eligible for replay
    #[arg(long, env, default_value_t = 300)]
    pub sse_history_retention_secs: u64,

    /// Seconds between sweeps of expired history entries
    #[arg(long, env, default_value_t = 60)]
    pub sse_history_sweep_interval_secs: u64,

    /// Milliseconds a producer may wait for room in the publish queue
    #[arg(long, env, default_value_t = 1000)]
    pub sse_publish_timeout_ms: u64,

    /// Capacity of the broker's publish queue
    #[arg(long, env, default_value_t = 256)]
    pub sse_intake_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Broker tunables derived from the `sse_*` options.
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_connections: self.sse_max_connections,
            outbound_capacity: self.sse_buffer_size,
            send_timeout: Duration::from_millis(self.sse_send_timeout_ms),
            keepalive_interval: Duration::from_secs(self.sse_keepalive_interval_secs),
            max_retry_attempts: self.sse_max_retry_attempts,
            retry_delay: Duration::from_millis(self.sse_retry_delay_ms),
            history_max_per_topic: self.sse_history_max_per_topic,
            history_retention: Duration::from_secs(self.sse_history_retention_secs),
            history_sweep_interval: Duration::from_secs(self.sse_history_sweep_interval_secs),
            intake_capacity: self.sse_intake_capacity,
            publish_timeout: Duration::from_millis(self.sse_publish_timeout_ms),
        }
    }
}
