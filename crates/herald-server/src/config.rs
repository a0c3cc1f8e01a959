//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`HERALD_CONFIG`, `herald.toml`, `/etc/herald/herald.toml`,
//!   `~/.config/herald/herald.toml`, first match wins)
//! - Environment overrides of any key (`HERALD__SECTION__KEY`)
//! - Environment fallbacks for common defaults (`HERALD_HOST`, `HERALD_PORT`,
//!   `HERALD_REDIS_URL`, `HERALD_JWT_SECRET`)

use anyhow::{Context, Result};
use herald_core::broadcast::BroadcastSettings;
use herald_core::{GatewaySettings, RateLimit};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default config file locations.
const CONFIG_PATHS: [&str; 3] = [
    "herald.toml",
    "/etc/herald/herald.toml",
    "~/.config/herald/herald.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Coordination store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store. Single node, or workers relayed by the supervisor.
    Memory,
    Redis,
}

/// Coordination store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis URL, used by the `redis` backend.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix of every key and pub/sub topic.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline of a single store call in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret used to verify bearer tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Deadline of credential verification in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Length of a rate-limit window in seconds.
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,

    /// Connections per user per window. 0 disables the limit.
    #[serde(default = "default_connect_limit")]
    pub connections_per_window: u64,

    /// Inbound events per user per window. 0 disables the limit.
    #[serde(default = "default_event_limit")]
    pub events_per_window: u64,

    /// Maximum message length in characters.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    #[serde(default = "default_max_channels_per_session")]
    pub max_channels_per_session: usize,

    /// Capacity of a session's outbound queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Maximum size of an inbound WebSocket message in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Heartbeat and reaping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time after which a session is reaped, in milliseconds.
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,

    /// How often the reaper runs, in milliseconds.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_typing_ttl")]
    pub typing_ttl_secs: u64,
}

/// Broadcast engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Batch channel-scoped envelopes before publishing.
    #[serde(default = "default_true")]
    pub batching: bool,

    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,

    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    /// Encoded envelopes larger than this are compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// Capacity of the encoded-envelope cache. 0 disables it.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Frames waiting for the store publisher before new ones are dropped.
    #[serde(default = "default_publish_queue")]
    pub publish_queue: usize,
}

/// Multi-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of worker processes. 0 means one per core, 1 serves in-process.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Delay before restarting a crashed worker, in milliseconds.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Time workers get to exit after `shutdown`, in milliseconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port. Worker `n` listens on `port + n`.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often engine statistics are exported, in milliseconds.
    #[serde(default = "default_metrics_interval")]
    pub report_interval_ms: u64,
}

// Default value functions
fn default_host() -> String {
    std::env::var("HERALD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HERALD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_redis_url() -> String {
    std::env::var("HERALD_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_key_prefix() -> String {
    "herald:".to_string()
}

fn default_store_timeout() -> u64 {
    2_000
}

fn default_jwt_secret() -> String {
    std::env::var("HERALD_JWT_SECRET").unwrap_or_default()
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_rate_window() -> u64 {
    60
}

fn default_connect_limit() -> u64 {
    30
}

fn default_event_limit() -> u64 {
    600
}

fn default_max_message_length() -> usize {
    4_000
}

fn default_max_channels_per_session() -> usize {
    500
}

fn default_outbound_queue() -> usize {
    256
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_stale_after() -> u64 {
    300_000 // 5 minutes
}

fn default_reap_interval() -> u64 {
    60_000
}

fn default_presence_ttl() -> u64 {
    3_600
}

fn default_typing_ttl() -> u64 {
    5
}

fn default_batch_interval() -> u64 {
    10
}

fn default_batch_max_size() -> usize {
    100
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_publish_queue() -> usize {
    8192
}

fn default_workers() -> usize {
    1
}

fn default_restart_delay() -> u64 {
    1_000
}

fn default_shutdown_grace() -> u64 {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_interval() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceConfig::default(),
            broadcast: BroadcastConfig::default(),
            cluster: ClusterConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_window_secs: default_rate_window(),
            connections_per_window: default_connect_limit(),
            events_per_window: default_event_limit(),
            max_message_length: default_max_message_length(),
            max_channels_per_session: default_max_channels_per_session(),
            outbound_queue: default_outbound_queue(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            stale_after_ms: default_stale_after(),
            reap_interval_ms: default_reap_interval(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl(),
            typing_ttl_secs: default_typing_ttl(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batching: true,
            batch_interval_ms: default_batch_interval(),
            batch_max_size: default_batch_max_size(),
            compression_threshold: default_compression_threshold(),
            cache_capacity: default_cache_capacity(),
            publish_queue: default_publish_queue(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            restart_delay_ms: default_restart_delay(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            report_interval_ms: default_metrics_interval(),
        }
    }
}

impl ClusterConfig {
    /// Number of worker processes to run, resolving 0 to the core count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        match self.workers {
            0 => std::thread::available_parallelism().map_or(1, usize::from),
            n => n,
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// `HERALD__SECTION__KEY` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("HERALD_CONFIG").ok();
        let candidates = explicit
            .iter()
            .map(String::as_str)
            .chain(CONFIG_PATHS.iter().copied());

        let mut builder = config::Config::builder();
        for path in candidates {
            let expanded = shellexpand::tilde(path);
            let path = Path::new(expanded.as_ref());
            if path.exists() {
                builder = builder.add_source(
                    config::File::from(path).format(config::FileFormat::Toml),
                );
                break;
            }
        }

        builder
            .add_source(
                config::Environment::with_prefix("HERALD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Gateway settings derived from this configuration.
    #[must_use]
    pub fn gateway_settings(&self) -> GatewaySettings {
        let window = Duration::from_secs(self.limits.rate_window_secs);
        let store_timeout = Duration::from_millis(self.store.timeout_ms);

        GatewaySettings {
            key_prefix: self.store.key_prefix.clone(),
            heartbeat: Duration::from_millis(self.heartbeat.interval_ms),
            stale_after: Duration::from_millis(self.heartbeat.stale_after_ms),
            reap_interval: Duration::from_millis(self.heartbeat.reap_interval_ms),
            session_lease: Duration::from_millis(self.heartbeat.reap_interval_ms.saturating_mul(3)),
            store_timeout,
            auth_timeout: Duration::from_millis(self.auth.handshake_timeout_ms),
            presence_ttl: Duration::from_secs(self.presence.ttl_secs),
            typing_ttl: Duration::from_secs(self.presence.typing_ttl_secs),
            max_message_length: self.limits.max_message_length,
            max_channels_per_session: self.limits.max_channels_per_session,
            outbound_queue: self.limits.outbound_queue,
            connect_rate: RateLimit {
                window,
                max: self.limits.connections_per_window,
            },
            event_rate: RateLimit {
                window,
                max: self.limits.events_per_window,
            },
            broadcast: BroadcastSettings {
                batching: self.broadcast.batching,
                batch_interval: Duration::from_millis(self.broadcast.batch_interval_ms),
                batch_max_size: self.broadcast.batch_max_size,
                compression_threshold: self.broadcast.compression_threshold,
                cache_capacity: self.broadcast.cache_capacity,
                publish_timeout: store_timeout,
                publish_queue: self.broadcast.publish_queue,
            },
        }
    }
}
