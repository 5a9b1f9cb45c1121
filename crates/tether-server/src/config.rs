//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`$TETHER_CONFIG`, `tether.toml`, `/etc/tether/tether.toml`,
//!   `~/.config/tether/tether.toml`)
//! - Environment variables (`TETHER_PORT`, `TETHER_GROUPS__MAX_AGE_SECS`, ...)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tether_core::{RegistryConfig, RelayConfig};

/// Config files tried in order when `TETHER_CONFIG` is not set.
const CONFIG_PATHS: [&str; 3] = [
    "tether.toml",
    "/etc/tether/tether.toml",
    "~/.config/tether/tether.toml",
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

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Group lifetime and limits.
    #[serde(default)]
    pub groups: GroupsConfig,

    /// Relay configuration.
    #[serde(default)]
    pub relay: RelaySettings,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Group lifetime and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// Age in seconds after which a group is evicted.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Seconds between eviction sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum number of active groups.
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,

    /// Maximum members per group.
    #[serde(default = "default_max_members")]
    pub max_members_per_group: usize,

    /// Maximum display name length in characters.
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
}

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Events queued per connection before fan-out starts dropping.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Maximum chat message length in characters.
    #[serde(default = "default_max_chat_length")]
    pub max_chat_length: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_age() -> u64 {
    24 * 60 * 60 // 24 hours
}

fn default_sweep_interval() -> u64 {
    60 * 60 // 1 hour
}

fn default_max_groups() -> usize {
    10_000
}

fn default_max_members() -> usize {
    100
}

fn default_max_name_length() -> usize {
    64
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_max_chat_length() -> usize {
    2_000
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            groups: GroupsConfig::default(),
            relay: RelaySettings::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
            sweep_interval_secs: default_sweep_interval(),
            max_groups: default_max_groups(),
            max_members_per_group: default_max_members(),
            max_name_length: default_max_name_length(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            outbox_capacity: default_outbox_capacity(),
            max_chat_length: default_max_chat_length(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// `TETHER_*` environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// resulting configuration is invalid.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("TETHER_CONFIG") {
            Ok(path) => {
                let path = shellexpand::tilde(&path).into_owned();
                if !Path::new(&path).exists() {
                    bail!("Config file not found: {}", path);
                }
                Some(path)
            }
            Err(_) => CONFIG_PATHS
                .iter()
                .map(|path| shellexpand::tilde(path).into_owned())
                .find(|path| Path::new(path).exists()),
        };

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            tracing::info!("Loading configuration from {}", path);
            builder = builder.add_source(::config::File::from(Path::new(path)));
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix("TETHER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.groups.max_age_secs == 0 {
            bail!("groups.max_age_secs must be greater than zero");
        }
        if self.groups.sweep_interval_secs == 0 {
            bail!("groups.sweep_interval_secs must be greater than zero");
        }
        if self.relay.outbox_capacity == 0 {
            bail!("relay.outbox_capacity must be greater than zero");
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms < self.heartbeat.interval_ms {
            bail!("heartbeat.timeout_ms must be at least heartbeat.interval_ms, which must be non-zero");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        Ok(())
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

    /// Maximum group age.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.groups.max_age_secs)
    }

    /// Interval between eviction sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.groups.sweep_interval_secs)
    }

    /// Registry settings derived from this configuration.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_groups: self.groups.max_groups,
            max_members_per_group: self.groups.max_members_per_group,
            max_name_length: self.groups.max_name_length,
        }
    }

    /// Relay settings derived from this configuration.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_connections: self.limits.max_connections,
            outbox_capacity: self.relay.outbox_capacity,
            max_chat_length: self.relay.max_chat_length,
        }
    }
}
