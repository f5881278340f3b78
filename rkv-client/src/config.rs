//! # Client Configuration
//!
//! Purpose: Collect every tunable of the client (target address, pool limits,
//! socket timeouts, subscription keepalive) into one explicit struct that is
//! handed to `KVClient::with_config`.
//!
//! ## Design Principles
//! 1. **Explicit Over Global**: No process-wide flags; callers own the config.
//! 2. **Sane Defaults**: `Default` carries the values the service ran with.
//! 3. **Serde-Friendly**: Partial documents deserialize thanks to
//!    `#[serde(default)]`, so embedders can load it from their own files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Environment variable holding the server host.
pub const ENV_HOST: &str = "REDIS_HOST";
/// Environment variable holding the server port.
pub const ENV_PORT: &str = "REDIS_PORT";

/// Configuration for the client and its pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use + detached).
    pub max_total: usize,
    /// Idle connections older than this are discarded on acquire.
    pub idle_timeout: Option<Duration>,
    /// PING idle connections before handing them out.
    pub test_on_borrow: bool,
    /// Optional TCP read timeout for request/response commands.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Subscription tuning.
    pub pubsub: PubSubConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            max_idle: 3,
            max_total: 16,
            idle_timeout: Some(Duration::from_secs(240)),
            test_on_borrow: true,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            pubsub: PubSubConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Builds a config from `REDIS_HOST` / `REDIS_PORT`, defaulting the rest.
    pub fn from_env() -> ClientResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    ///
    /// Missing keys keep their defaults; a port that does not parse is an error.
    pub fn from_lookup<F>(lookup: F) -> ClientResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ClientConfig::default();
        if let Some(host) = lookup(ENV_HOST) {
            let host = host.trim();
            if host.is_empty() {
                return Err(ClientError::InvalidConfig(format!("{} is empty", ENV_HOST)));
            }
            config.host = host.to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            config.port = port.trim().parse().map_err(|_| {
                ClientError::InvalidConfig(format!("{} is not a valid port: {:?}", ENV_PORT, port))
            })?;
        }
        Ok(config)
    }

    /// Returns `host:port`, the form used in logs.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Tuning for subscriptions created through `KVClient::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Interval between liveness probes. Zero disables the keepalive task.
    pub keepalive_interval: Duration,
    /// How long a probe may wait for its pong.
    pub probe_timeout: Duration,
    /// How long `subscribe` waits for the server to confirm every channel.
    pub handshake_timeout: Duration,
    /// Bound on every write to a subscription connection (SUBSCRIBE,
    /// UNSUBSCRIBE and teardown), independent of `ClientConfig::write_timeout`.
    pub write_timeout: Duration,
    /// Capacity of the message stream. Producers block when it is full.
    pub message_buffer: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        PubSubConfig {
            keepalive_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            message_buffer: 1,
        }
    }
}
