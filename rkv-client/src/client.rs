//! # Client API
//!
//! Purpose: Expose a compact async API for issuing Redis-compatible commands
//! over RESP2, plus the lifecycle hooks (`start`/`health`/`stop`) a host
//! service container drives.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.
//! 4. **Missing Is Not an Error**: Null replies map to `None`.

use std::time::Duration;

use tracing::info;

use crate::config::ClientConfig;
use crate::connection::ConnectOptions;
use crate::error::{ClientError, ClientResult};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::pubsub::{self, MessageStream, SubscriptionHandle};
use crate::resp::{parse_bulk_u64, RespValue};

/// Async client with connection pooling.
///
/// Each command acquires a connection, executes one request, and returns the
/// connection to the pool. Subscriptions take a connection out of the pool for
/// as long as they live.
pub struct KVClient {
    config: ClientConfig,
    pool: ConnectionPool,
}

impl KVClient {
    /// Name under which the client registers with a service container.
    pub const NAME: &'static str = "redis";

    /// Creates a client for `host:port` with default configuration.
    pub fn connect(host: impl Into<String>, port: u16) -> Self {
        let config = ClientConfig {
            host: host.into(),
            port,
            ..ClientConfig::default()
        };
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration. No connection is opened
    /// until the first command (or `start`).
    pub fn with_config(config: ClientConfig) -> Self {
        let pool = ConnectionPool::new(PoolConfig {
            connect: ConnectOptions {
                host: config.host.clone(),
                port: config.port,
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
                connect_timeout: config.connect_timeout,
            },
            max_idle: config.max_idle,
            max_total: config.max_total,
            idle_timeout: config.idle_timeout,
            test_on_borrow: config.test_on_borrow,
        });
        KVClient { config, pool }
    }

    /// Returns the configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Verifies the server is reachable.
    pub async fn start(&self) -> ClientResult<()> {
        info!(addr = %self.config.addr(), "connecting to redis");
        self.ping(None).await?;
        Ok(())
    }

    /// Health check: one PING through the pool.
    pub async fn health(&self) -> ClientResult<()> {
        self.ping(None).await.map(|_| ())
    }

    /// Returns current pool connection counts.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Closes the pool. Subscriptions already open keep their connections.
    pub fn stop(&self) {
        self.pool.close();
    }

    /// Pings the server. Returns the raw response payload.
    pub async fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let mut conn = self.pool.acquire().await?;
        let response = match payload {
            Some(data) => conn.exec(&[b"PING", data]).await?,
            None => conn.exec(&[b"PING"]).await?,
        };
        match response {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub async fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"GET", key]).await? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without expiration.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"SET", key, value]).await? {
            RespValue::Simple(_) => Ok(()),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value only if the key does not exist, expiring after `ttl`
    /// (millisecond precision). Returns true when the key was set.
    pub async fn set_nx_px(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<bool> {
        let (millis, len) = encode_u64(ttl.as_millis() as u64);
        let mut conn = self.pool.acquire().await?;
        match conn
            .exec(&[b"SET", key, value, b"NX", b"PX", &millis[..len]])
            .await?
        {
            RespValue::Simple(_) => Ok(true),
            RespValue::Bulk(None) => Ok(false),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub async fn del(&self, key: &[u8]) -> ClientResult<bool> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"DEL", key]).await? {
            RespValue::Integer(count) => Ok(count > 0),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns true when the key exists.
    pub async fn exists(&self, key: &[u8]) -> ClientResult<bool> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"EXISTS", key]).await? {
            RespValue::Integer(count) => Ok(count > 0),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Appends an item to a list. Returns the new list length.
    pub async fn rpush(&self, key: &[u8], value: &[u8]) -> ClientResult<u64> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"RPUSH", key, value]).await? {
            RespValue::Integer(len) if len >= 0 => Ok(len as u64),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Pops the head of a list without blocking.
    pub async fn lpop(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"LPOP", key]).await? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Pops the head of a list, waiting up to `timeout` for an item to arrive.
    ///
    /// The server counts whole seconds, so a fractional timeout is rounded up.
    /// A zero timeout lets the server wait indefinitely, still bounded by the
    /// configured read timeout.
    pub async fn blpop(&self, key: &[u8], timeout: Duration) -> ClientResult<Option<Vec<u8>>> {
        let wait = blpop_seconds(timeout);
        let (seconds, len) = encode_u64(wait);
        let mut conn = self.pool.acquire().await?;
        let reply = conn
            .exec_with_grace(&[b"BLPOP", key, &seconds[..len]], Duration::from_secs(wait))
            .await?;
        match reply {
            // Timeout arrives as a null array, which decodes as empty.
            RespValue::Array(items) if items.is_empty() => Ok(None),
            RespValue::Array(items) => {
                // Reply is [key, value].
                let mut items = items.into_iter().skip(1);
                match items.next() {
                    Some(RespValue::Bulk(value)) => Ok(value),
                    _ => Err(ClientError::UnexpectedResponse),
                }
            }
            RespValue::Bulk(None) => Ok(None),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns the element at `index` of a list (negative counts from the end).
    pub async fn lindex(&self, key: &[u8], index: i64) -> ClientResult<Option<Vec<u8>>> {
        let index = index.to_string();
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"LINDEX", key, index.as_bytes()]).await? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns the length of a list.
    pub async fn llen(&self, key: &[u8]) -> ClientResult<u64> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"LLEN", key]).await? {
            RespValue::Integer(len) if len >= 0 => Ok(len as u64),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches one field of a hash.
    pub async fn hget(&self, key: &[u8], field: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"HGET", key, field]).await? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Stores one field of a hash. Returns true when the field is new.
    pub async fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> ClientResult<bool> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"HSET", key, field, value]).await? {
            RespValue::Integer(added) => Ok(added > 0),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns every field name of a hash.
    pub async fn hkeys(&self, key: &[u8]) -> ClientResult<Vec<Vec<u8>>> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"HKEYS", key]).await? {
            RespValue::Array(items) => bulk_items(items),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Scans a hash from `cursor`.
    ///
    /// Returns the next cursor (zero when done) and a flat
    /// `[field, value, field, value, ...]` list.
    pub async fn hscan(&self, key: &[u8], cursor: u64) -> ClientResult<(u64, Vec<Vec<u8>>)> {
        let (cursor, len) = encode_u64(cursor);
        let mut conn = self.pool.acquire().await?;
        let reply = conn.exec(&[b"HSCAN", key, &cursor[..len]]).await?;
        scan_reply(reply)
    }

    /// Scans the keyspace from `cursor`, optionally filtered by a glob pattern.
    pub async fn scan(
        &self,
        cursor: u64,
        pattern: Option<&[u8]>,
    ) -> ClientResult<(u64, Vec<Vec<u8>>)> {
        let (cursor, len) = encode_u64(cursor);
        let mut conn = self.pool.acquire().await?;
        let reply = match pattern {
            Some(pattern) => conn.exec(&[b"SCAN", &cursor[..len], b"MATCH", pattern]).await?,
            None => conn.exec(&[b"SCAN", &cursor[..len]]).await?,
        };
        scan_reply(reply)
    }

    /// Publishes `payload` on `channel`. Returns the number of receivers.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> ClientResult<u64> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(&[b"PUBLISH", channel.as_bytes(), payload]).await? {
            RespValue::Integer(count) if count >= 0 => Ok(count as u64),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Subscribes to `channels` on a dedicated connection.
    ///
    /// Returns once the server has confirmed every channel. Publishes arrive on
    /// the returned stream; the handle adds/removes channels and closes the
    /// subscription. Failures before this returns yield `SubscribeFailed`;
    /// later failures arrive as a terminal stream item.
    pub async fn subscribe(
        &self,
        channels: &[&str],
    ) -> ClientResult<(MessageStream, SubscriptionHandle)> {
        pubsub::subscribe(&self.pool, &self.config.pubsub, channels).await
    }
}

fn scan_reply(reply: RespValue) -> ClientResult<(u64, Vec<Vec<u8>>)> {
    let items = match reply {
        RespValue::Array(items) => items,
        RespValue::Error(message) => return Err(ClientError::Server { message }),
        _ => return Err(ClientError::UnexpectedResponse),
    };
    let mut items = items.into_iter();
    let next = match items.next() {
        Some(RespValue::Bulk(Some(cursor))) => parse_bulk_u64(&cursor)?,
        _ => return Err(ClientError::UnexpectedResponse),
    };
    match items.next() {
        Some(RespValue::Array(entries)) => Ok((next, bulk_items(entries)?)),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn bulk_items(items: Vec<RespValue>) -> ClientResult<Vec<Vec<u8>>> {
    items
        .into_iter()
        .map(|item| match item {
            RespValue::Bulk(Some(data)) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        })
        .collect()
}

fn blpop_seconds(timeout: Duration) -> u64 {
    // BLPOP 0 means "forever"; never let a short wait round down to it.
    timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0)
}

fn encode_u64(mut value: u64) -> ([u8; 20], usize) {
    // Stack buffer keeps conversion allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}
