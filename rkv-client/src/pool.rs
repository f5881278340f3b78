//! # Connection Pool
//!
//! Purpose: Reuse TCP connections for request/response commands to reduce
//! handshake latency, and hand out dedicated connections for subscriptions.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    never across an `.await`.
//! 3. **Fail Fast**: Exceeding the pool limit returns an error immediately.
//! 4. **Borrow Checks**: Stale or dead idle connections are dropped on acquire.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::{ConnectOptions, Connection};
use crate::error::{ClientError, ClientResult};
use crate::resp::RespValue;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How to dial new connections.
    pub connect: ConnectOptions,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use + detached).
    pub max_total: usize,
    /// Idle connections older than this are discarded.
    pub idle_timeout: Option<Duration>,
    /// PING idle connections before reuse.
    pub test_on_borrow: bool,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConnection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.state.lock();
        if !state.closed && state.idle.len() < self.config.max_idle {
            state.idle.push_front(IdleConnection {
                conn,
                since: Instant::now(),
            });
        } else {
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// Point-in-time connection counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections counted against `max_total` (idle, in use, or detached).
    pub total: usize,
    /// Idle connections ready for reuse.
    pub idle: usize,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a new connection pool. No connection is dialed until first use.
    pub fn new(config: PoolConfig) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
            closed: false,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// Acquires a connection from the pool, dialing a new one if needed.
    pub async fn acquire(&self) -> ClientResult<PooledConnection> {
        while let Some(conn) = self.pop_idle()? {
            let mut pooled = PooledConnection::new(self.inner.clone(), conn);
            if !self.inner.config.test_on_borrow {
                return Ok(pooled);
            }
            match pooled.exec(&[b"PING"]).await {
                Ok(RespValue::Simple(_)) | Ok(RespValue::Bulk(Some(_))) => return Ok(pooled),
                Ok(_) | Err(_) => {
                    // Dropping an invalid connection releases its slot.
                    debug!("discarding idle connection that failed borrow check");
                    pooled.valid = false;
                }
            }
        }

        self.try_reserve()?;
        match Connection::connect(&self.inner.config.connect).await {
            Ok(conn) => {
                trace!(
                    host = %self.inner.config.connect.host,
                    port = self.inner.config.connect.port,
                    "dialed new connection"
                );
                Ok(PooledConnection::new(self.inner.clone(), conn))
            }
            Err(err) => {
                self.inner.release_slot();
                Err(err)
            }
        }
    }

    /// Closes the pool: idle connections are dropped and later acquires fail.
    ///
    /// Connections currently in use are discarded when they are dropped.
    pub fn close(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<IdleConnection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        debug!(dropped = drained.len(), "connection pool closed");
    }

    /// Returns current connection counts.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
        }
    }

    fn pop_idle(&self) -> ClientResult<Option<Connection>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(ClientError::PoolClosed);
        }
        while let Some(entry) = state.idle.pop_front() {
            let stale = self
                .inner
                .config
                .idle_timeout
                .map_or(false, |limit| entry.since.elapsed() >= limit);
            if stale {
                state.total = state.total.saturating_sub(1);
                continue;
            }
            return Ok(Some(entry.conn));
        }
        Ok(None)
    }

    fn try_reserve(&self) -> ClientResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(ClientError::PoolClosed);
        }
        if state.total >= self.inner.config.max_total {
            return Err(ClientError::PoolExhausted);
        }
        state.total += 1;
        Ok(())
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Executes a RESP command and returns the parsed response.
    pub async fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.exec_with_grace(args, Duration::ZERO).await
    }

    /// Executes a command whose reply may legitimately take `grace` longer
    /// than the configured read timeout.
    pub async fn exec_with_grace(
        &mut self,
        args: &[&[u8]],
        grace: Duration,
    ) -> ClientResult<RespValue> {
        let conn = self.conn.as_mut().ok_or(ClientError::NotConnected)?;
        // A request cancelled mid-flight leaves an unread reply behind, so the
        // connection only counts as valid again once the reply is consumed.
        self.valid = false;
        let response = conn.exec_with_grace(args, grace).await;
        self.valid = response.is_ok();
        response
    }

    /// Takes the connection out of pool management for exclusive use.
    ///
    /// The connection never returns to the idle set; its slot is released when
    /// the returned value (or the slot split from it) is dropped.
    pub fn detach(mut self) -> ClientResult<DedicatedConnection> {
        let conn = self.conn.take().ok_or(ClientError::NotConnected)?;
        Ok(DedicatedConnection {
            conn,
            slot: PoolSlot {
                pool: self.pool.clone(),
            },
        })
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.valid {
            self.pool.return_connection(conn);
        } else {
            drop(conn);
            self.pool.release_slot();
        }
    }
}

/// A connection removed from the pool for one long-lived user.
pub struct DedicatedConnection {
    conn: Connection,
    slot: PoolSlot,
}

impl DedicatedConnection {
    /// Splits into the raw connection and the pool slot it occupies.
    pub fn into_parts(self) -> (Connection, PoolSlot) {
        (self.conn, self.slot)
    }
}

/// Occupied pool slot, released on drop.
pub struct PoolSlot {
    pool: Arc<PoolInner>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.release_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pool_with_listener(
        max_total: usize,
        idle_timeout: Option<Duration>,
    ) -> (ConnectionPool, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = ConnectionPool::new(PoolConfig {
            connect: ConnectOptions {
                host: addr.ip().to_string(),
                port: addr.port(),
                read_timeout: Some(Duration::from_secs(1)),
                write_timeout: Some(Duration::from_secs(1)),
                connect_timeout: Some(Duration::from_secs(1)),
            },
            max_idle: 1,
            max_total,
            idle_timeout,
            test_on_borrow: false,
        });
        (pool, listener)
    }

    #[tokio::test]
    async fn returns_connection_to_idle_set() {
        let (pool, _listener) = pool_with_listener(2, None).await;
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.stats(), PoolStats { total: 1, idle: 0 });
        drop(conn);
        assert_eq!(pool.stats(), PoolStats { total: 1, idle: 1 });

        let _reused = pool.acquire().await.unwrap();
        assert_eq!(pool.stats(), PoolStats { total: 1, idle: 0 });
    }

    #[tokio::test]
    async fn fails_fast_when_exhausted() {
        let (pool, _listener) = pool_with_listener(1, None).await;
        let _held = pool.acquire().await.unwrap();
        assert!(matches!(pool.acquire().await, Err(ClientError::PoolExhausted)));
    }

    #[tokio::test]
    async fn detached_slot_is_released_on_drop() {
        let (pool, _listener) = pool_with_listener(1, None).await;
        let dedicated = pool.acquire().await.unwrap().detach().unwrap();
        let (conn, slot) = dedicated.into_parts();
        drop(conn);
        assert_eq!(pool.stats().total, 1);
        drop(slot);
        assert_eq!(pool.stats(), PoolStats { total: 0, idle: 0 });
    }

    #[tokio::test]
    async fn discards_stale_idle_connections() {
        let (pool, _listener) = pool_with_listener(1, Some(Duration::ZERO)).await;
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        // The stale entry is dropped, freeing its slot for a fresh dial.
        let _fresh = pool.acquire().await.unwrap();
        assert_eq!(pool.stats(), PoolStats { total: 1, idle: 0 });
    }

    #[tokio::test]
    async fn close_rejects_new_acquires() {
        let (pool, _listener) = pool_with_listener(2, None).await;
        drop(pool.acquire().await.unwrap());
        pool.close();
        assert_eq!(pool.stats(), PoolStats { total: 0, idle: 0 });
        assert!(matches!(pool.acquire().await, Err(ClientError::PoolClosed)));
    }
}
