//! # Client Errors
//!
//! One error enum for the whole crate. Errors that happen before a
//! subscription stream exists are returned directly; errors that happen after
//! travel on the stream as terminal items (`ConnectionLost`,
//! `LivenessCheckFailed`).

use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,

    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },

    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,

    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Pool was stopped; no further connections are handed out.
    #[error("connection pool closed")]
    PoolClosed,

    /// A connect, read, write or handshake deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Peer closed the connection (EOF while a reply was expected).
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Configuration value could not be parsed.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The initial SUBSCRIBE was rejected or never confirmed.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(#[source] Box<ClientError>),

    /// The subscription connection failed mid-stream.
    #[error("subscription connection lost: {0}")]
    ConnectionLost(#[source] Box<ClientError>),

    /// The keepalive probe failed; the subscription was torn down.
    #[error("liveness check failed: {0}")]
    LivenessCheckFailed(#[source] Box<ClientError>),

    /// Operation attempted on a subscription that is already closed.
    #[error("not connected")]
    NotConnected,
}

impl ClientError {
    /// Returns true for the terminal error kinds delivered on a message stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionLost(_) | ClientError::LivenessCheckFailed(_)
        )
    }
}
