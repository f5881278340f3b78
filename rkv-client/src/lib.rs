//! # rkv Async Client
//!
//! Purpose: Provide a lightweight async Redis-compatible client with
//! connection pooling and pub/sub subscriptions.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Dedicated Subscriptions**: Pub/sub takes its own connection and runs a
//!    receiver and a keepalive task next to the consumer.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Usage
//!
//! ```no_run
//! use rkv_client::{ClientConfig, KVClient};
//!
//! # async fn example() -> rkv_client::ClientResult<()> {
//! let client = KVClient::with_config(ClientConfig::from_env()?);
//! client.start().await?;
//!
//! let (mut stream, handle) = client.subscribe(&["orders"]).await?;
//! while let Some(item) = stream.recv().await {
//!     let message = item?;
//!     println!("{}: {:?}", message.channel, message.payload);
//! }
//! handle.close().await.ok();
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod pool;
mod pubsub;
mod resp;

pub use client::KVClient;
pub use config::{ClientConfig, PubSubConfig, ENV_HOST, ENV_PORT};
pub use error::{ClientError, ClientResult};
pub use pool::PoolStats;
pub use pubsub::{Message, MessageStream, SubscriptionHandle};
