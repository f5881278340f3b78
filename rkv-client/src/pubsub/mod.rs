//! # Pub/Sub Subscriptions
//!
//! Purpose: Turn one dedicated connection into an asynchronous message stream
//! with liveness monitoring and safe teardown.
//!
//! ## Design Principles
//! 1. **Dedicated Connection**: A subscription detaches its connection from the
//!    pool; it is never shared while subscribed.
//! 2. **Two Background Tasks**: The receiver reads push frames, the keepalive
//!    probes with PING. Both stop on one explicit `watch` signal.
//! 3. **Single Guarded State**: The write half sits behind an `Open/Closed`
//!    mutex that every actor goes through; teardown happens exactly once.
//! 4. **Errors as Items**: After `subscribe` returns, failures arrive on the
//!    stream as a terminal `Err` item; nothing is retried.
//! 5. **Blocking Delivery**: A full stream blocks producers; publishes are
//!    never dropped.
//!
//! ## Structure Overview
//!
//! ```text
//! KVClient::subscribe
//!   ├── handshake (SUBSCRIBE + wait for every confirmation)
//!   ├── receiver::run  ── FrameReader ──► mpsc ──► MessageStream
//!   ├── keepalive::run ── Link::send(PING) ─┘
//!   └── SubscriptionHandle ── Link { Mutex<Open{FrameWriter, PoolSlot} | Closed>,
//!                                    stop: watch<bool> }
//! ```

mod frame;
mod handle;
mod keepalive;
mod receiver;

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::PubSubConfig;
use crate::connection::{with_deadline, FrameReader};
use crate::error::{ClientError, ClientResult};
use crate::pool::ConnectionPool;

use frame::{CountKind, PushFrame};
use handle::{command, Link};

pub use handle::SubscriptionHandle;

/// A publish delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the payload was published on.
    pub channel: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// Ordered stream of delivered publishes.
///
/// An `Err` item is terminal (`ConnectionLost` or `LivenessCheckFailed`).
/// `recv` returns `None` once the subscription has ended, whether by error,
/// `close`, or unsubscribing every channel.
pub struct MessageStream {
    rx: mpsc::Receiver<ClientResult<Message>>,
}

impl MessageStream {
    /// Waits for the next item.
    pub async fn recv(&mut self) -> Option<ClientResult<Message>> {
        self.rx.recv().await
    }

    /// Returns an item if one is already queued.
    pub fn try_recv(&mut self) -> Option<ClientResult<Message>> {
        self.rx.try_recv().ok()
    }
}

/// Opens a subscription on a connection detached from `pool`.
///
/// Returns once the server has confirmed every requested channel. Duplicate
/// channel names are collapsed, keeping first-seen order.
pub(crate) async fn subscribe(
    pool: &ConnectionPool,
    config: &PubSubConfig,
    channels: &[&str],
) -> ClientResult<(MessageStream, SubscriptionHandle)> {
    let mut unique: Vec<&str> = Vec::with_capacity(channels.len());
    for channel in channels {
        if !unique.contains(channel) {
            unique.push(*channel);
        }
    }

    let dedicated = pool
        .acquire()
        .await
        .and_then(|conn| conn.detach())
        .map_err(|err| ClientError::SubscribeFailed(Box::new(err)))?;
    let (conn, slot) = dedicated.into_parts();
    let (mut reader, mut writer) = conn.into_split();

    debug!(channels = ?unique, "subscribing");
    let mut early = VecDeque::new();
    let confirm = async {
        writer.send(&command(b"SUBSCRIBE", &unique)).await?;
        handshake(&mut reader, unique.len().max(1), &mut early).await
    };
    // On failure the connection halves and the slot drop here, releasing it.
    let active = with_deadline(Some(config.handshake_timeout), confirm)
        .await
        .map_err(|err| ClientError::SubscribeFailed(Box::new(err)))?;

    let link = Arc::new(Link::new(writer, slot, active, config.write_timeout));
    let (tx, rx) = mpsc::channel(config.message_buffer.max(1));
    if !config.keepalive_interval.is_zero() {
        tokio::spawn(keepalive::run(
            link.clone(),
            tx.clone(),
            config.keepalive_interval,
            config.probe_timeout,
        ));
    }
    tokio::spawn(receiver::run(reader, link.clone(), tx, early));
    debug!(active, "subscription established");

    Ok((MessageStream { rx }, SubscriptionHandle::new(link)))
}

/// Reads frames until `expected` subscribe confirmations have arrived.
///
/// Publishes that race the confirmations are kept for delivery.
async fn handshake(
    reader: &mut FrameReader,
    expected: usize,
    early: &mut VecDeque<Message>,
) -> ClientResult<usize> {
    let mut confirmed = 0;
    let mut active = 0;
    while confirmed < expected {
        match PushFrame::classify(reader.read_value().await?)? {
            PushFrame::Count {
                kind: CountKind::Subscribe,
                count,
                ..
            } => {
                confirmed += 1;
                active = count;
            }
            PushFrame::Message(message) => early.push_back(message),
            PushFrame::Error(message) => return Err(ClientError::Server { message }),
            PushFrame::Count { .. } | PushFrame::Pong | PushFrame::Ignored => {}
        }
    }
    Ok(active)
}
