//! Shared subscription link and the consumer-facing `SubscriptionHandle`.
//!
//! The write half of the dedicated connection lives in `LinkState::Open`
//! behind one async mutex. The receiver task, the keepalive task and the
//! handle all go through it, and teardown swaps it to `Closed` under the lock,
//! so exactly one caller tears the connection down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::connection::{with_deadline, FrameWriter};
use crate::error::{ClientError, ClientResult};
use crate::pool::PoolSlot;

enum LinkState {
    Open { writer: FrameWriter, slot: PoolSlot },
    Closed,
}

/// State shared by the handle and both background tasks.
pub(crate) struct Link {
    state: Mutex<LinkState>,
    /// Bound on every write made while holding `state`.
    write_timeout: Duration,
    /// Set once when the subscription must wind down.
    stop: watch::Sender<bool>,
    /// Subscription count last reported by the server.
    active: watch::Sender<usize>,
    /// Bumped for every frame the receiver reads.
    heard: watch::Sender<u64>,
    /// True while the receiver is parked on a full message stream.
    delivering: watch::Sender<bool>,
}

impl Link {
    pub(crate) fn new(
        writer: FrameWriter,
        slot: PoolSlot,
        active: usize,
        write_timeout: Duration,
    ) -> Self {
        Link {
            state: Mutex::new(LinkState::Open { writer, slot }),
            write_timeout,
            stop: watch::channel(false).0,
            active: watch::channel(active).0,
            heard: watch::channel(0).0,
            delivering: watch::channel(false).0,
        }
    }

    /// Writes a command if the link is still open.
    pub(crate) async fn send(&self, args: &[&[u8]]) -> ClientResult<()> {
        self.send_within(args, self.write_timeout).await
    }

    /// Like `send`, with an explicit bound on the write.
    pub(crate) async fn send_within(&self, args: &[&[u8]], limit: Duration) -> ClientResult<()> {
        let mut state = self.state.lock().await;
        match &mut *state {
            LinkState::Open { writer, .. } => with_deadline(Some(limit), writer.send(args)).await,
            LinkState::Closed => Err(ClientError::NotConnected),
        }
    }

    /// Closes the link exactly once.
    ///
    /// With `unsubscribe` set, an UNSUBSCRIBE for every channel is written
    /// before the write half is shut down. Both writes are bounded, so a peer
    /// that stopped reading cannot hold the lock. Later callers get
    /// `NotConnected`.
    pub(crate) async fn teardown(&self, unsubscribe: bool) -> ClientResult<()> {
        let mut state = self.state.lock().await;
        let (mut writer, slot) = match std::mem::replace(&mut *state, LinkState::Closed) {
            LinkState::Open { writer, slot } => (writer, slot),
            LinkState::Closed => return Err(ClientError::NotConnected),
        };

        let limit = Some(self.write_timeout);
        let sent = if unsubscribe {
            with_deadline(limit, writer.send(&[b"UNSUBSCRIBE"])).await
        } else {
            Ok(())
        };
        let shutdown = with_deadline(limit, writer.shutdown()).await;
        drop(writer);
        drop(slot);

        // Signalled while still holding the lock: anyone who observes
        // `Closed` also observes the stop request.
        self.stop.send_replace(true);
        debug!("subscription link closed");
        sent.and(shutdown)
    }

    pub(crate) async fn is_open(&self) -> bool {
        matches!(*self.state.lock().await, LinkState::Open { .. })
    }

    /// Asks the background tasks to wind down without tearing down here.
    pub(crate) fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub(crate) fn set_active(&self, count: usize) {
        self.active.send_replace(count);
    }

    pub(crate) fn active(&self) -> usize {
        *self.active.borrow()
    }

    pub(crate) fn record_activity(&self) {
        self.heard.send_modify(|seen| *seen = seen.wrapping_add(1));
    }

    pub(crate) fn activity_signal(&self) -> watch::Receiver<u64> {
        self.heard.subscribe()
    }

    pub(crate) fn set_delivering(&self, parked: bool) {
        self.delivering.send_if_modified(|current| {
            let changed = *current != parked;
            *current = parked;
            changed
        });
    }

    pub(crate) fn delivering_signal(&self) -> watch::Receiver<bool> {
        self.delivering.subscribe()
    }
}

/// Controls one subscription returned by `KVClient::subscribe`.
///
/// Dropping the handle winds the subscription down as if `close` had been
/// called, except that errors go unreported.
pub struct SubscriptionHandle {
    link: Arc<Link>,
}

impl SubscriptionHandle {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        SubscriptionHandle { link }
    }

    /// Subscribes to additional channels on the same connection.
    pub async fn subscribe(&self, channels: &[&str]) -> ClientResult<()> {
        self.link.send(&command(b"SUBSCRIBE", channels)).await
    }

    /// Unsubscribes from `channels`, or from every channel when empty.
    ///
    /// Once the server reports zero remaining channels the message stream
    /// ends without an error item.
    pub async fn unsubscribe(&self, channels: &[&str]) -> ClientResult<()> {
        self.link.send(&command(b"UNSUBSCRIBE", channels)).await
    }

    /// Unsubscribes from everything and releases the connection.
    ///
    /// Returns `NotConnected` if the subscription is already closed, whether
    /// by an earlier `close`, a drained unsubscribe, or a failed keepalive.
    pub async fn close(&self) -> ClientResult<()> {
        self.link.teardown(true).await
    }

    /// True once the subscription has been torn down or asked to stop.
    pub fn is_closed(&self) -> bool {
        self.link.is_stopping()
    }

    /// Channel count most recently confirmed by the server.
    pub fn active_channels(&self) -> usize {
        self.link.active()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.link.request_stop();
    }
}

pub(crate) fn command<'a>(name: &'a [u8], channels: &'a [&str]) -> Vec<&'a [u8]> {
    let mut args = Vec::with_capacity(channels.len() + 1);
    args.push(name);
    args.extend(channels.iter().map(|channel| channel.as_bytes()));
    args
}
