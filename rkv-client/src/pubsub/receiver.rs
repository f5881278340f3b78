//! Background task that owns the read half of a subscription connection and
//! turns push frames into stream items.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::connection::FrameReader;
use crate::error::{ClientError, ClientResult};
use crate::pubsub::frame::{CountKind, PushFrame};
use crate::pubsub::handle::Link;
use crate::pubsub::Message;

/// Why the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Stop was signalled (close, keepalive teardown or handle dropped).
    Stopped,
    /// The server reported zero remaining subscriptions.
    Drained,
    /// The connection failed; the error item was already published.
    Failed,
    /// The consumer dropped the message stream.
    Abandoned,
}

pub(crate) async fn run(
    mut reader: FrameReader,
    link: Arc<Link>,
    tx: mpsc::Sender<ClientResult<Message>>,
    early: VecDeque<Message>,
) {
    let mut stop = link.stop_signal();
    let exit = receive_loop(&mut reader, &link, &tx, &mut stop, early).await;
    debug!(?exit, "subscription receiver finished");

    // Teardown is idempotent; whoever got there first already released the
    // connection. After a drain the server has nothing left to unsubscribe.
    let unsubscribe = matches!(exit, Exit::Stopped | Exit::Abandoned);
    let _ = link.teardown(unsubscribe).await;
}

async fn receive_loop(
    reader: &mut FrameReader,
    link: &Link,
    tx: &mpsc::Sender<ClientResult<Message>>,
    stop: &mut watch::Receiver<bool>,
    early: VecDeque<Message>,
) -> Exit {
    for message in early {
        if let Some(exit) = deliver(link, tx, stop, Ok(message)).await {
            return exit;
        }
    }

    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return Exit::Stopped,
            value = reader.read_value() => value.and_then(PushFrame::classify),
        };
        if frame.is_ok() {
            // Any frame proves the connection alive, not only a pong.
            link.record_activity();
        }

        let failure = match frame {
            Ok(PushFrame::Message(message)) => {
                trace!(channel = %message.channel, len = message.payload.len(), "message received");
                if let Some(exit) = deliver(link, tx, stop, Ok(message)).await {
                    return exit;
                }
                continue;
            }
            Ok(PushFrame::Count {
                kind,
                channel,
                count,
            }) => {
                trace!(?kind, %channel, count, "subscription count");
                link.set_active(count);
                if kind == CountKind::Unsubscribe && count == 0 {
                    return Exit::Drained;
                }
                continue;
            }
            Ok(PushFrame::Pong) | Ok(PushFrame::Ignored) => continue,
            Ok(PushFrame::Error(message)) => ClientError::Server { message },
            Err(err) => err,
        };

        // A read failing because someone else closed the link is not an error.
        if !link.is_open().await {
            return Exit::Stopped;
        }
        warn!(error = %failure, "subscription connection lost");
        let item = Err(ClientError::ConnectionLost(Box::new(failure)));
        return deliver(link, tx, stop, item).await.unwrap_or(Exit::Failed);
    }
}

/// Blocking send that gives up only when stop is signalled.
///
/// While the stream is full the link is flagged as delivering, which pauses
/// the keepalive probe clock. Returns `Some(exit)` when the loop must end.
async fn deliver(
    link: &Link,
    tx: &mpsc::Sender<ClientResult<Message>>,
    stop: &mut watch::Receiver<bool>,
    item: ClientResult<Message>,
) -> Option<Exit> {
    let item = match tx.try_send(item) {
        Ok(()) => return None,
        Err(TrySendError::Closed(_)) => return Some(Exit::Abandoned),
        Err(TrySendError::Full(item)) => item,
    };

    link.set_delivering(true);
    let exit = tokio::select! {
        biased;
        _ = stop.wait_for(|stopped| *stopped) => Some(Exit::Stopped),
        sent = tx.send(item) => match sent {
            Ok(()) => None,
            Err(_) => Some(Exit::Abandoned),
        },
    };
    link.set_delivering(false);
    exit
}
