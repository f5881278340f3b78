//! Background task probing a subscription connection with PING.
//!
//! The reply arrives on the read half, so the receiver task observes it and
//! bumps an activity counter; this task only writes the probe and waits for
//! the bump. Any frame read after the probe counts, since replies queue behind
//! publishes already on the wire.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::{ClientError, ClientResult};
use crate::pubsub::handle::Link;
use crate::pubsub::Message;

pub(crate) async fn run(
    link: Arc<Link>,
    tx: mpsc::Sender<ClientResult<Message>>,
    interval: Duration,
    probe_timeout: Duration,
) {
    let mut stop = link.stop_signal();
    let mut heard = link.activity_signal();
    let mut delivering = link.delivering_signal();
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return,
            _ = ticker.tick() => {}
        }

        // Forget frames read before this probe was written.
        heard.borrow_and_update();

        // The write is not raced against stop: abandoning it halfway would
        // leave a partial command on the wire. It is bounded by the probe
        // timeout instead, and a write that cannot finish fails the probe.
        if let Err(err) = link.send_within(&[b"PING"], probe_timeout).await {
            match err {
                ClientError::NotConnected => return,
                err => return fail(&link, &tx, &mut stop, err).await,
            }
        }

        let answered = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return,
            answered = await_answer(&mut heard, &mut delivering, probe_timeout) => answered,
        };
        if !answered {
            return fail(&link, &tx, &mut stop, ClientError::Timeout).await;
        }
        trace!("keepalive probe answered");
    }
}

/// Waits for the receiver to read any frame, up to `probe_timeout`.
///
/// While the receiver is parked on a full stream it cannot read the reply,
/// so the clock is suspended and restarts once delivery resumes.
async fn await_answer(
    heard: &mut watch::Receiver<u64>,
    delivering: &mut watch::Receiver<bool>,
    probe_timeout: Duration,
) -> bool {
    let mut deadline = Instant::now() + probe_timeout;
    loop {
        if *delivering.borrow_and_update() {
            trace!("receiver parked on delivery, pausing probe clock");
            if delivering.wait_for(|parked| !*parked).await.is_err() {
                return true;
            }
            deadline = Instant::now() + probe_timeout;
        }

        tokio::select! {
            _ = heard.changed() => return true,
            changed = delivering.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
            _ = time::sleep_until(deadline) => return false,
        }
    }
}

/// Publishes the single liveness error, then tears the link down.
async fn fail(
    link: &Link,
    tx: &mpsc::Sender<ClientResult<Message>>,
    stop: &mut watch::Receiver<bool>,
    cause: ClientError,
) {
    warn!(error = %cause, "keepalive probe failed");
    let item = Err(ClientError::LivenessCheckFailed(Box::new(cause)));
    tokio::select! {
        biased;
        _ = stop.wait_for(|stopped| *stopped) => {}
        _ = tx.send(item) => {}
    }
    if link.teardown(true).await.is_ok() {
        debug!("subscription closed after failed keepalive");
    }
}
