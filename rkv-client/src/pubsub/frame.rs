//! Classification of RESP2 push frames received on a subscribed connection.

use bytes::Bytes;

use crate::error::{ClientError, ClientResult};
use crate::pubsub::Message;
use crate::resp::RespValue;

/// Which command a subscription-count frame acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CountKind {
    Subscribe,
    Unsubscribe,
}

/// One frame of the push protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PushFrame {
    /// A publish delivered on a subscribed channel.
    Message(Message),
    /// Acknowledgement reporting how many channels remain subscribed.
    Count {
        kind: CountKind,
        channel: String,
        count: usize,
    },
    /// Reply to a keepalive PING.
    Pong,
    /// Error reply from the server.
    Error(Vec<u8>),
    /// Frames this client never asks for (pattern acks and the like).
    Ignored,
}

impl PushFrame {
    pub(crate) fn classify(value: RespValue) -> ClientResult<Self> {
        let items = match value {
            RespValue::Array(items) => items,
            RespValue::Error(message) => return Ok(PushFrame::Error(message)),
            RespValue::Simple(text) if text.eq_ignore_ascii_case(b"PONG") => {
                return Ok(PushFrame::Pong)
            }
            _ => return Err(ClientError::Protocol),
        };

        let mut items = items.into_iter();
        let kind = match items.next() {
            Some(RespValue::Bulk(Some(kind))) => kind,
            _ => return Err(ClientError::Protocol),
        };

        match kind.to_ascii_lowercase().as_slice() {
            b"message" => {
                let channel = channel_name(items.next())?;
                let payload = bulk(items.next())?;
                Ok(PushFrame::Message(Message {
                    channel,
                    payload: Bytes::from(payload),
                }))
            }
            b"pmessage" => {
                let _pattern = bulk(items.next())?;
                let channel = channel_name(items.next())?;
                let payload = bulk(items.next())?;
                Ok(PushFrame::Message(Message {
                    channel,
                    payload: Bytes::from(payload),
                }))
            }
            b"subscribe" => count_frame(CountKind::Subscribe, items.next(), items.next()),
            b"unsubscribe" => count_frame(CountKind::Unsubscribe, items.next(), items.next()),
            b"pong" => Ok(PushFrame::Pong),
            _ => Ok(PushFrame::Ignored),
        }
    }
}

fn count_frame(
    kind: CountKind,
    channel: Option<RespValue>,
    count: Option<RespValue>,
) -> ClientResult<PushFrame> {
    // UNSUBSCRIBE with nothing subscribed acknowledges a null channel.
    let channel = match channel {
        Some(RespValue::Bulk(None)) => String::new(),
        other => channel_name(other)?,
    };
    let count = match count {
        Some(RespValue::Integer(count)) if count >= 0 => count as usize,
        _ => return Err(ClientError::Protocol),
    };
    Ok(PushFrame::Count {
        kind,
        channel,
        count,
    })
}

fn bulk(value: Option<RespValue>) -> ClientResult<Vec<u8>> {
    match value {
        Some(RespValue::Bulk(Some(data))) => Ok(data),
        _ => Err(ClientError::Protocol),
    }
}

fn channel_name(value: Option<RespValue>) -> ClientResult<String> {
    String::from_utf8(bulk(value)?).map_err(|_| ClientError::Protocol)
}
