//! Glue over the RESP codec.
//!
//! Framing and parsing belong to the `redis-protocol` crate; this module only
//! adds what the pub/sub connection needs on top of it: building the
//! `SUBSCRIBE`-family command arrays, resuming a parse across arbitrarily
//! chunked reads, and classifying the server push frames the subscription
//! protocol can produce.

use bytes::{Buf, Bytes, BytesMut};
use redis_protocol::resp2::decode::decode;
use redis_protocol::resp2::encode::encode_bytes;
use redis_protocol::resp2::types::Frame as Resp2Frame;

/// Errors produced while encoding commands or classifying server frames.
///
/// Any of these on a live connection is a protocol violation and tears the
/// connection down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The server sent something other than the array shape pub/sub pushes
    /// use.
    #[error("push frame is not an array")]
    NotAnArray,

    /// The first array element named a message kind this protocol does not
    /// define.
    #[error("unknown push frame kind: {0}")]
    UnknownKind(String),

    /// The frame had the wrong arity or element types for its kind.
    #[error("malformed push frame: {0}")]
    Malformed(&'static str),

    /// The byte stream violated RESP itself.
    #[error("resp decode error: {0}")]
    Decode(String),

    /// A command array could not be encoded.
    #[error("resp encode error: {0}")]
    Encode(String),
}

/// Which wire operation a command write performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireOp {
    Subscribe,
    Unsubscribe,
}

impl WireOp {
    fn channel_verb(self) -> &'static [u8] {
        match self {
            WireOp::Subscribe => b"SUBSCRIBE",
            WireOp::Unsubscribe => b"UNSUBSCRIBE",
        }
    }

    fn pattern_verb(self) -> &'static [u8] {
        match self {
            WireOp::Subscribe => b"PSUBSCRIBE",
            WireOp::Unsubscribe => b"PUNSUBSCRIBE",
        }
    }
}

/// Encode the channel and pattern halves of one request as up to two RESP
/// array commands in a single buffer, ready for a single transport write.
///
/// Empty halves emit nothing; an entirely empty request yields an empty
/// buffer.
pub(crate) fn command_payload(
    op: WireOp,
    channels: &[Bytes],
    patterns: &[Bytes],
) -> Result<Bytes, FrameError> {
    let mut payload = BytesMut::new();
    if !channels.is_empty() {
        encode_command(&mut payload, op.channel_verb(), channels)?;
    }
    if !patterns.is_empty() {
        encode_command(&mut payload, op.pattern_verb(), patterns)?;
    }
    Ok(payload.freeze())
}

/// Encode one `VERB name...` command as an array of bulk strings.
fn encode_command(out: &mut BytesMut, verb: &'static [u8], names: &[Bytes]) -> Result<(), FrameError> {
    let mut items = Vec::with_capacity(names.len() + 1);
    items.push(Resp2Frame::BulkString(Bytes::from_static(verb)));
    for name in names {
        items.push(Resp2Frame::BulkString(name.clone()));
    }
    let frame = Resp2Frame::Array(items);

    let mut encoded = BytesMut::new();
    encode_bytes(&mut encoded, &frame).map_err(|error| FrameError::Encode(error.to_string()))?;
    out.extend_from_slice(&encoded);
    Ok(())
}

/// A server push frame, classified.
///
/// The confirmation kinds carry the remaining-subscription count Redis
/// reports; the connection only logs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PushFrame {
    Subscribed { channel: Bytes, remaining: i64 },
    Unsubscribed { channel: Bytes, remaining: i64 },
    PSubscribed { pattern: Bytes, remaining: i64 },
    PUnsubscribed { pattern: Bytes, remaining: i64 },
    Message { channel: Bytes, payload: Bytes },
    PMessage { pattern: Bytes, channel: Bytes, payload: Bytes },
}

/// Classify a decoded frame as one of the six pub/sub push kinds.
///
/// Anything else is a protocol error: a subscription-mode connection can
/// receive nothing but these.
pub(crate) fn decode_push(frame: Resp2Frame) -> Result<PushFrame, FrameError> {
    let items = match frame {
        Resp2Frame::Array(items) => items,
        _ => return Err(FrameError::NotAnArray),
    };
    if items.len() < 3 {
        return Err(FrameError::Malformed("fewer than three elements"));
    }

    let kind = string_of(&items[0])?;
    match &kind[..] {
        b"subscribe" => Ok(PushFrame::Subscribed {
            channel: string_of(&items[1])?,
            remaining: integer_of(&items[2])?,
        }),
        b"unsubscribe" => Ok(PushFrame::Unsubscribed {
            channel: string_of(&items[1])?,
            remaining: integer_of(&items[2])?,
        }),
        b"psubscribe" => Ok(PushFrame::PSubscribed {
            pattern: string_of(&items[1])?,
            remaining: integer_of(&items[2])?,
        }),
        b"punsubscribe" => Ok(PushFrame::PUnsubscribed {
            pattern: string_of(&items[1])?,
            remaining: integer_of(&items[2])?,
        }),
        b"message" => Ok(PushFrame::Message {
            channel: string_of(&items[1])?,
            payload: string_of(&items[2])?,
        }),
        b"pmessage" => {
            if items.len() < 4 {
                return Err(FrameError::Malformed("pmessage with fewer than four elements"));
            }
            Ok(PushFrame::PMessage {
                pattern: string_of(&items[1])?,
                channel: string_of(&items[2])?,
                payload: string_of(&items[3])?,
            })
        }
        other => Err(FrameError::UnknownKind(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

fn string_of(frame: &Resp2Frame) -> Result<Bytes, FrameError> {
    match frame {
        Resp2Frame::BulkString(data) | Resp2Frame::SimpleString(data) => Ok(data.clone()),
        _ => Err(FrameError::Malformed("expected a string element")),
    }
}

fn integer_of(frame: &Resp2Frame) -> Result<i64, FrameError> {
    match frame {
        Resp2Frame::Integer(value) => Ok(*value),
        _ => Err(FrameError::Malformed("expected an integer element")),
    }
}

/// Resumable parse state across chunked reads.
///
/// Bytes arrive in arbitrary slices; `append` accumulates them and
/// `next_frame` yields complete frames as they become available, leaving any
/// trailing partial frame buffered for the next read.
#[derive(Debug, Default)]
pub(crate) struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the next complete frame, or `None` if more bytes are needed.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Resp2Frame>, FrameError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let snapshot = Bytes::copy_from_slice(&self.buf);
        match decode(&snapshot) {
            Ok(Some((frame, consumed))) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(error) => Err(FrameError::Decode(error.to_string())),
        }
    }
}
