//! Subscriber handles and the events delivered to them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an in-process subscriber.
///
/// Allocated when the [`Subscriber`] handle is created and used to key the
/// connection's registry and ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// Identity of one pub/sub connection, attached to every event so a
/// subscriber listening to several connections can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque token issued to a subscriber on its first subscribe and carried by
/// every event delivered to it afterwards.
///
/// Stable for as long as the subscriber holds any interest on the
/// connection; a subscriber that drops all interest and subscribes again
/// receives a fresh ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberRef(pub(crate) u64);

impl fmt::Display for SubscriberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref-{}", self.0)
    }
}

/// Receiving half of a subscriber's event endpoint.
pub type EventStream = mpsc::UnboundedReceiver<Event>;

/// Handle identifying an in-process consumer of pub/sub events.
///
/// Created together with its [`EventStream`]. Dropping the stream counts as
/// subscriber death: the connection removes all of the subscriber's interest
/// and unsubscribes orphaned targets from the server.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    sender: mpsc::UnboundedSender<Event>,
}

impl Subscriber {
    /// Create a subscriber handle and the stream its events arrive on.
    pub fn new() -> (Self, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber = Self {
            id: SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)),
            sender,
        };
        (subscriber, receiver)
    }

    /// This subscriber's stable identity.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn sender(&self) -> &mpsc::UnboundedSender<Event> {
        &self.sender
    }
}

/// An event delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Event {
    /// The connection that produced the event.
    pub connection: ConnectionId,

    /// The subscriber's ref on that connection.
    pub reference: SubscriberRef,

    /// What happened.
    pub kind: EventKind,
}

/// The kinds of events a subscriber can receive.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A channel subscription was confirmed by the server.
    Subscribed {
        /// The confirmed channel.
        channel: Bytes,
    },

    /// A pattern subscription was confirmed by the server.
    PSubscribed {
        /// The confirmed pattern.
        pattern: Bytes,
    },

    /// The subscriber's interest in a channel was dropped.
    Unsubscribed {
        /// The channel.
        channel: Bytes,
    },

    /// The subscriber's interest in a pattern was dropped.
    PUnsubscribed {
        /// The pattern.
        pattern: Bytes,
    },

    /// A message published to a subscribed channel.
    Message {
        /// The channel the message was published to.
        channel: Bytes,
        /// The published payload.
        payload: Bytes,
    },

    /// A message published to a channel matching a subscribed pattern.
    PMessage {
        /// The matching pattern.
        pattern: Bytes,
        /// The channel the message was published to.
        channel: Bytes,
        /// The published payload.
        payload: Bytes,
    },

    /// The connection to the server was lost (or is not yet established).
    /// Interest is preserved; subscription events follow once the connection
    /// is re-established.
    Disconnected {
        /// Why the connection is down.
        reason: TransportError,
    },
}
