//! # redsub
//!
//! A resilient Redis Pub/Sub connection: one long-lived connection that
//! multiplexes subscriptions from many in-process subscribers, reconnects
//! transparently with exponential backoff, and re-subscribes everything a
//! subscriber still wants after an outage.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Application Code                   │
//! │      PubSub handle + Subscriber streams         │
//! ├─────────────────────────────────────────────────┤
//! │     Connection driver (single task)             │
//! │     • Serial state machine, no locking          │
//! │     • Ledger: confirmed vs pending interest     │
//! │     • Registry: refs + death notifications      │
//! ├─────────────────────────────────────────────────┤
//! │     Wire (RESP via redis-protocol)              │
//! │     • (P)SUBSCRIBE / (P)UNSUBSCRIBE commands    │
//! │     • Push frame demultiplexing                 │
//! ├─────────────────────────────────────────────────┤
//! │     Connector (TCP bundled, TLS pluggable)      │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`PubSub`] | Cloneable handle: subscribe, unsubscribe, close |
//! | [`Subscriber`] | Identity + event stream for one consumer |
//! | [`Connector`] | Seam producing sockets (TCP, TLS, in-memory) |
//! | [`ConnectionConfig`] | Reconnection, backoff and logging knobs |
//!
//! ## Delivery semantics
//!
//! Pub/Sub is fire-and-forget: messages published while the connection is
//! down are lost. What survives a disconnect is *intent* — every subscriber
//! keeps its subscriptions and receives fresh `Subscribed` events once the
//! connection is re-established.
//!
//! ## Quick start
//!
//! ```no_run
//! use redsub::{ConnectionConfig, EventKind, PubSub, Subscriber};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pubsub = PubSub::connect(ConnectionConfig::new("127.0.0.1", 6379)).await?;
//!
//!     let (subscriber, mut events) = Subscriber::new();
//!     pubsub.subscribe(["news"], &subscriber).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event.kind {
//!             EventKind::Message { channel, payload } => {
//!                 println!("{:?}: {:?}", channel, payload);
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Connection configuration and lifecycle log levels.
pub mod config;

/// The connection driver and its public handle.
pub mod connection;

/// The connector seam producing sockets.
pub mod connector;

/// Error types.
pub mod error;

/// Subscriber handles and delivered events.
pub mod subscriber;

mod backoff;
mod ledger;
mod registry;
mod resp;

// Config exports
pub use config::{ConnectionConfig, LogConfig};

// Connection exports
pub use connection::PubSub;

// Connector exports
pub use connector::{Connector, TcpConnector, Transport};

// Error exports
pub use error::{ConnectError, RequestError, StartError, TransportError};
pub use resp::FrameError;

// Subscriber exports
pub use subscriber::{
    ConnectionId, Event, EventKind, EventStream, Subscriber, SubscriberId, SubscriberRef,
};
