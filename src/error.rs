//! Error types for connection establishment and transport failures.

use std::io;

use crate::connector::Transport;
use crate::resp::FrameError;

/// Errors reported by a [`Connector`](crate::connector::Connector) while
/// establishing a connection.
///
/// Ordinary failures (`Io`, `Timeout`) are retried under backoff. A `Fatal`
/// error stops the connection driver permanently.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// The connect attempt failed (DNS, refused, TLS handshake, ...).
    #[error("connect failed: {message}")]
    Io {
        /// Details about the failure.
        message: String,
    },

    /// The connect attempt did not complete within the configured timeout.
    #[error("connect attempt timed out")]
    Timeout,

    /// The connector reported an unrecoverable condition. The driver stops
    /// instead of retrying.
    #[error("fatal connector error: {reason}")]
    Fatal {
        /// Why the connector gave up.
        reason: String,
    },
}

impl From<io::Error> for ConnectError {
    fn from(error: io::Error) -> Self {
        ConnectError::Io {
            message: error.to_string(),
        }
    }
}

/// Reasons an established connection was lost.
///
/// Delivered to every registered subscriber inside
/// [`EventKind::Disconnected`](crate::subscriber::EventKind::Disconnected),
/// so the type is `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The server closed the socket.
    #[error("{transport} connection closed by peer")]
    Closed {
        /// Which transport the socket was using.
        transport: Transport,
    },

    /// A read or write on the socket failed.
    #[error("{transport} i/o error: {message}")]
    Io {
        /// Which transport the socket was using.
        transport: Transport,
        /// Details about the failure.
        message: String,
    },

    /// The server sent a frame the pub/sub protocol does not allow.
    #[error(transparent)]
    Protocol(#[from] FrameError),

    /// A connect attempt failed in a way that stops the driver.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// No connection has been established yet.
    #[error("connection not yet established")]
    NotConnected,
}

/// Errors returned by [`PubSub::connect`](crate::connection::PubSub::connect).
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The synchronous initial connect failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// `ssl` was requested but the bundled connector only speaks plain TCP.
    /// Supply a TLS-capable [`Connector`](crate::connector::Connector) via
    /// [`PubSub::connect_with`](crate::connection::PubSub::connect_with).
    #[error("ssl requested but the bundled connector is tcp-only")]
    TlsUnavailable,
}

/// Errors returned by the request methods on
/// [`PubSub`](crate::connection::PubSub).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// The connection driver task is no longer running, either after
    /// [`close`](crate::connection::PubSub::close), a fatal connector error,
    /// or an `exit_on_disconnection` shutdown.
    #[error("connection task is no longer running")]
    ConnectionClosed,
}
