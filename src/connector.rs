//! The connector seam: how sockets are produced.
//!
//! Establishing the socket is not the connection's concern. A [`Connector`]
//! turns configuration into an open stream plus the peer address; the
//! bundled [`TcpConnector`] speaks plain TCP, while TLS or sentinel-aware
//! connectors are supplied by the application. Tests inject in-memory
//! streams through the same seam.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::ConnectionConfig;
use crate::error::ConnectError;

/// Transport tag carried by disconnect reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP.
    Tls,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Tls => write!(f, "ssl"),
        }
    }
}

/// Produces open sockets for the connection driver.
///
/// Implementations handle everything up to and including the handshake
/// (address resolution, TLS, sentinel lookup, authentication) and hand back
/// a framed byte stream. Returning [`ConnectError::Fatal`] stops the driver
/// permanently; any other error is retried under backoff.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The stream type produced by this connector.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// The transport tag for sockets produced by this connector.
    fn transport(&self) -> Transport;

    /// Open a connection as described by `config`.
    async fn connect(&self, config: &ConnectionConfig)
        -> Result<(Self::Stream, SocketAddr), ConnectError>;
}

/// Plain TCP connector.
///
/// Ignores `config.sentinel`; sentinel-based discovery belongs to a
/// dedicated connector.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    /// Create a plain TCP connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(Self::Stream, SocketAddr), ConnectError> {
        let stream = TcpStream::connect(config.address()).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok((stream, peer))
    }
}
