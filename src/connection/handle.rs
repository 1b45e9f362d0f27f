//! The cloneable request handle callers use to talk to the driver task.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::core::{Command, Connection};
use crate::config::ConnectionConfig;
use crate::connector::{Connector, TcpConnector};
use crate::error::{RequestError, StartError};
use crate::ledger::TargetKind;
use crate::subscriber::{ConnectionId, Subscriber, SubscriberRef};

/// Handle to a running pub/sub connection.
///
/// Cheap to clone; every clone talks to the same driver task. The connection
/// stops when [`close`](PubSub::close) is called, when every handle is
/// dropped, or terminally per configuration (fatal connector error,
/// `exit_on_disconnection`).
#[derive(Debug, Clone)]
pub struct PubSub {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl PubSub {
    /// Start a connection over plain TCP.
    ///
    /// With `sync_connect` the initial connect is awaited and a failure
    /// fails start-up; otherwise the first attempt happens in the
    /// background. `ssl` requires a TLS-capable connector and is rejected
    /// here; use [`connect_with`](PubSub::connect_with).
    pub async fn connect(config: ConnectionConfig) -> Result<Self, StartError> {
        if config.ssl {
            return Err(StartError::TlsUnavailable);
        }
        Self::connect_with(config, TcpConnector::new()).await
    }

    /// Start a connection using a custom [`Connector`] (TLS, sentinel-aware
    /// discovery, in-memory transports for tests).
    pub async fn connect_with<C: Connector>(
        config: ConnectionConfig,
        connector: C,
    ) -> Result<Self, StartError> {
        let id = ConnectionId::next();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (deaths_tx, deaths_rx) = mpsc::unbounded_channel();

        let mut connection = Connection::new(id, config, connector, deaths_tx);
        if connection.sync_connect() {
            connection.connect_now().await?;
        } else {
            connection.kick();
        }

        tokio::spawn(async move {
            match connection.run(commands_rx, deaths_rx).await {
                Ok(()) => tracing::debug!(connection = %id, "connection driver stopped"),
                Err(reason) => {
                    tracing::error!(connection = %id, %reason, "connection driver terminated")
                }
            }
        });

        Ok(Self {
            id,
            commands: commands_tx,
        })
    }

    /// This connection's identity, as carried by every delivered event.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Subscribe `subscriber` to the given channels.
    ///
    /// Returns the subscriber's ref; resulting events (`Subscribed` once the
    /// server confirms, or `Disconnected` while the link is down) arrive on
    /// the subscriber's event stream afterwards. Subscribing to a channel
    /// the connection already has on the wire produces no extra wire
    /// traffic.
    pub async fn subscribe<I, B>(
        &self,
        channels: I,
        subscriber: &Subscriber,
    ) -> Result<SubscriberRef, RequestError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.request_subscribe(TargetKind::Channel, channels, subscriber)
            .await
    }

    /// Subscribe `subscriber` to the given glob patterns.
    pub async fn psubscribe<I, B>(
        &self,
        patterns: I,
        subscriber: &Subscriber,
    ) -> Result<SubscriberRef, RequestError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.request_subscribe(TargetKind::Pattern, patterns, subscriber)
            .await
    }

    /// Drop `subscriber`'s interest in the given channels. Channels it never
    /// subscribed to are ignored.
    pub async fn unsubscribe<I, B>(
        &self,
        channels: I,
        subscriber: &Subscriber,
    ) -> Result<(), RequestError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.request_unsubscribe(TargetKind::Channel, channels, subscriber)
            .await
    }

    /// Drop `subscriber`'s interest in the given glob patterns.
    pub async fn punsubscribe<I, B>(
        &self,
        patterns: I,
        subscriber: &Subscriber,
    ) -> Result<(), RequestError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.request_unsubscribe(TargetKind::Pattern, patterns, subscriber)
            .await
    }

    /// Stop the connection, waiting for the driver to acknowledge.
    /// Idempotent: closing an already-stopped connection is a no-op.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { ack: ack_tx })
            .is_err()
        {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Resolves once the driver task has stopped, for supervisors that want
    /// to observe terminal failures.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }

    async fn request_subscribe<I, B>(
        &self,
        kind: TargetKind,
        names: I,
        subscriber: &Subscriber,
    ) -> Result<SubscriberRef, RequestError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let names: Vec<Bytes> = names.into_iter().map(Into::into).collect();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                kind,
                names,
                subscriber: subscriber.clone(),
                reply: reply_tx,
            })
            .map_err(|_| RequestError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| RequestError::ConnectionClosed)
    }

    async fn request_unsubscribe<I, B>(
        &self,
        kind: TargetKind,
        names: I,
        subscriber: &Subscriber,
    ) -> Result<(), RequestError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let names: Vec<Bytes> = names.into_iter().map(Into::into).collect();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Unsubscribe {
                kind,
                names,
                subscriber: subscriber.id(),
                reply: reply_tx,
            })
            .map_err(|_| RequestError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| RequestError::ConnectionClosed)
    }
}
