//! The connection driver: a single task owning socket, ledger and registry.
//!
//! One `select!` loop merges the four event sources — caller commands,
//! subscriber deaths, socket reads and the reconnect timer — into a serial
//! stream. Exactly one event is processed to completion at a time, so the
//! ledger and registry need no locking.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use redis_protocol::resp2::types::Frame as Resp2Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};

use crate::backoff::Backoff;
use crate::config::ConnectionConfig;
use crate::connector::Connector;
use crate::error::{ConnectError, TransportError};
use crate::ledger::{split_targets, Ledger, Target, TargetKind};
use crate::registry::SubscriberRegistry;
use crate::resp::{self, FrameBuffer, PushFrame, WireOp};
use crate::subscriber::{ConnectionId, EventKind, Subscriber, SubscriberId, SubscriberRef};

/// Emit a tracing event at a level chosen at runtime.
macro_rules! log_event {
    ($level:expr, $($arg:tt)+) => {{
        let level = $level;
        if level == tracing::Level::ERROR {
            tracing::error!($($arg)+)
        } else if level == tracing::Level::WARN {
            tracing::warn!($($arg)+)
        } else if level == tracing::Level::INFO {
            tracing::info!($($arg)+)
        } else if level == tracing::Level::DEBUG {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    }};
}

/// Requests sent from [`PubSub`](super::PubSub) handles to the driver.
pub(crate) enum Command {
    /// Record interest and subscribe new targets on the wire.
    Subscribe {
        kind: TargetKind,
        names: Vec<Bytes>,
        subscriber: Subscriber,
        reply: oneshot::Sender<SubscriberRef>,
    },

    /// Drop interest and unsubscribe orphaned targets on the wire.
    Unsubscribe {
        kind: TargetKind,
        names: Vec<Bytes>,
        subscriber: SubscriberId,
        reply: oneshot::Sender<()>,
    },

    /// Stop the driver.
    Shutdown { ack: oneshot::Sender<()> },
}

/// Connected-state resources: the socket, the parse continuation and the
/// peer address. Exists only while connected.
struct Link<S> {
    stream: S,
    buffer: FrameBuffer,
    peer: SocketAddr,
}

/// The connection state machine.
pub(crate) struct Connection<C: Connector> {
    id: ConnectionId,
    config: ConnectionConfig,
    connector: C,
    ledger: Ledger,
    registry: SubscriberRegistry,
    backoff: Backoff,
    link: Option<Link<C::Stream>>,
    /// When to fire the next reconnect attempt. Only meaningful while
    /// disconnected.
    next_attempt: Option<Instant>,
    /// Reason for the most recent disconnect, handed to subscribers that
    /// subscribe while the connection is down.
    last_error: Option<TransportError>,
}

impl<C: Connector> Connection<C> {
    pub(crate) fn new(
        id: ConnectionId,
        config: ConnectionConfig,
        connector: C,
        deaths: mpsc::UnboundedSender<SubscriberId>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        Self {
            id,
            config,
            connector,
            ledger: Ledger::new(),
            registry: SubscriberRegistry::new(id, deaths),
            backoff,
            link: None,
            next_attempt: None,
            last_error: None,
        }
    }

    pub(crate) fn sync_connect(&self) -> bool {
        self.config.sync_connect
    }

    /// Perform the start-up connect for `sync_connect`; a failure here fails
    /// start-up instead of entering the retry loop.
    pub(crate) async fn connect_now(&mut self) -> Result<(), ConnectError> {
        self.connect_once().await
    }

    /// Schedule the first connect attempt for as soon as the driver runs.
    pub(crate) fn kick(&mut self) {
        self.next_attempt = Some(Instant::now());
    }

    /// Drive the connection until shutdown or a terminal failure.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut deaths: mpsc::UnboundedReceiver<SubscriberId>,
    ) -> Result<(), TransportError> {
        loop {
            let retry_at = if self.link.is_none() {
                self.next_attempt
            } else {
                None
            };

            tokio::select! {
                maybe = commands.recv() => match maybe {
                    Some(Command::Shutdown { ack }) => {
                        tracing::debug!(connection = %self.id, "shutdown requested");
                        let _ = ack.send(());
                        return Ok(());
                    }
                    Some(command) => self.handle_command(command).await?,
                    // Every handle is gone; nobody can issue requests again.
                    None => return Ok(()),
                },
                Some(dead) = deaths.recv() => self.handle_death(dead).await?,
                result = read_some(&mut self.link) => self.handle_read(result).await?,
                _ = wait_until(retry_at) => {
                    self.next_attempt = None;
                    self.attempt_connect().await?;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), TransportError> {
        match command {
            Command::Subscribe {
                kind,
                names,
                subscriber,
                reply,
            } => self.handle_subscribe(kind, names, subscriber, reply).await,
            Command::Unsubscribe {
                kind,
                names,
                subscriber,
                reply,
            } => self.handle_unsubscribe(kind, names, subscriber, reply).await,
            // Intercepted by the driver loop before it gets here.
            Command::Shutdown { ack } => {
                let _ = ack.send(());
                Ok(())
            }
        }
    }

    async fn handle_subscribe(
        &mut self,
        kind: TargetKind,
        names: Vec<Bytes>,
        subscriber: Subscriber,
        reply: oneshot::Sender<SubscriberRef>,
    ) -> Result<(), TransportError> {
        let who = subscriber.id();
        let reference = self.registry.acquire(&subscriber);
        let targets: Vec<Target> = names.into_iter().map(|name| kind.target(name)).collect();
        let outcome = self.ledger.add_interest(targets, who);

        // The caller gets its ref before any event reaches it.
        let _ = reply.send(reference);

        if self.link.is_some() {
            for target in &outcome.already_confirmed {
                self.registry.notify(who, confirmed_event(target));
            }
            let (channels, patterns) = split_targets(outcome.to_wire);
            self.send_wire(WireOp::Subscribe, channels, patterns).await
        } else {
            // Interest is recorded in pending and will be subscribed on
            // reconnect; tell the subscriber the link is currently down.
            self.registry.notify(
                who,
                EventKind::Disconnected {
                    reason: self.current_outage(),
                },
            );
            Ok(())
        }
    }

    async fn handle_unsubscribe(
        &mut self,
        kind: TargetKind,
        names: Vec<Bytes>,
        who: SubscriberId,
        reply: oneshot::Sender<()>,
    ) -> Result<(), TransportError> {
        let targets: Vec<Target> = names.into_iter().map(|name| kind.target(name)).collect();
        let orphans = self.ledger.remove_interest(&targets, who);

        let _ = reply.send(());

        for target in &targets {
            self.registry.notify(who, removed_event(target));
        }
        self.registry.release_if_idle(who, &self.ledger);

        if self.link.is_some() {
            let (channels, patterns) = split_targets(orphans);
            self.send_wire(WireOp::Unsubscribe, channels, patterns).await
        } else {
            Ok(())
        }
    }

    async fn handle_death(&mut self, who: SubscriberId) -> Result<(), TransportError> {
        tracing::debug!(connection = %self.id, subscriber = %who, "subscriber went away");
        let (channels, patterns) = self.ledger.drop_subscriber(who);
        self.registry.remove(who);

        if self.link.is_some() {
            self.send_wire(WireOp::Unsubscribe, channels, patterns).await
        } else {
            Ok(())
        }
    }

    async fn handle_read(&mut self, result: io::Result<usize>) -> Result<(), TransportError> {
        let transport = self.connector.transport();
        match result {
            Ok(0) => self.disconnect(TransportError::Closed { transport }),
            Ok(_) => self.drain_frames().await,
            Err(error) => self.disconnect(TransportError::Io {
                transport,
                message: error.to_string(),
            }),
        }
    }

    /// Dispatch every complete frame buffered so far.
    async fn drain_frames(&mut self) -> Result<(), TransportError> {
        loop {
            // Dispatch may tear the link down mid-loop (protocol error,
            // failed re-subscribe); re-check each round.
            let frame = match self.link.as_mut() {
                Some(link) => link.buffer.next_frame(),
                None => return Ok(()),
            };
            match frame {
                Ok(Some(frame)) => self.dispatch(frame).await?,
                Ok(None) => return Ok(()),
                Err(error) => return self.disconnect(TransportError::Protocol(error)),
            }
        }
    }

    async fn dispatch(&mut self, frame: Resp2Frame) -> Result<(), TransportError> {
        let push = match resp::decode_push(frame) {
            Ok(push) => push,
            Err(error) => return self.disconnect(TransportError::Protocol(error)),
        };

        match push {
            PushFrame::Subscribed { channel, remaining } => {
                self.confirm(Target::Channel(channel), remaining)
            }
            PushFrame::PSubscribed { pattern, remaining } => {
                self.confirm(Target::Pattern(pattern), remaining)
            }
            PushFrame::Unsubscribed { channel, .. } => {
                return self.unconfirm(Target::Channel(channel)).await;
            }
            PushFrame::PUnsubscribed { pattern, .. } => {
                return self.unconfirm(Target::Pattern(pattern)).await;
            }
            PushFrame::Message { channel, payload } => self.deliver_message(channel, payload),
            PushFrame::PMessage {
                pattern,
                channel,
                payload,
            } => self.deliver_pmessage(pattern, channel, payload),
        }
        Ok(())
    }

    /// A subscribe was acknowledged: migrate pending interest to confirmed
    /// and notify the migrated subscribers.
    fn confirm(&mut self, target: Target, remaining: i64) {
        let migrated = self.ledger.confirm(&target);
        if migrated.is_empty() {
            // Everyone unsubscribed before the ack arrived; the wire
            // unsubscribe has been (or is being) sent, so the ack is stale.
            tracing::debug!(
                connection = %self.id,
                %target,
                "dropping subscription ack with no local interest"
            );
            return;
        }

        tracing::debug!(
            connection = %self.id,
            %target,
            subscribers = migrated.len(),
            remaining,
            "subscription confirmed"
        );
        for who in migrated {
            self.registry.notify(who, confirmed_event(&target));
        }
    }

    /// An unsubscribe was acknowledged. If local interest remains the
    /// unsubscribe was server-initiated and the target is re-subscribed.
    async fn unconfirm(&mut self, target: Target) -> Result<(), TransportError> {
        if self.ledger.revive(&target) {
            tracing::debug!(
                connection = %self.id,
                %target,
                "server dropped a live subscription, re-subscribing"
            );
            let (channels, patterns) = split_targets(vec![target]);
            return self.send_wire(WireOp::Subscribe, channels, patterns).await;
        }
        Ok(())
    }

    fn deliver_message(&self, channel: Bytes, payload: Bytes) {
        let target = Target::Channel(channel.clone());
        for who in self.ledger.confirmed_members(&target) {
            self.registry.notify(
                who,
                EventKind::Message {
                    channel: channel.clone(),
                    payload: payload.clone(),
                },
            );
        }
    }

    fn deliver_pmessage(&self, pattern: Bytes, channel: Bytes, payload: Bytes) {
        let target = Target::Pattern(pattern.clone());
        for who in self.ledger.confirmed_members(&target) {
            self.registry.notify(
                who,
                EventKind::PMessage {
                    pattern: pattern.clone(),
                    channel: channel.clone(),
                    payload: payload.clone(),
                },
            );
        }
    }

    /// Encode and write one request as up to two commands in a single
    /// transport write. A failed write tears the connection down.
    async fn send_wire(
        &mut self,
        op: WireOp,
        channels: Vec<Bytes>,
        patterns: Vec<Bytes>,
    ) -> Result<(), TransportError> {
        if channels.is_empty() && patterns.is_empty() {
            return Ok(());
        }

        let payload = match resp::command_payload(op, &channels, &patterns) {
            Ok(payload) => payload,
            Err(error) => return self.disconnect(TransportError::Protocol(error)),
        };

        let transport = self.connector.transport();
        match self.link.as_mut() {
            Some(link) => match link.stream.write_all(&payload).await {
                Ok(()) => Ok(()),
                Err(error) => self.disconnect(TransportError::Io {
                    transport,
                    message: error.to_string(),
                }),
            },
            // Raced with a disconnect; pending interest is re-subscribed on
            // reconnect anyway.
            None => Ok(()),
        }
    }

    /// One raw connect attempt. On success the link is installed and the
    /// backoff schedule cleared; the caller decides what a failure means.
    async fn connect_once(&mut self) -> Result<(), ConnectError> {
        let attempt = timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.config),
        );
        let (stream, peer) = match attempt.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(error)) => return Err(error),
            Err(_elapsed) => return Err(ConnectError::Timeout),
        };

        let recovering = self.backoff.in_progress() || self.last_error.is_some();
        self.backoff.reset();
        self.link = Some(Link {
            stream,
            buffer: FrameBuffer::new(),
            peer,
        });

        if recovering {
            log_event!(
                self.config.log.reconnection,
                connection = %self.id,
                peer = %peer,
                "reconnected"
            );
        } else {
            tracing::debug!(connection = %self.id, peer = %peer, "connected");
        }
        Ok(())
    }

    /// Timer-driven connect attempt: on success restore subscriptions, on
    /// ordinary failure reschedule under backoff, on fatal failure stop.
    async fn attempt_connect(&mut self) -> Result<(), TransportError> {
        match self.connect_once().await {
            Ok(()) => self.resubscribe_pending().await,
            Err(error @ ConnectError::Fatal { .. }) => {
                tracing::error!(connection = %self.id, %error, "connector failed fatally, stopping");
                Err(TransportError::Connect(error))
            }
            Err(error) => {
                let delay = self.backoff.next();
                log_event!(
                    self.config.log.failed_connection,
                    connection = %self.id,
                    %error,
                    next_attempt_in = ?delay,
                    "connect attempt failed"
                );
                self.next_attempt = Some(Instant::now() + delay);
                Ok(())
            }
        }
    }

    /// Subscribe everything still pending, i.e. the full interest set after
    /// a reconnect.
    async fn resubscribe_pending(&mut self) -> Result<(), TransportError> {
        let (channels, patterns) = self.ledger.wire_targets();
        if channels.is_empty() && patterns.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            connection = %self.id,
            channels = channels.len(),
            patterns = patterns.len(),
            "restoring subscriptions"
        );
        self.send_wire(WireOp::Subscribe, channels, patterns).await
    }

    /// Leave the connected state. With `exit_on_disconnection` the driver
    /// stops with the reason; otherwise subscribers are notified, confirmed
    /// interest moves back to pending and the reconnect timer is armed.
    fn disconnect(&mut self, reason: TransportError) -> Result<(), TransportError> {
        self.link = None;
        log_event!(
            self.config.log.disconnection,
            connection = %self.id,
            %reason,
            subscribers = self.registry.len(),
            targets = self.ledger.target_count(),
            "connection lost"
        );

        if self.config.exit_on_disconnection {
            return Err(reason);
        }

        self.registry.notify_all(EventKind::Disconnected {
            reason: reason.clone(),
        });
        self.ledger.reset_to_pending();
        self.last_error = Some(reason);

        let delay = self.backoff.next();
        self.next_attempt = Some(Instant::now() + delay);
        Ok(())
    }

    fn current_outage(&self) -> TransportError {
        self.last_error
            .clone()
            .unwrap_or(TransportError::NotConnected)
    }
}

/// Read a chunk into the link's parse buffer. Pends forever while
/// disconnected so the select loop simply ignores this source.
async fn read_some<S: AsyncRead + Unpin>(link: &mut Option<Link<S>>) -> io::Result<usize> {
    match link.as_mut() {
        Some(link) => {
            let mut chunk = [0u8; 4096];
            let read = link.stream.read(&mut chunk).await?;
            link.buffer.append(&chunk[..read]);
            Ok(read)
        }
        None => std::future::pending().await,
    }
}

/// Sleep until the reconnect deadline, or forever when none is armed.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn confirmed_event(target: &Target) -> EventKind {
    match target {
        Target::Channel(name) => EventKind::Subscribed {
            channel: name.clone(),
        },
        Target::Pattern(name) => EventKind::PSubscribed {
            pattern: name.clone(),
        },
    }
}

fn removed_event(target: &Target) -> EventKind {
    match target {
        Target::Channel(name) => EventKind::Unsubscribed {
            channel: name.clone(),
        },
        Target::Pattern(name) => EventKind::PUnsubscribed {
            pattern: name.clone(),
        },
    }
}
