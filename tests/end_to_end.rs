//! End-to-end scenarios driven through the public API.
//!
//! A scripted connector hands the driver in-memory duplex streams, so each
//! test plays the Redis server side: it asserts the exact command bytes the
//! connection writes and feeds back RESP push frames. Time is paused, which
//! makes the reconnect backoff run instantly.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redsub::{
    ConnectError, ConnectionConfig, Connector, Event, EventKind, EventStream, PubSub,
    RequestError, StartError, Subscriber, Transport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const EVENT_WAIT: Duration = Duration::from_secs(1);
// Longer than the test backoff, so "nothing happened" includes "nothing
// happened across a reconnect".
const SILENCE_WAIT: Duration = Duration::from_millis(200);

/// Connector serving a fixed sequence of in-memory streams. The first
/// `refusals` attempts fail; later attempts pop the next stream, and
/// attempts past the end are refused.
#[derive(Clone)]
struct ScriptedConnector {
    refusals: Arc<AtomicUsize>,
    streams: Arc<Mutex<VecDeque<DuplexStream>>>,
}

/// Install a fmt subscriber so a failing test prints the driver's logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

impl ScriptedConnector {
    fn with_streams(count: usize) -> (Self, Vec<DuplexStream>) {
        Self::with_refusals_then_streams(0, count)
    }

    fn with_refusals_then_streams(refusals: usize, count: usize) -> (Self, Vec<DuplexStream>) {
        init_tracing();
        let mut clients = VecDeque::new();
        let mut servers = Vec::new();
        for _ in 0..count {
            let (client, server) = tokio::io::duplex(4096);
            clients.push_back(client);
            servers.push(server);
        }
        let connector = Self {
            refusals: Arc::new(AtomicUsize::new(refusals)),
            streams: Arc::new(Mutex::new(clients)),
        };
        (connector, servers)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Stream = DuplexStream;

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    async fn connect(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<(Self::Stream, SocketAddr), ConnectError> {
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(ConnectError::Io {
                message: "connection refused".to_string(),
            });
        }

        let next = self.streams.lock().expect("connector lock").pop_front();
        match next {
            Some(stream) => Ok((stream, "127.0.0.1:6379".parse().expect("peer addr"))),
            None => Err(ConnectError::Io {
                message: "connection refused".to_string(),
            }),
        }
    }
}

fn config() -> ConnectionConfig {
    ConnectionConfig::new("localhost", 6379)
        .with_sync_connect(true)
        .with_backoff(Duration::from_millis(50), Some(Duration::from_secs(1)))
}

async fn read_wire(server: &mut DuplexStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    timeout(EVENT_WAIT, server.read_exact(&mut buf))
        .await
        .expect("timed out waiting for wire bytes")
        .expect("wire read failed");
    String::from_utf8(buf).expect("wire bytes were not utf8")
}

async fn expect_wire(server: &mut DuplexStream, expected: &str) {
    let actual = read_wire(server, expected.len()).await;
    assert_eq!(actual, expected);
}

async fn expect_wire_silence(server: &mut DuplexStream) {
    let mut buf = [0u8; 1];
    let read = timeout(SILENCE_WAIT, server.read(&mut buf)).await;
    assert!(read.is_err(), "unexpected wire traffic");
}

async fn recv_event(events: &mut EventStream) -> Event {
    timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn expect_no_event(events: &mut EventStream) {
    if let Ok(event) = timeout(SILENCE_WAIT, events.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

async fn send_frames(server: &mut DuplexStream, frames: &str) {
    server
        .write_all(frames.as_bytes())
        .await
        .expect("server write failed");
}

fn sub_ack(channel: &str, count: i64) -> String {
    format!(
        "*3\r\n$9\r\nsubscribe\r\n${}\r\n{}\r\n:{}\r\n",
        channel.len(),
        channel,
        count
    )
}

fn psub_ack(pattern: &str, count: i64) -> String {
    format!(
        "*3\r\n$10\r\npsubscribe\r\n${}\r\n{}\r\n:{}\r\n",
        pattern.len(),
        pattern,
        count
    )
}

fn unsub_push(channel: &str, count: i64) -> String {
    format!(
        "*3\r\n$11\r\nunsubscribe\r\n${}\r\n{}\r\n:{}\r\n",
        channel.len(),
        channel,
        count
    )
}

fn message(channel: &str, payload: &str) -> String {
    format!(
        "*3\r\n$7\r\nmessage\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
        channel.len(),
        channel,
        payload.len(),
        payload
    )
}

fn pmessage(pattern: &str, channel: &str, payload: &str) -> String {
    format!(
        "*4\r\n$8\r\npmessage\r\n${}\r\n{}\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
        pattern.len(),
        pattern,
        channel.len(),
        channel,
        payload.len(),
        payload
    )
}

fn assert_subscribed(event: &Event, channel: &'static str) {
    match &event.kind {
        EventKind::Subscribed { channel: actual } => {
            assert_eq!(actual, &Bytes::from_static(channel.as_bytes()));
        }
        other => panic!("expected Subscribed {channel}, got {other:?}"),
    }
}

fn assert_message(event: &Event, channel: &'static str, payload: &'static str) {
    match &event.kind {
        EventKind::Message {
            channel: actual_channel,
            payload: actual_payload,
        } => {
            assert_eq!(actual_channel, &Bytes::from_static(channel.as_bytes()));
            assert_eq!(actual_payload, &Bytes::from_static(payload.as_bytes()));
        }
        other => panic!("expected Message on {channel}, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn s1_basic_subscribe_and_receive() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    let reference = pubsub
        .subscribe(["news"], &subscriber)
        .await
        .expect("subscribe");

    expect_wire(&mut server, "*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n").await;
    send_frames(&mut server, &sub_ack("news", 1)).await;

    let event = recv_event(&mut events).await;
    assert_eq!(event.connection, pubsub.id());
    assert_eq!(event.reference, reference);
    assert_subscribed(&event, "news");

    send_frames(&mut server, &message("news", "hello")).await;
    let event = recv_event(&mut events).await;
    assert_eq!(event.reference, reference);
    assert_message(&event, "news", "hello");
}

#[tokio::test(start_paused = true)]
async fn s2_shared_subscription_sends_a_single_wire_subscribe() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (a, mut a_events) = Subscriber::new();
    let a_ref = pubsub.subscribe(["x"], &a).await.expect("subscribe a");
    expect_wire(&mut server, "*2\r\n$9\r\nSUBSCRIBE\r\n$1\r\nx\r\n").await;
    send_frames(&mut server, &sub_ack("x", 1)).await;
    assert_subscribed(&recv_event(&mut a_events).await, "x");

    // B joins an already-confirmed target: immediate event, no wire traffic.
    let (b, mut b_events) = Subscriber::new();
    let b_ref = pubsub.subscribe(["x"], &b).await.expect("subscribe b");
    let event = recv_event(&mut b_events).await;
    assert_subscribed(&event, "x");
    assert_eq!(event.reference, b_ref);
    assert_ne!(a_ref, b_ref);
    expect_wire_silence(&mut server).await;

    send_frames(&mut server, &message("x", "v")).await;
    assert_message(&recv_event(&mut a_events).await, "x", "v");
    assert_message(&recv_event(&mut b_events).await, "x", "v");
}

#[tokio::test(start_paused = true)]
async fn s3_unsubscribe_with_remaining_interest_stays_off_the_wire() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (a, mut a_events) = Subscriber::new();
    let (b, mut b_events) = Subscriber::new();
    pubsub.subscribe(["x"], &a).await.expect("subscribe a");
    expect_wire(&mut server, "*2\r\n$9\r\nSUBSCRIBE\r\n$1\r\nx\r\n").await;
    send_frames(&mut server, &sub_ack("x", 1)).await;
    assert_subscribed(&recv_event(&mut a_events).await, "x");
    pubsub.subscribe(["x"], &b).await.expect("subscribe b");
    assert_subscribed(&recv_event(&mut b_events).await, "x");

    pubsub.unsubscribe(["x"], &a).await.expect("unsubscribe a");
    let event = recv_event(&mut a_events).await;
    match &event.kind {
        EventKind::Unsubscribed { channel } => {
            assert_eq!(channel, &Bytes::from_static(b"x"));
        }
        other => panic!("expected Unsubscribed, got {other:?}"),
    }
    // B is still interested, so no UNSUBSCRIBE goes out.
    expect_wire_silence(&mut server).await;

    send_frames(&mut server, &message("x", "v2")).await;
    assert_message(&recv_event(&mut b_events).await, "x", "v2");
    expect_no_event(&mut a_events).await;
}

#[tokio::test(start_paused = true)]
async fn s4_disconnect_preserves_intent_and_resubscribes() {
    let (connector, mut servers) = ScriptedConnector::with_streams(2);
    let mut server2 = servers.remove(1);
    let mut server1 = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    pubsub
        .subscribe(["a", "b"], &subscriber)
        .await
        .expect("subscribe");
    expect_wire(&mut server1, "*3\r\n$9\r\nSUBSCRIBE\r\n$1\r\na\r\n$1\r\nb\r\n").await;
    send_frames(&mut server1, &sub_ack("a", 1)).await;
    send_frames(&mut server1, &sub_ack("b", 2)).await;
    assert_subscribed(&recv_event(&mut events).await, "a");
    assert_subscribed(&recv_event(&mut events).await, "b");

    // The server goes away.
    drop(server1);
    let event = recv_event(&mut events).await;
    assert!(
        matches!(event.kind, EventKind::Disconnected { .. }),
        "expected Disconnected, got {:?}",
        event.kind
    );

    // After the backoff the connection re-subscribes the full interest set
    // (target order is arbitrary).
    let wire = read_wire(&mut server2, "*3\r\n$9\r\nSUBSCRIBE\r\n$1\r\na\r\n$1\r\nb\r\n".len()).await;
    assert!(
        wire == "*3\r\n$9\r\nSUBSCRIBE\r\n$1\r\na\r\n$1\r\nb\r\n"
            || wire == "*3\r\n$9\r\nSUBSCRIBE\r\n$1\r\nb\r\n$1\r\na\r\n",
        "unexpected re-subscribe: {wire:?}"
    );
    send_frames(&mut server2, &sub_ack("a", 1)).await;
    send_frames(&mut server2, &sub_ack("b", 2)).await;

    let mut confirmed: Vec<Bytes> = Vec::new();
    for _ in 0..2 {
        match recv_event(&mut events).await.kind {
            EventKind::Subscribed { channel } => confirmed.push(channel),
            other => panic!("expected Subscribed, got {other:?}"),
        }
    }
    confirmed.sort();
    assert_eq!(
        confirmed,
        vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
    );
}

#[tokio::test(start_paused = true)]
async fn s5_unsubscribe_while_disconnected_is_not_resubscribed() {
    let (connector, mut servers) = ScriptedConnector::with_streams(2);
    let mut server2 = servers.remove(1);
    let mut server1 = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    pubsub.subscribe(["c"], &subscriber).await.expect("subscribe");
    expect_wire(&mut server1, "*2\r\n$9\r\nSUBSCRIBE\r\n$1\r\nc\r\n").await;
    send_frames(&mut server1, &sub_ack("c", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "c");

    drop(server1);
    assert!(matches!(
        recv_event(&mut events).await.kind,
        EventKind::Disconnected { .. }
    ));

    pubsub
        .unsubscribe(["c"], &subscriber)
        .await
        .expect("unsubscribe");
    assert!(matches!(
        recv_event(&mut events).await.kind,
        EventKind::Unsubscribed { .. }
    ));

    // The reconnect happens within the silence window and must not
    // subscribe anything.
    expect_wire_silence(&mut server2).await;
}

#[tokio::test(start_paused = true)]
async fn s6_server_initiated_unsubscribe_is_reissued() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    pubsub.subscribe(["d"], &subscriber).await.expect("subscribe");
    expect_wire(&mut server, "*2\r\n$9\r\nSUBSCRIBE\r\n$1\r\nd\r\n").await;
    send_frames(&mut server, &sub_ack("d", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "d");

    // The server drops the subscription behind our back.
    send_frames(&mut server, &unsub_push("d", 0)).await;
    expect_wire(&mut server, "*2\r\n$9\r\nSUBSCRIBE\r\n$1\r\nd\r\n").await;
    send_frames(&mut server, &sub_ack("d", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "d");
}

#[tokio::test(start_paused = true)]
async fn s7_subscriber_crash_unsubscribes_orphans() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    pubsub.subscribe(["e"], &subscriber).await.expect("subscribe");
    expect_wire(&mut server, "*2\r\n$9\r\nSUBSCRIBE\r\n$1\r\ne\r\n").await;
    send_frames(&mut server, &sub_ack("e", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "e");

    // Dropping the event stream is the death notification.
    drop(events);
    expect_wire(&mut server, "*2\r\n$11\r\nUNSUBSCRIBE\r\n$1\r\ne\r\n").await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_subscribe_reuses_the_ref_and_the_wire_subscription() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    let first = pubsub.subscribe(["x"], &subscriber).await.expect("subscribe");
    expect_wire(&mut server, "*2\r\n$9\r\nSUBSCRIBE\r\n$1\r\nx\r\n").await;
    send_frames(&mut server, &sub_ack("x", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "x");

    let second = pubsub.subscribe(["x"], &subscriber).await.expect("resubscribe");
    assert_eq!(first, second);
    // Already confirmed: the event comes straight from the call handler.
    assert_subscribed(&recv_event(&mut events).await, "x");
    expect_wire_silence(&mut server).await;
}

#[tokio::test(start_paused = true)]
async fn pattern_subscriptions_deliver_pmessages() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    pubsub
        .psubscribe(["news.*"], &subscriber)
        .await
        .expect("psubscribe");
    expect_wire(&mut server, "*2\r\n$10\r\nPSUBSCRIBE\r\n$6\r\nnews.*\r\n").await;
    send_frames(&mut server, &psub_ack("news.*", 1)).await;
    match recv_event(&mut events).await.kind {
        EventKind::PSubscribed { pattern } => {
            assert_eq!(pattern, Bytes::from_static(b"news.*"));
        }
        other => panic!("expected PSubscribed, got {other:?}"),
    }

    send_frames(&mut server, &pmessage("news.*", "news.de", "hallo")).await;
    match recv_event(&mut events).await.kind {
        EventKind::PMessage {
            pattern,
            channel,
            payload,
        } => {
            assert_eq!(pattern, Bytes::from_static(b"news.*"));
            assert_eq!(channel, Bytes::from_static(b"news.de"));
            assert_eq!(payload, Bytes::from_static(b"hallo"));
        }
        other => panic!("expected PMessage, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_channels_and_patterns_in_one_write() {
    let (connector, mut servers) = ScriptedConnector::with_streams(2);
    let mut server2 = servers.remove(1);
    let mut server1 = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    pubsub.subscribe(["news"], &subscriber).await.expect("subscribe");
    expect_wire(&mut server1, "*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n").await;
    pubsub
        .psubscribe(["news.*"], &subscriber)
        .await
        .expect("psubscribe");
    expect_wire(&mut server1, "*2\r\n$10\r\nPSUBSCRIBE\r\n$6\r\nnews.*\r\n").await;
    send_frames(&mut server1, &sub_ack("news", 1)).await;
    send_frames(&mut server1, &psub_ack("news.*", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "news");
    assert!(matches!(
        recv_event(&mut events).await.kind,
        EventKind::PSubscribed { .. }
    ));

    drop(server1);
    assert!(matches!(
        recv_event(&mut events).await.kind,
        EventKind::Disconnected { .. }
    ));

    // Both halves of the interest set come back as two commands in a single
    // write, channels first.
    expect_wire(
        &mut server2,
        "*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n*2\r\n$10\r\nPSUBSCRIBE\r\n$6\r\nnews.*\r\n",
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_from_an_unknown_target_is_ignored() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    pubsub
        .unsubscribe(["never"], &subscriber)
        .await
        .expect("unsubscribe succeeds");
    expect_no_event(&mut events).await;
    expect_wire_silence(&mut server).await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_disconnected_acks_and_resubscribes_later() {
    // First attempt refused, second succeeds: the subscribe lands while the
    // connection is still down.
    let (connector, mut servers) = ScriptedConnector::with_refusals_then_streams(1, 1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(config().with_sync_connect(false), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    let reference = pubsub
        .subscribe(["news"], &subscriber)
        .await
        .expect("subscribe");
    let event = recv_event(&mut events).await;
    assert_eq!(event.reference, reference);
    assert!(matches!(event.kind, EventKind::Disconnected { .. }));

    // Once the retry succeeds the pending interest goes out on the wire.
    expect_wire(&mut server, "*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n").await;
    send_frames(&mut server, &sub_ack("news", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "news");
}

#[tokio::test(start_paused = true)]
async fn malformed_push_tears_the_connection_down_and_recovers() {
    let (connector, mut servers) = ScriptedConnector::with_streams(2);
    let mut server2 = servers.remove(1);
    let mut server1 = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    pubsub.subscribe(["news"], &subscriber).await.expect("subscribe");
    expect_wire(&mut server1, "*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n").await;
    send_frames(&mut server1, &sub_ack("news", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "news");

    // A pub/sub connection must only ever see push arrays.
    send_frames(&mut server1, "+OK\r\n").await;
    assert!(matches!(
        recv_event(&mut events).await.kind,
        EventKind::Disconnected { .. }
    ));

    expect_wire(&mut server2, "*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n").await;
    send_frames(&mut server2, &sub_ack("news", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "news");
}

#[tokio::test(start_paused = true)]
async fn exit_on_disconnection_stops_the_driver() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let mut server = servers.remove(0);
    let pubsub = PubSub::connect_with(
        config().with_exit_on_disconnection(true),
        connector,
    )
    .await
    .expect("connect");

    let (subscriber, mut events) = Subscriber::new();
    pubsub.subscribe(["news"], &subscriber).await.expect("subscribe");
    expect_wire(&mut server, "*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n").await;
    send_frames(&mut server, &sub_ack("news", 1)).await;
    assert_subscribed(&recv_event(&mut events).await, "news");

    drop(server);
    pubsub.closed().await;

    let error = pubsub
        .subscribe(["more"], &subscriber)
        .await
        .expect_err("driver should be gone");
    assert!(matches!(error, RequestError::ConnectionClosed));
}

#[tokio::test(start_paused = true)]
async fn sync_connect_failure_fails_startup() {
    let (connector, _servers) = ScriptedConnector::with_streams(0);
    let result = PubSub::connect_with(config(), connector).await;
    assert!(matches!(
        result,
        Err(StartError::Connect(ConnectError::Io { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn close_stops_the_driver() {
    let (connector, mut servers) = ScriptedConnector::with_streams(1);
    let _server = servers.remove(0);
    let pubsub = PubSub::connect_with(config(), connector)
        .await
        .expect("connect");

    pubsub.close().await;
    pubsub.closed().await;

    let (subscriber, _events) = Subscriber::new();
    assert!(pubsub.subscribe(["x"], &subscriber).await.is_err());
}
