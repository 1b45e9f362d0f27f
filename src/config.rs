//! Configuration for connection behaviour and reconnection parameters.

use std::time::Duration;

use tracing::Level;

/// Log levels used for connection lifecycle events.
///
/// Each lifecycle event is emitted through `tracing` at the level configured
/// here, so operators can e.g. demote routine disconnects on a flaky link to
/// `DEBUG` without losing them entirely.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Level used when an established connection is lost.
    pub disconnection: Level,

    /// Level used when a connection is (re)established.
    pub reconnection: Level,

    /// Level used when a connect attempt fails.
    pub failed_connection: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            disconnection: Level::ERROR,
            reconnection: Level::INFO,
            failed_connection: Level::ERROR,
        }
    }
}

/// Configuration for a pub/sub connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Redis host, forwarded to the connector.
    pub host: String,

    /// Redis port, forwarded to the connector.
    pub port: u16,

    /// Use a TLS transport instead of plain TCP. Requires a TLS-capable
    /// connector; also changes the transport tag carried by disconnect
    /// reasons ("ssl" instead of "tcp").
    pub ssl: bool,

    /// Sentinel group name, forwarded verbatim to connectors that implement
    /// sentinel-based discovery. The bundled TCP connector ignores it.
    pub sentinel: Option<String>,

    /// Await the initial connect during start-up. When set, a failed first
    /// connect fails [`PubSub::connect`](crate::connection::PubSub::connect)
    /// instead of being retried in the background.
    pub sync_connect: bool,

    /// Stop the connection permanently on any disconnect instead of
    /// reconnecting.
    pub exit_on_disconnection: bool,

    /// Delay before the first reconnect attempt after a disconnect.
    pub backoff_initial: Duration,

    /// Upper bound for the reconnect delay. `None` lets the delay grow
    /// without limit.
    pub backoff_max: Option<Duration>,

    /// Time limit for a single connect attempt.
    pub connect_timeout: Duration,

    /// Log levels for connection lifecycle events.
    pub log: LogConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            ssl: false,
            sentinel: None,
            sync_connect: false,
            exit_on_disconnection: false,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            log: LogConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for the given host and port with default
    /// reconnection behaviour.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// The `host:port` address string handed to address-based connectors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Request a TLS transport.
    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Set the sentinel group name forwarded to the connector.
    pub fn with_sentinel(mut self, group: impl Into<String>) -> Self {
        self.sentinel = Some(group.into());
        self
    }

    /// Await the initial connect during start-up.
    pub fn with_sync_connect(mut self, sync_connect: bool) -> Self {
        self.sync_connect = sync_connect;
        self
    }

    /// Stop permanently on the first disconnect.
    pub fn with_exit_on_disconnection(mut self, exit: bool) -> Self {
        self.exit_on_disconnection = exit;
        self
    }

    /// Set the reconnect backoff schedule. `max = None` removes the cap.
    pub fn with_backoff(mut self, initial: Duration, max: Option<Duration>) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Set the time limit for a single connect attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the log levels for connection lifecycle events.
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }
}
