//! Client builder and supervisory loop.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the client.
//! The [`Client`] hides connection churn behind a stable per-address API:
//! 1. Dial the server and start the first [`Connection`]
//! 2. Run a supervisory task that pings on a fixed interval
//! 3. Rebuild the connection when a ping fails or the connection reports
//!    itself closed, at most once per debounce window
//! 4. Route `call_sync` / `call_async` to whichever connection is current
//!
//! Failed calls are never retried; only the connection is.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use strest_client::{Client, Request};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("localhost:8009")
//!         .max_in_flight(500)
//!         .connect()
//!         .await?;
//!
//!     let res = client
//!         .call_sync(Request::new("/ping", "GET"), Duration::from_secs(10))
//!         .await?;
//!     println!("{:?}", res);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionOptions, ErrorSender, ResultSender};
use crate::error::{StrestError, Result};
use crate::protocol::{Request, Response, TxnAccept};
use crate::txn::TxnIdGenerator;

/// Default interval between health-check pings.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Default timeout of a single health-check ping.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default URI pinged by the health check.
pub const DEFAULT_PING_URI: &str = "/ping";

/// Default minimum spacing between reconnect attempts.
pub const DEFAULT_RECONNECT_DEBOUNCE: Duration = Duration::from_secs(5);

const DISCONNECT_CHANNEL_CAPACITY: usize = 16;

/// Configuration for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Options applied to every connection the client opens.
    pub connection: ConnectionOptions,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub ping_uri: String,
    /// Reconnect requests closer than this to the previous attempt are skipped.
    pub reconnect_debounce: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            ping_uri: DEFAULT_PING_URI.to_string(),
            reconnect_debounce: DEFAULT_RECONNECT_DEBOUNCE,
        }
    }
}

/// Builder for configuring and connecting a [`Client`].
pub struct ClientBuilder {
    address: String,
    config: ClientConfig,
    txn_ids: TxnIdGenerator,
}

impl ClientBuilder {
    /// Create a builder for the server at `address` (`host:port`).
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            config: ClientConfig::default(),
            txn_ids: TxnIdGenerator::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound the number of transactions awaiting a terminal response.
    ///
    /// Default: unbounded
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.config.connection.max_in_flight = Some(limit);
        self
    }

    /// How long a call may wait for an in-flight slot before the connection
    /// is declared stuck and closed.
    ///
    /// Default: 20 seconds
    pub fn admission_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.admission_timeout = timeout;
        self
    }

    /// Default: 1 second
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.connect_timeout = timeout;
        self
    }

    /// Default: 20 seconds
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.write_timeout = timeout;
        self
    }

    /// Default: 1024
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.connection.queue_capacity = capacity;
        self
    }

    /// Default: 64 MiB
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.connection.max_message_size = size;
        self
    }

    /// Default: 5 seconds
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Default: 10 seconds
    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.config.health_check_timeout = timeout;
        self
    }

    /// Default: `/ping`
    pub fn ping_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.ping_uri = uri.into();
        self
    }

    /// Default: 5 seconds
    pub fn reconnect_debounce(mut self, window: Duration) -> Self {
        self.config.reconnect_debounce = window;
        self
    }

    /// Draw transaction ids from a shared generator.
    pub fn txn_ids(mut self, txn_ids: TxnIdGenerator) -> Self {
        self.txn_ids = txn_ids;
        self
    }

    /// Dial the server and start the supervisory loop.
    pub async fn connect(self) -> Result<Client> {
        Client::start(self.address, self.config, self.txn_ids).await
    }
}

/// A strest client bound to one server address.
///
/// Cheap to clone; clones share the connection and the supervisory loop.
/// Call [`Client::close`] to stop the loop and close the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    address: String,
    config: ClientConfig,
    txn_ids: TxnIdGenerator,
    /// Read by every call; written only by the supervisor when swapping.
    conn: RwLock<Connection>,
    exit: mpsc::Sender<oneshot::Sender<()>>,
    closed: AtomicBool,
}

impl Client {
    pub fn builder(address: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(address)
    }

    /// Connect with the default configuration.
    pub async fn open(address: impl Into<String>) -> Result<Client> {
        ClientBuilder::new(address).connect().await
    }

    async fn start(address: String, config: ClientConfig, txn_ids: TxnIdGenerator) -> Result<Self> {
        let (disconnect_tx, disconnect_rx) = mpsc::channel(DISCONNECT_CHANNEL_CAPACITY);
        let conn = Connection::open(
            &address,
            config.connection.clone(),
            Some(disconnect_tx.clone()),
        )
        .await?;

        let (exit_tx, exit_rx) = mpsc::channel(1);
        let inner = Arc::new(ClientInner {
            address,
            config,
            txn_ids,
            conn: RwLock::new(conn),
            exit: exit_tx,
            closed: AtomicBool::new(false),
        });

        let supervisor = Supervisor {
            inner: inner.clone(),
            disconnect_tx,
            disconnect_rx,
            exit_rx,
            last_reconnect: None,
        };
        tokio::spawn(supervisor.run());

        Ok(Client { inner })
    }

    /// Send a request and wait for a single response.
    ///
    /// Forces the transaction-accept mode to `single`. On timeout the
    /// server is not told; a late response is dropped.
    pub async fn call_sync(&self, mut request: Request, timeout: Duration) -> Result<Response> {
        request.set_txn_accept(TxnAccept::Single);
        let (outcome, _) = self.inner.call_sync_on(request, timeout).await;
        outcome
    }

    /// Send a request whose responses go to `results`.
    ///
    /// Every failure, including not being connected, is delivered on
    /// `errors` rather than returned. Awaiting this only covers admission
    /// onto the connection, not the response.
    pub async fn call_async(&self, request: Request, results: ResultSender, errors: ErrorSender) {
        self.inner.dispatch(request, results, errors).await;
    }

    /// Stop the supervisory loop and close the current connection.
    ///
    /// Idempotent. Waits until the loop has shut down.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inner.exit.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The connection calls are currently routed to.
    pub async fn current_connection(&self) -> Connection {
        self.inner.current().await
    }

    /// Transactions on the current connection awaiting a terminal response.
    pub async fn in_flight(&self) -> usize {
        self.inner.current().await.in_flight()
    }
}

impl ClientInner {
    async fn current(&self) -> Connection {
        self.conn.read().await.clone()
    }

    /// Stamp, route and enqueue a request. Failures go to `errors`.
    ///
    /// Returns the connection the request was routed to, if any.
    async fn dispatch(
        &self,
        mut request: Request,
        results: ResultSender,
        errors: ErrorSender,
    ) -> Option<Connection> {
        if self.closed.load(Ordering::Acquire) {
            let _ = errors.send(StrestError::ClientClosed);
            return None;
        }

        if request.txn_id().is_empty() {
            request.set_txn_id(self.txn_ids.next_id());
        }

        let conn = self.current().await;
        if !conn.is_connected() {
            let _ = errors.send(StrestError::NotConnected(self.address.clone()));
            return Some(conn);
        }

        if let Err(e) = conn.enqueue(request, results, errors.clone()).await {
            let _ = errors.send(e);
        }
        Some(conn)
    }

    /// Race the first response, the first error and the deadline.
    async fn call_sync_on(
        &self,
        request: Request,
        timeout: Duration,
    ) -> (Result<Response>, Option<Connection>) {
        let (results_tx, mut results) = mpsc::unbounded_channel();
        let (errors_tx, mut errors) = mpsc::unbounded_channel();

        let conn = self.dispatch(request, results_tx, errors_tx).await;

        // A closed channel means the transaction was dropped; the error, if
        // any, is already queued on the other channel.
        let outcome = tokio::select! {
            response = results.recv() => match response {
                Some(response) => Ok(response),
                None => Err(errors.try_recv().unwrap_or_else(|_| self.closed_error())),
            },
            err = errors.recv() => match err {
                Some(err) => Err(err),
                None => results.try_recv().map_err(|_| self.closed_error()),
            },
            _ = tokio::time::sleep(timeout) => Err(StrestError::Timeout(timeout)),
        };

        (outcome, conn)
    }

    fn closed_error(&self) -> StrestError {
        StrestError::ConnectionClosed(self.address.clone())
    }
}

/// Background task owning reconnect decisions for one client.
struct Supervisor {
    inner: Arc<ClientInner>,
    disconnect_tx: mpsc::Sender<Connection>,
    disconnect_rx: mpsc::Receiver<Connection>,
    exit_rx: mpsc::Receiver<oneshot::Sender<()>>,
    last_reconnect: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self) {
        let period = self.inner.config.health_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ack = self.exit_rx.recv() => {
                    info!(addr = %self.inner.address, "closing strest client");
                    self.inner.closed.store(true, Ordering::Release);
                    self.inner.current().await.close();
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
                _ = ticker.tick() => self.health_check().await,
                Some(conn) = self.disconnect_rx.recv() => {
                    info!(addr = %self.inner.address, "connection lost, attempting reconnect");
                    if let Err(e) = self.reconnect(conn).await {
                        error!(addr = %self.inner.address, "reconnect failed: {}", e);
                    }
                }
            }
        }
    }

    async fn health_check(&mut self) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        let ping = Request::new(self.inner.config.ping_uri.clone(), "GET");
        let timeout = self.inner.config.health_check_timeout;
        let (outcome, conn) = self.inner.call_sync_on(ping, timeout).await;

        let Err(e) = outcome else {
            debug!(addr = %self.inner.address, "health check ok");
            return;
        };
        warn!(addr = %self.inner.address, "health check failed: {}", e);

        let conn = match conn {
            Some(conn) => conn,
            None => self.inner.current().await,
        };
        if let Err(e) = self.reconnect(conn).await {
            error!(addr = %self.inner.address, "reconnect failed: {}", e);
        }
    }

    /// Replace `old` with a fresh connection.
    ///
    /// Skipped (returning `old`) if the previous attempt was within the
    /// debounce window. On failure the current connection is left as is.
    async fn reconnect(&mut self, old: Connection) -> Result<Connection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(old);
        }

        if self.inner.current().await != old {
            warn!(
                addr = %self.inner.address,
                "reconnect requested for a connection that is no longer current"
            );
        }

        let now = Instant::now();
        if let Some(last) = self.last_reconnect {
            let since = now.duration_since(last);
            if since < self.inner.config.reconnect_debounce {
                debug!(
                    addr = %self.inner.address,
                    "skipping reconnect, previous attempt {:?} ago", since
                );
                return Ok(old);
            }
        }
        self.last_reconnect = Some(now);

        old.close();

        let conn = Connection::open(
            &self.inner.address,
            self.inner.config.connection.clone(),
            Some(self.disconnect_tx.clone()),
        )
        .await?;

        let previous = {
            let mut current = self.inner.conn.write().await;
            std::mem::replace(&mut *current, conn.clone())
        };
        if previous != old {
            previous.close();
        }

        info!(addr = %self.inner.address, "reconnected");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.health_check_interval, DEFAULT_HEALTH_CHECK_INTERVAL);
        assert_eq!(config.health_check_timeout, DEFAULT_HEALTH_CHECK_TIMEOUT);
        assert_eq!(config.ping_uri, "/ping");
        assert_eq!(config.reconnect_debounce, DEFAULT_RECONNECT_DEBOUNCE);
        assert_eq!(config.connection.max_in_flight, None);
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder("localhost:8009")
            .max_in_flight(500)
            .admission_timeout(Duration::from_secs(3))
            .connect_timeout(Duration::from_millis(250))
            .write_timeout(Duration::from_secs(2))
            .queue_capacity(64)
            .max_message_size(4096)
            .health_check_interval(Duration::from_secs(1))
            .health_check_timeout(Duration::from_millis(500))
            .ping_uri("/health")
            .reconnect_debounce(Duration::from_secs(30));

        assert_eq!(builder.address, "localhost:8009");
        let config = &builder.config;
        assert_eq!(config.connection.max_in_flight, Some(500));
        assert_eq!(config.connection.admission_timeout, Duration::from_secs(3));
        assert_eq!(config.connection.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.connection.write_timeout, Duration::from_secs(2));
        assert_eq!(config.connection.queue_capacity, 64);
        assert_eq!(config.connection.max_message_size, 4096);
        assert_eq!(config.health_check_interval, Duration::from_secs(1));
        assert_eq!(config.health_check_timeout, Duration::from_millis(500));
        assert_eq!(config.ping_uri, "/health");
        assert_eq!(config.reconnect_debounce, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_shares_generator() {
        let ids = TxnIdGenerator::new();
        let builder = ClientBuilder::new("a:1").txn_ids(ids.clone());

        builder.txn_ids.next_id();
        assert_eq!(ids.next_id(), "rs2");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = Client::open(addr).await;
        assert!(matches!(result, Err(StrestError::Connect { .. })));
    }
}
