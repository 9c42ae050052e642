//! One physical strest connection, multiplexed by transaction id.
//!
//! A [`Connection`] owns a single duplex stream and runs two tasks:
//!
//! ```text
//! Caller 1 ─┐                                   ┌─► stream (writes)
//! Caller 2 ─┼─► outgoing queue ─► Event Loop ───┤
//! Caller N ─┘                      ▲     │      └─ pending txns
//!                                  │     └─► per-caller result / error channels
//! stream ─► Reader Task ─► incoming queue
//! ```
//!
//! The event loop is the only place the pending-transaction map and the
//! write half are touched. Callers reach it through the outgoing queue;
//! the reader reaches it through the incoming queue and the exit signal.
//! When the loop ends, for any reason, it drains every queued and pending
//! transaction with [`StrestError::ConnectionClosed`] and reports itself on
//! the owner's disconnect channel.
//!
//! A connection is never reused after it closes; the owner builds a new one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backpressure::{InFlightLimiter, InFlightPermit, DEFAULT_ADMISSION_TIMEOUT};
use crate::codec::JsonCodec;
use crate::error::{StrestError, Result};
use crate::protocol::{MessageBuffer, Request, Response, DEFAULT_MAX_MESSAGE_SIZE};

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default deadline for writing one request.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default capacity of the outgoing and incoming queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Channel a transaction's responses are delivered on.
pub type ResultSender = mpsc::UnboundedSender<Response>;

/// Channel a transaction's failure is delivered on.
pub type ErrorSender = mpsc::UnboundedSender<StrestError>;

/// Configuration for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Dial timeout.
    pub connect_timeout: Duration,
    /// Deadline for writing one request; exceeding it closes the connection.
    pub write_timeout: Duration,
    /// Maximum transactions awaiting a terminal response. `None` is unbounded.
    pub max_in_flight: Option<usize>,
    /// How long `enqueue` may wait for an in-flight slot.
    pub admission_timeout: Duration,
    /// Capacity of the outgoing and incoming queues.
    pub queue_capacity: usize,
    /// Largest message the reader will buffer.
    pub max_message_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_in_flight: None,
            admission_timeout: DEFAULT_ADMISSION_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Lifecycle of a connection.
///
/// `Connecting` covers the dial inside [`Connection::open`]; a `Connection`
/// value is only handed out once it is `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// State readable from any task; written by `close()` and the event loop.
#[derive(Debug)]
struct Status {
    state: AtomicU8,
    in_flight: AtomicUsize,
}

impl Status {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connected as u8),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `Connected -> Closing`. Returns false if already past `Connected`.
    fn begin_closing(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn set_in_flight(&self, n: usize) {
        self.in_flight.store(n, Ordering::Release);
    }
}

/// A request on its way to the event loop.
struct Outgoing {
    request: Request,
    results: ResultSender,
    errors: ErrorSender,
    permit: InFlightPermit,
}

/// A written request awaiting its terminal response.
struct PendingTransaction {
    results: ResultSender,
    errors: ErrorSender,
    /// Held until the transaction leaves the map.
    _permit: InFlightPermit,
}

struct Shared {
    addr: String,
    created_at: Instant,
    status: Arc<Status>,
    limiter: InFlightLimiter,
    outgoing: mpsc::Sender<Outgoing>,
    exit: mpsc::Sender<()>,
}

/// Handle to a multiplexed connection.
///
/// Cheap to clone. Two handles compare equal when they refer to the same
/// physical connection. Dropping every handle closes the connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

/// Receipt for a request accepted by [`Connection::enqueue`].
#[derive(Debug, Clone)]
pub struct Transaction {
    txn_id: String,
    connection: Connection,
}

impl Transaction {
    pub fn txn_id(&self) -> &str {
        &self.txn_id
    }

    /// The connection the request was written to.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Connection {
    /// Dial `addr` and start the connection's reader and event loop.
    ///
    /// When the connection later closes, a handle to it is sent on
    /// `disconnect` (if given).
    pub async fn open(
        addr: &str,
        options: ConnectionOptions,
        disconnect: Option<mpsc::Sender<Connection>>,
    ) -> Result<Connection> {
        debug!(addr, "dialing strest server");

        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(StrestError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(StrestError::Connect {
                    addr: addr.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", options.connect_timeout),
                    ),
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr, "failed to set TCP_NODELAY: {}", e);
        }

        Ok(Self::from_stream(stream, addr, options, disconnect))
    }

    /// Start a connection over an already-established stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(
        stream: S,
        addr: impl Into<String>,
        options: ConnectionOptions,
        disconnect: Option<mpsc::Sender<Connection>>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let addr = addr.into();
        let (read_half, write_half) = tokio::io::split(stream);

        let capacity = options.queue_capacity.max(1);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
        let (exit_tx, exit_rx) = mpsc::channel(1);

        let status = Arc::new(Status::new());
        let limiter = InFlightLimiter::new(options.max_in_flight, options.admission_timeout);

        let shared = Arc::new(Shared {
            addr: addr.clone(),
            created_at: Instant::now(),
            status: status.clone(),
            limiter: limiter.clone(),
            outgoing: outgoing_tx,
            exit: exit_tx.clone(),
        });

        let reader = tokio::spawn(run_reader(
            read_half,
            incoming_tx,
            exit_tx,
            addr.clone(),
            options.max_message_size,
        ));

        let event_loop = EventLoop {
            addr,
            status,
            limiter,
            handle: Arc::downgrade(&shared),
            pending: HashMap::new(),
            writer: BufWriter::new(write_half),
            write_timeout: options.write_timeout,
            outgoing_rx,
            incoming_rx,
            exit_rx,
            reader,
            disconnect,
        };
        tokio::spawn(event_loop.run());

        info!(addr = %shared.addr, "opened strest connection");
        Connection { shared }
    }

    /// Submit a request whose responses go to `results` and whose failure
    /// goes to `errors`.
    ///
    /// Waits for an in-flight slot first. If none frees up within the
    /// admission timeout the connection is closed and `Backpressure` is
    /// returned. Errors are returned here, never sent on `errors`.
    pub async fn enqueue(
        &self,
        request: Request,
        results: ResultSender,
        errors: ErrorSender,
    ) -> Result<Transaction> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        if request.txn_id().is_empty() {
            return Err(StrestError::Protocol(
                "request has no transaction id".to_string(),
            ));
        }

        let permit = match self.shared.limiter.admit(&self.shared.addr).await {
            Ok(permit) => permit,
            Err(StrestError::Backpressure(waited)) => {
                warn!(
                    addr = %self.shared.addr,
                    "max in-flight sustained for {:?}, closing connection", waited
                );
                self.close();
                return Err(StrestError::Backpressure(waited));
            }
            Err(e) => return Err(e),
        };

        if !self.is_connected() {
            return Err(self.not_connected());
        }

        let txn_id = request.txn_id().to_string();
        let outgoing = Outgoing {
            request,
            results,
            errors,
            permit,
        };
        self.shared
            .outgoing
            .send(outgoing)
            .await
            .map_err(|_| self.not_connected())?;

        Ok(Transaction {
            txn_id,
            connection: self.clone(),
        })
    }

    /// Ask the event loop to shut down. Idempotent and non-blocking; teardown
    /// happens on the event loop.
    pub fn close(&self) {
        if !self.shared.status.begin_closing() {
            return;
        }
        debug!(addr = %self.shared.addr, "closing strest connection");
        // A full channel means an exit is already queued.
        let _ = self.shared.exit.try_send(());
    }

    pub fn address(&self) -> &str {
        &self.shared.addr
    }

    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.state()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Transactions written and awaiting a terminal response.
    pub fn in_flight(&self) -> usize {
        self.shared.status.in_flight.load(Ordering::Acquire)
    }

    pub fn max_in_flight(&self) -> Option<usize> {
        self.shared.limiter.max_in_flight()
    }

    fn not_connected(&self) -> StrestError {
        StrestError::NotConnected(self.shared.addr.clone())
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.shared.addr)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Decode responses off the stream until EOF or a decode failure, then
/// signal the event loop to exit.
async fn run_reader<R>(
    reader: R,
    incoming: mpsc::Sender<Response>,
    exit: mpsc::Sender<()>,
    addr: String,
    max_message_size: usize,
) where
    R: AsyncRead + Unpin,
{
    match read_loop(reader, &incoming, max_message_size).await {
        Ok(()) => info!(addr = %addr, "strest connection closed by peer"),
        Err(e) => error!(addr = %addr, "read loop error: {}", e),
    }
    let _ = exit.try_send(());
}

async fn read_loop<R>(
    mut reader: R,
    incoming: &mpsc::Sender<Response>,
    max_message_size: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = MessageBuffer::<Response>::with_max_message_size(max_message_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(StrestError::Io(e)),
        };

        for response in buffer.push(&buf[..n])? {
            if incoming.send(response).await.is_err() {
                // Event loop is gone.
                return Ok(());
            }
        }
    }
}

struct EventLoop<S> {
    addr: String,
    status: Arc<Status>,
    limiter: InFlightLimiter,
    /// Used only to report ourselves on the disconnect channel.
    handle: Weak<Shared>,
    pending: HashMap<String, PendingTransaction>,
    writer: BufWriter<WriteHalf<S>>,
    write_timeout: Duration,
    outgoing_rx: mpsc::Receiver<Outgoing>,
    incoming_rx: mpsc::Receiver<Response>,
    exit_rx: mpsc::Receiver<()>,
    reader: JoinHandle<()>,
    disconnect: Option<mpsc::Sender<Connection>>,
}

impl<S> EventLoop<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                outgoing = self.outgoing_rx.recv() => match outgoing {
                    Some(outgoing) => {
                        if let Err(e) = self.send(outgoing).await {
                            error!(addr = %self.addr, "write error: {}", e);
                            break;
                        }
                    }
                    None => {
                        debug!(addr = %self.addr, "all connection handles dropped");
                        break;
                    }
                },
                incoming = self.incoming_rx.recv() => match incoming {
                    Some(response) => self.dispatch(response),
                    None => break,
                },
                _ = self.exit_rx.recv() => break,
            }
        }

        self.status.set_state(ConnectionState::Closing);
        self.cleanup().await;
    }

    /// Track the request and write it. An error here is fatal to the connection.
    async fn send(&mut self, outgoing: Outgoing) -> Result<()> {
        let Outgoing {
            request,
            results,
            errors,
            permit,
        } = outgoing;

        let bytes = match JsonCodec::encode(&request) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = errors.send(e);
                return Ok(());
            }
        };

        let txn_id = request.txn_id().to_string();
        let txn = PendingTransaction {
            results,
            errors,
            _permit: permit,
        };
        if self.pending.insert(txn_id.clone(), txn).is_some() {
            warn!(addr = %self.addr, txn_id = %txn_id, "transaction id reused while still pending");
        }
        self.status.set_in_flight(self.pending.len());

        match tokio::time::timeout(self.write_timeout, self.write_message(&bytes)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StrestError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("write deadline of {:?} exceeded", self.write_timeout),
            ))),
        }
    }

    async fn write_message(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Route a response to its transaction.
    fn dispatch(&mut self, response: Response) {
        let txn_id = response.txn_id().to_string();

        if response.is_terminal() {
            let Some(txn) = self.pending.remove(&txn_id) else {
                warn!(addr = %self.addr, txn_id = %txn_id, "received response with no pending transaction");
                return;
            };
            self.status.set_in_flight(self.pending.len());

            let PendingTransaction {
                results, _permit, ..
            } = txn;
            drop(_permit);
            if results.send(response).is_err() {
                debug!(addr = %self.addr, txn_id = %txn_id, "caller stopped listening");
            }
        } else {
            match self.pending.get(&txn_id) {
                Some(txn) => {
                    if txn.results.send(response).is_err() {
                        debug!(addr = %self.addr, txn_id = %txn_id, "caller stopped listening");
                    }
                }
                None => {
                    warn!(addr = %self.addr, txn_id = %txn_id, "received response with no pending transaction")
                }
            }
        }
    }

    async fn cleanup(mut self) {
        self.reader.abort();

        // Anything the reader decoded before the exit still belongs to a caller.
        while let Ok(response) = self.incoming_rx.try_recv() {
            self.dispatch(response);
        }

        // Bytes left in the buffer belong to a failed or abandoned write;
        // close the stream without flushing them.
        if let Ok(Err(e)) =
            tokio::time::timeout(self.write_timeout, self.writer.get_mut().shutdown()).await
        {
            debug!(addr = %self.addr, "shutdown error: {}", e);
        }

        self.limiter.close();
        self.outgoing_rx.close();

        let mut drained = 0usize;
        while let Ok(outgoing) = self.outgoing_rx.try_recv() {
            let _ = outgoing
                .errors
                .send(StrestError::ConnectionClosed(self.addr.clone()));
            drained += 1;
        }
        for (_, txn) in self.pending.drain() {
            let _ = txn
                .errors
                .send(StrestError::ConnectionClosed(self.addr.clone()));
            drained += 1;
        }

        self.status.set_in_flight(0);
        self.status.set_state(ConnectionState::Closed);
        info!(addr = %self.addr, drained, "closed strest connection");

        let (Some(disconnect), Some(shared)) = (&self.disconnect, self.handle.upgrade()) else {
            return;
        };
        match disconnect.try_send(Connection { shared }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(addr = %self.addr, "disconnect channel full, dropping notification")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
