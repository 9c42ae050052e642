//! In-process strest server for integration tests.
//!
//! Listens on `127.0.0.1:0`, decodes requests with the crate's own
//! `MessageBuffer`, and answers through a responder closure. A request
//! carrying a numeric `delay_ms` param is answered after that delay, so
//! responses can be made to arrive out of order.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strest_client::protocol::MessageBuffer;
use strest_client::{Request, Response, TxnStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

type Responder = Arc<dyn Fn(&Request) -> Vec<Response> + Send + Sync>;

pub struct MockServer {
    addr: String,
    accepted: Arc<AtomicUsize>,
    received: Arc<AtomicUsize>,
    drop_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Request) -> Vec<Response> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(AtomicUsize::new(0));
        let (drop_tx, _) = broadcast::channel(4);
        let responder: Responder = Arc::new(responder);

        let task = {
            let accepted = accepted.clone();
            let received = received.clone();
            let drop_tx = drop_tx.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        socket,
                        responder.clone(),
                        received.clone(),
                        drop_tx.subscribe(),
                    ));
                }
            })
        };

        Self {
            addr,
            accepted,
            received,
            drop_tx,
            task,
        }
    }

    /// Answers every request with one `completed` response echoing its params.
    pub async fn echo() -> Self {
        Self::start(|req| {
            let mut res = req.new_response();
            for (key, value) in req.params() {
                res.put(key.clone(), value.clone());
            }
            vec![res]
        })
        .await
    }

    /// Reads requests and never answers.
    pub async fn silent() -> Self {
        Self::start(|_| Vec::new()).await
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Requests decoded so far, across all connections.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Close every open connection. The listener keeps accepting.
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.drop_tx.send(());
    }
}

async fn serve(
    socket: TcpStream,
    responder: Responder,
    received: Arc<AtomicUsize>,
    mut drop_rx: broadcast::Receiver<()>,
) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Response>();

    let writer = tokio::spawn(async move {
        while let Some(res) = out_rx.recv().await {
            let bytes = serde_json::to_vec(&res).unwrap();
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buffer = MessageBuffer::<Request>::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        tokio::select! {
            _ = drop_rx.recv() => break,
            read = read_half.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let Ok(requests) = buffer.push(&chunk[..n]) else {
                    break;
                };
                for req in requests {
                    received.fetch_add(1, Ordering::SeqCst);
                    let responses = responder(&req);
                    let delay = req.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(0);
                    let out_tx = out_tx.clone();
                    if delay == 0 {
                        for res in responses {
                            let _ = out_tx.send(res);
                        }
                    } else {
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            for res in responses {
                                let _ = out_tx.send(res);
                            }
                        });
                    }
                }
            }
        }
    }

    // Dropping both halves closes the socket.
    writer.abort();
}

/// A `continue` response for `req`.
pub fn continue_response(req: &Request) -> Response {
    Response::new(req.txn_id(), TxnStatus::Continue)
}

/// Poll `condition` every 10ms until it holds or `within` elapses.
pub async fn wait_until<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
