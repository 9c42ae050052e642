//! Ping Load Generator - warm up with one sync call, then fire a burst of
//! async pings and count the answers.
//!
//! This example demonstrates:
//! - Creating a strest client with the builder pattern
//! - A synchronous call with a deadline
//! - Many async calls sharing one result channel and one error channel
//!
//! # Running
//!
//! Assumes a strest server answering `/ping`:
//!
//! ```sh
//! RUST_LOG=debug cargo run --example ping -- localhost:8009 100000
//! ```

use std::time::{Duration, Instant};

use strest_client::{Client, Request};
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set default log level to INFO, but allow RUST_LOG env var to override
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "localhost:8009".to_string());
    let total: usize = match args.next() {
        Some(n) => n.parse()?,
        None => 100_000,
    };

    let client = Client::builder(addr).max_in_flight(500).connect().await?;

    // Warm it up
    let res = client
        .call_sync(Request::new("/ping", "GET"), Duration::from_secs(10))
        .await?;
    info!("warm-up: {} {}", res.status_code(), res.status_message());

    let (results_tx, mut results) = mpsc::unbounded_channel();
    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    let start = Instant::now();

    let sender = {
        let client = client.clone();
        tokio::spawn(async move {
            for i in 0..total {
                if i % 1000 == 0 {
                    info!("sending {}", i);
                }
                client
                    .call_async(
                        Request::new("/ping", "GET"),
                        results_tx.clone(),
                        errors_tx.clone(),
                    )
                    .await;
            }
        })
    };

    let mut answered = 0;
    let mut failed = 0;
    while answered + failed < total {
        tokio::select! {
            Some(_) = results.recv() => {
                answered += 1;
                if answered % 1000 == 0 {
                    info!("received {}, elapsed {:?}", answered, start.elapsed());
                }
            }
            Some(e) = errors.recv() => {
                failed += 1;
                error!("call failed: {}", e);
            }
            else => break,
        }
    }

    sender.await?;
    info!(
        "pinged {} ({} failed) in {:?}",
        total,
        failed,
        start.elapsed()
    );

    client.close().await;
    Ok(())
}
