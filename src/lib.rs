//! # strest-client
//!
//! Multiplexing TCP client for strest, a JSON request/response protocol.
//!
//! Many logical transactions share one TCP connection. Every request carries
//! a transaction id; responses come back in any order and are routed to the
//! caller that issued the id. A transaction may receive several `continue`
//! responses before a terminal one.
//!
//! ## Architecture
//!
//! - **Connection**: one event loop owns the socket writer and the table of
//!   pending transactions; a reader task decodes responses and hands them in
//! - **Client**: routes calls to the current connection and rebuilds it when
//!   a health-check ping fails or the connection drops
//!
//! ## Example
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
//!     println!("{} {}", res.status_code(), res.status_message());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod txn;

mod backpressure;
mod client;

pub use client::{Client, ClientBuilder, ClientConfig};
pub use connection::{
    Connection, ConnectionOptions, ConnectionState, ErrorSender, ResultSender, Transaction,
};
pub use error::{Result, StrestError};
pub use protocol::{Request, Response, Status, TxnAccept, TxnStatus};
pub use txn::TxnIdGenerator;
