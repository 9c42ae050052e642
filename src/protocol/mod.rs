//! Protocol module - the strest envelope and stream decoding.
//!
//! This module implements the message layer the multiplexer relies on:
//! - [`Request`] / [`Response`] envelopes with transaction id and status
//! - [`MessageBuffer`] for decoding back-to-back JSON messages off a stream

mod message_buffer;
mod request;
mod response;

use serde::{Deserialize, Serialize};

pub use message_buffer::{MessageBuffer, DEFAULT_MAX_MESSAGE_SIZE};
pub use request::Request;
pub use response::{Response, Status, TxnStatus};

/// Protocol version written into every envelope.
pub const STREST_VERSION: f64 = 2.0;

/// Ordered parameter set (keys unique, insertion order kept).
pub type Params = serde_json::Map<String, serde_json::Value>;

fn default_version() -> f64 {
    STREST_VERSION
}

/// How many responses the caller is prepared to accept for one transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnAccept {
    /// Exactly one response; the server must not stream.
    Single,
    /// Any number of `continue` responses followed by a terminal one.
    #[default]
    Multi,
}
