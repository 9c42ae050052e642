//! JSON codec for the strest envelope.
//!
//! Messages go on the wire as bare JSON objects written back to back;
//! decoding a stream of them is handled by
//! [`MessageBuffer`](crate::protocol::MessageBuffer).
//!
//! # Example
//!
//! ```
//! use strest_client::codec::JsonCodec;
//! use strest_client::protocol::{Request, Response};
//!
//! let mut req = Request::new("/ping", "GET");
//! req.set_txn_id("rs1");
//!
//! let bytes = JsonCodec::encode(&req).unwrap();
//! let back: Request = JsonCodec::decode(&bytes).unwrap();
//! assert_eq!(back, req);
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// JSON codec for envelopes and arbitrary serde values.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    /// Decode exactly one JSON value from `bytes`.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
